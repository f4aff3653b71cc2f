use super::{asset_checksum, build_song, FingerprintStore};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{FingerprintSet, Posting, Song, SongId, SongMetadata};
use redis::{Client, Commands, Connection, Script};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Manages the fingerprint index in Redis
///
/// # Key layout (all under `{prefix}:`)
/// - `song_counter` - INCR source for song ids
/// - `song:{id}` - song metadata as JSON
/// - `songs` - set of committed song ids
/// - `checksum:{sha}` - song id reserved for that asset (SET NX, first writer wins)
/// - `hash:{hash}` - list of packed postings `(song_id << 32) | offset`
///
/// A song's postings, metadata and membership in `songs` are written in one
/// MULTI/EXEC transaction, so readers see all of them or none. The checksum
/// reservation is taken with a TTL that the same transaction removes, so an
/// ingest that dies before EXEC frees its asset once the TTL runs out.
pub struct RedisStore {
    client: Client,
    prefix: String,
    timeout: Duration,
    reservation_ttl_ms: u64,
    release: Script,
}

/// Deletes a reservation only while it still names the releasing ingest
const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Packs a posting into the integer stored in a hash list
pub fn pack_posting(song_id: SongId, offset: u32) -> u64 {
    (song_id << 32) | offset as u64
}

pub fn unpack_posting(packed: u64) -> Posting {
    Posting {
        song_id: packed >> 32,
        offset: (packed & 0xFFFF_FFFF) as u32,
    }
}

impl RedisStore {
    /// Creates a store for `redis_url`. No connection is made until first use.
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| Error::Config(format!("Invalid redis_url: {}", e)))?;
        Ok(RedisStore {
            client,
            prefix: config.key_prefix.clone(),
            timeout: config.timeout(),
            reservation_ttl_ms: config.reservation_ttl_ms,
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    /// Connection with connect, read and write bounded by the store timeout
    fn connection(&self) -> Result<Connection> {
        let conn = self.client.get_connection_with_timeout(self.timeout)?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        Ok(conn)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    fn song_key(&self, song_id: SongId) -> String {
        format!("{}:song:{}", self.prefix, song_id)
    }

    fn hash_key(&self, hash: u32) -> String {
        format!("{}:hash:{}", self.prefix, hash)
    }

    fn checksum_key(&self, checksum: &str) -> String {
        format!("{}:checksum:{}", self.prefix, checksum)
    }

    /// Error for an ingest that found its checksum already reserved
    ///
    /// # Returns
    /// `DuplicateAsset` when the holder is committed; a retryable
    /// `StoreUnavailable` while the holder is still in flight or its
    /// reservation lapsed between the two reads
    fn reservation_conflict(&self, conn: &mut Connection, checksum: &str, checksum_key: &str) -> Error {
        let holder: Option<SongId> = match conn.get(checksum_key) {
            Ok(holder) => holder,
            Err(e) => return e.into(),
        };
        let Some(holder) = holder else {
            return Error::StoreUnavailable(format!("reservation for {} lapsed during ingest", checksum));
        };
        match conn.exists::<_, bool>(self.song_key(holder)) {
            Ok(true) => Error::DuplicateAsset {
                checksum: checksum.to_string(),
                song_id: holder,
            },
            Ok(false) => Error::StoreUnavailable(format!(
                "asset {} is being ingested as song {}",
                checksum, holder
            )),
            Err(e) => e.into(),
        }
    }

    /// Resolves a commit transaction that returned an error
    ///
    /// The error may come after the server applied EXEC (a timed-out reply),
    /// so the song row decides the outcome rather than the error.
    ///
    /// # Arguments
    /// * `song` - Song the transaction was writing
    /// * `checksum_key` - Reservation taken for it
    /// * `err` - Error the transaction returned
    ///
    /// # Returns
    /// The song if it was committed, `err` otherwise
    fn settle_failed_commit(&self, song: Song, checksum_key: &str, err: Error) -> Result<Song> {
        let committed = self.connection().and_then(|mut conn| {
            conn.exists::<_, bool>(self.song_key(song.song_id))
                .map_err(Error::from)
        });
        match committed {
            Ok(true) => {
                tracing::warn!(song_id = song.song_id, error = %err, "Commit reply lost; song is stored");
                Ok(song)
            }
            Ok(false) => {
                self.release_reservation(checksum_key, song.song_id);
                Err(err)
            }
            Err(check) => {
                tracing::error!(
                    song_id = song.song_id,
                    error = %check,
                    "Commit outcome unknown; reservation left to expire"
                );
                Err(err)
            }
        }
    }

    fn release_reservation(&self, checksum_key: &str, song_id: SongId) {
        let released: Result<i64> = self.connection().and_then(|mut conn| {
            self.release
                .key(checksum_key)
                .arg(song_id)
                .invoke(&mut conn)
                .map_err(Error::from)
        });
        if let Err(e) = released {
            tracing::error!(key = checksum_key, error = %e, "Failed to release checksum reservation");
        }
    }
}

impl FingerprintStore for RedisStore {
    fn ingest(&self, metadata: &SongMetadata, fingerprints: &FingerprintSet) -> Result<Song> {
        let mut conn = self.connection()?;
        let checksum = asset_checksum(metadata, fingerprints);
        let checksum_key = self.checksum_key(checksum);

        let song_id: SongId = conn.incr(self.key("song_counter"), 1)?;
        let reserved: Option<String> = redis::cmd("SET")
            .arg(&checksum_key)
            .arg(song_id)
            .arg("NX")
            .arg("PX")
            .arg(self.reservation_ttl_ms)
            .query(&mut conn)?;
        if reserved.is_none() {
            return Err(self.reservation_conflict(&mut conn, checksum, &checksum_key));
        }

        let song = build_song(song_id, metadata, fingerprints);
        let song_json = serde_json::to_string(&song)?;

        // Group postings per hash so each key gets one RPUSH
        let mut by_hash: HashMap<u32, Vec<u64>> = HashMap::new();
        for fp in &fingerprints.fingerprints {
            by_hash
                .entry(fp.hash)
                .or_default()
                .push(pack_posting(song_id, fp.offset));
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (hash, postings) in &by_hash {
            pipe.rpush(self.hash_key(*hash), postings).ignore();
        }
        pipe.set(self.song_key(song_id), song_json).ignore();
        pipe.sadd(self.key("songs"), song_id).ignore();
        pipe.persist(&checksum_key).ignore();

        if let Err(e) = pipe.query::<()>(&mut conn) {
            return self.settle_failed_commit(song, &checksum_key, e.into());
        }

        tracing::info!(
            song_id,
            title = %song.title,
            artist = %song.artist,
            hashes = song.total_hashes,
            "Stored song in redis"
        );
        Ok(song)
    }

    fn lookup(&self, hashes: &HashSet<u32>) -> Result<HashMap<u32, Vec<Posting>>> {
        if hashes.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.connection()?;
        let hashes: Vec<u32> = hashes.iter().copied().collect();

        let mut pipe = redis::pipe();
        for hash in &hashes {
            pipe.lrange(self.hash_key(*hash), 0, -1);
        }
        let lists: Vec<Vec<u64>> = pipe.query(&mut conn)?;

        Ok(hashes
            .into_iter()
            .zip(lists)
            .filter(|(_, packed)| !packed.is_empty())
            .map(|(hash, packed)| (hash, packed.into_iter().map(unpack_posting).collect()))
            .collect())
    }

    fn get_song(&self, song_id: SongId) -> Result<Song> {
        let mut conn = self.connection()?;
        let json: Option<String> = conn.get(self.song_key(song_id))?;
        match json {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(Error::NotFound(format!("song {}", song_id))),
        }
    }

    fn find_by_checksum(&self, checksum: &str) -> Result<Option<Song>> {
        let mut conn = self.connection()?;
        let song_id: Option<SongId> = conn.get(self.checksum_key(checksum))?;
        let Some(song_id) = song_id else {
            return Ok(None);
        };
        // Reserved but not yet committed reads as absent
        let json: Option<String> = conn.get(self.song_key(song_id))?;
        json.map(|j| serde_json::from_str(&j).map_err(Error::from))
            .transpose()
    }

    fn song_count(&self) -> Result<usize> {
        let mut conn = self.connection()?;
        Ok(conn.scard(self.key("songs"))?)
    }
}
