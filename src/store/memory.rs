use super::{asset_checksum, build_song, FingerprintStore};
use crate::error::{Error, Result};
use crate::models::{FingerprintSet, Posting, Song, SongId, SongMetadata};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError, RwLock};

const SHARD_COUNT: usize = 64;

type Shard = RwLock<HashMap<u32, Vec<Posting>>>;

/// State of a checksum that some ingest has claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reservation {
    /// Postings are being written; the ingest may still roll back
    Pending(SongId),
    Committed(SongId),
}

/// In-process fingerprint index.
///
/// Postings live in hash-sharded maps so an ingest only write-locks one shard
/// at a time. A song becomes visible when its row lands in `songs`; lookups
/// drop postings of songs that have not been committed, so readers never see
/// a partial posting set.
///
/// An ingest whose checksum is pending in another thread blocks until that
/// ingest settles: a commit makes it a duplicate, a roll-back lets it proceed.
pub struct MemoryStore {
    shards: Vec<Shard>,
    songs: RwLock<HashMap<SongId, Song>>,
    checksums: Mutex<HashMap<String, Reservation>>,
    /// Signalled whenever a pending reservation commits or is released
    settled: Condvar,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store; song ids start at 1
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
            songs: RwLock::new(HashMap::new()),
            checksums: Mutex::new(HashMap::new()),
            settled: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn shard_of(hash: u32) -> usize {
        // Low bits carry the frame delta, which is poorly spread; mix first
        (hash.wrapping_mul(0x9E37_79B1) >> 26) as usize % SHARD_COUNT
    }

    /// Total postings currently held, committed or not
    ///
    /// # Returns
    /// The number of `(hash, posting)` entries across all shards, including
    /// those of ingests still in flight
    pub fn posting_count(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .map(Vec::len)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Claims `checksum` for a new song id, waiting out any ingest of the
    /// same checksum that is still pending
    fn reserve(&self, checksum: &str) -> Result<SongId> {
        let mut checksums = self.checksums.lock().map_err(poisoned)?;
        loop {
            match checksums.get(checksum).copied() {
                Some(Reservation::Committed(song_id)) => {
                    return Err(Error::DuplicateAsset {
                        checksum: checksum.to_string(),
                        song_id,
                    })
                }
                Some(Reservation::Pending(song_id)) => {
                    tracing::debug!(song_id, checksum, "Waiting on in-flight ingest of the same asset");
                    checksums = self.settled.wait(checksums).map_err(poisoned)?;
                }
                None => break,
            }
        }
        let song_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        checksums.insert(checksum.to_string(), Reservation::Pending(song_id));
        Ok(song_id)
    }

    fn append_postings(&self, song_id: SongId, fingerprints: &FingerprintSet) -> Result<()> {
        let mut by_shard: Vec<Vec<(u32, Posting)>> = vec![Vec::new(); SHARD_COUNT];
        for fp in &fingerprints.fingerprints {
            by_shard[Self::shard_of(fp.hash)].push((
                fp.hash,
                Posting {
                    song_id,
                    offset: fp.offset,
                },
            ));
        }

        for (shard, postings) in self.shards.iter().zip(by_shard) {
            if postings.is_empty() {
                continue;
            }
            let mut index = shard.write().map_err(poisoned)?;
            for (hash, posting) in postings {
                index.entry(hash).or_default().push(posting);
            }
        }
        Ok(())
    }

    /// Makes a song and its postings visible and wakes waiting duplicates
    fn commit(&self, checksum: &str, song: &Song) -> Result<()> {
        self.songs
            .write()
            .map_err(poisoned)?
            .insert(song.song_id, song.clone());
        self.checksums
            .lock()
            .map_err(poisoned)?
            .insert(checksum.to_string(), Reservation::Committed(song.song_id));
        self.settled.notify_all();
        Ok(())
    }

    /// Removes every trace of an ingest that did not commit
    fn roll_back(&self, song_id: SongId, checksum: &str) {
        for shard in &self.shards {
            let mut index = shard.write().unwrap_or_else(PoisonError::into_inner);
            index.retain(|_, postings| {
                postings.retain(|p| p.song_id != song_id);
                !postings.is_empty()
            });
        }
        self.songs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&song_id);
        let mut checksums = self.checksums.lock().unwrap_or_else(PoisonError::into_inner);
        if checksums.get(checksum) == Some(&Reservation::Pending(song_id)) {
            checksums.remove(checksum);
        }
        drop(checksums);
        self.settled.notify_all();
        tracing::warn!(song_id, checksum, "Rolled back partial ingest");
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Store("memory store lock poisoned".to_string())
}

impl FingerprintStore for MemoryStore {
    fn ingest(&self, metadata: &SongMetadata, fingerprints: &FingerprintSet) -> Result<Song> {
        let checksum = asset_checksum(metadata, fingerprints);
        let song_id = self.reserve(checksum)?;
        let song = build_song(song_id, metadata, fingerprints);

        let written = self
            .append_postings(song_id, fingerprints)
            .and_then(|()| self.commit(checksum, &song));
        if let Err(err) = written {
            self.roll_back(song_id, checksum);
            return Err(err);
        }

        tracing::debug!(song_id, postings = song.total_hashes, "Committed song");
        Ok(song)
    }

    fn lookup(&self, hashes: &HashSet<u32>) -> Result<HashMap<u32, Vec<Posting>>> {
        let mut by_shard: Vec<Vec<u32>> = vec![Vec::new(); SHARD_COUNT];
        for &hash in hashes {
            by_shard[Self::shard_of(hash)].push(hash);
        }

        let songs = self.songs.read().map_err(poisoned)?;
        let mut results = HashMap::new();
        for (shard, wanted) in self.shards.iter().zip(by_shard) {
            if wanted.is_empty() {
                continue;
            }
            let index = shard.read().map_err(poisoned)?;
            for hash in wanted {
                let Some(postings) = index.get(&hash) else {
                    continue;
                };
                let committed: Vec<Posting> = postings
                    .iter()
                    .filter(|p| songs.contains_key(&p.song_id))
                    .copied()
                    .collect();
                if !committed.is_empty() {
                    results.insert(hash, committed);
                }
            }
        }
        Ok(results)
    }

    fn get_song(&self, song_id: SongId) -> Result<Song> {
        self.songs
            .read()
            .map_err(poisoned)?
            .get(&song_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("song {}", song_id)))
    }

    fn find_by_checksum(&self, checksum: &str) -> Result<Option<Song>> {
        let song_id = match self.checksums.lock().map_err(poisoned)?.get(checksum) {
            Some(&Reservation::Committed(id)) => id,
            Some(&Reservation::Pending(_)) | None => return Ok(None),
        };
        Ok(self.songs.read().map_err(poisoned)?.get(&song_id).cloned())
    }

    fn song_count(&self) -> Result<usize> {
        Ok(self.songs.read().map_err(poisoned)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Fingerprint;
    use std::thread;
    use std::time::Duration;

    fn set(checksum: &str, hashes: &[(u32, u32)]) -> FingerprintSet {
        FingerprintSet {
            fingerprints: hashes
                .iter()
                .map(|&(hash, offset)| Fingerprint { hash, offset })
                .collect(),
            frame_count: 100,
            duration: 18.5,
            checksum: checksum.to_string(),
        }
    }

    #[test]
    fn ingest_then_lookup_returns_postings() {
        let store = MemoryStore::new();
        let song = store
            .ingest(
                &SongMetadata::new("Nkwagala", "Spice Diana"),
                &set("a", &[(10, 0), (10, 5), (11, 7)]),
            )
            .unwrap();
        assert_eq!(song.total_hashes, 3);

        let hits = store.lookup(&HashSet::from([10, 11, 999])).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[&10].len(), 2);
        assert_eq!(
            hits[&11],
            vec![Posting {
                song_id: song.song_id,
                offset: 7
            }]
        );
        assert!(!hits.contains_key(&999));
    }

    #[test]
    fn duplicate_checksum_is_rejected_without_changes() {
        let store = MemoryStore::new();
        let first = store
            .ingest(&SongMetadata::new("Tweyagale", "Sheebah"), &set("same", &[(1, 0)]))
            .unwrap();
        let before = store.posting_count();

        let err = store
            .ingest(&SongMetadata::new("Tweyagale (copy)", "Sheebah"), &set("same", &[(1, 0), (2, 1)]))
            .unwrap_err();
        match err {
            Error::DuplicateAsset { song_id, .. } => assert_eq!(song_id, first.song_id),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.posting_count(), before);
        assert_eq!(store.song_count().unwrap(), 1);
    }

    #[test]
    fn uncommitted_postings_are_invisible() {
        let store = MemoryStore::new();
        let song_id = store.reserve("pending").unwrap();
        store
            .append_postings(song_id, &set("pending", &[(42, 3)]))
            .unwrap();

        assert!(store.lookup(&HashSet::from([42])).unwrap().is_empty());
        assert!(store.find_by_checksum("pending").unwrap().is_none());

        store.roll_back(song_id, "pending");
        assert_eq!(store.posting_count(), 0);
        // Reservation released, so the asset can be ingested again
        assert!(store
            .ingest(&SongMetadata::new("Retry", "Artist"), &set("pending", &[(42, 3)]))
            .is_ok());
    }

    #[test]
    fn duplicate_of_in_flight_ingest_waits_for_its_commit() {
        let store = MemoryStore::new();
        let metadata = SongMetadata::new("Gutamiiza", "Azawi");
        let fingerprints = set("wave", &[(5, 1), (6, 2)]);
        let song_id = store.reserve("wave").unwrap();
        store.append_postings(song_id, &fingerprints).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| store.ingest(&SongMetadata::new("Copy", "Azawi"), &set("wave", &[(5, 1)])));
            thread::sleep(Duration::from_millis(50));
            assert!(!waiter.is_finished());

            store
                .commit("wave", &build_song(song_id, &metadata, &fingerprints))
                .unwrap();
            match waiter.join().unwrap() {
                Err(Error::DuplicateAsset { song_id: existing, .. }) => assert_eq!(existing, song_id),
                other => panic!("expected duplicate, got {other:?}"),
            }
        });
        assert_eq!(store.song_count().unwrap(), 1);
        assert_eq!(store.posting_count(), 2);
    }

    #[test]
    fn duplicate_of_rolled_back_ingest_takes_over() {
        let store = MemoryStore::new();
        let song_id = store.reserve("wave").unwrap();
        store.append_postings(song_id, &set("wave", &[(5, 1)])).unwrap();

        thread::scope(|s| {
            let waiter = s.spawn(|| store.ingest(&SongMetadata::new("Second", "Azawi"), &set("wave", &[(9, 4)])));
            thread::sleep(Duration::from_millis(50));
            assert!(!waiter.is_finished());

            store.roll_back(song_id, "wave");
            let song = waiter.join().unwrap().unwrap();
            assert_ne!(song.song_id, song_id);
            assert_eq!(store.find_by_checksum("wave").unwrap(), Some(song));
        });
        assert!(store.lookup(&HashSet::from([5])).unwrap().is_empty());
        assert_eq!(store.lookup(&HashSet::from([9])).unwrap().len(), 1);
    }

    #[test]
    fn get_song_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.get_song(5), Err(Error::NotFound(_))));
    }

    #[test]
    fn find_by_checksum_returns_committed_song() {
        let store = MemoryStore::new();
        let song = store
            .ingest(&SongMetadata::new("Kyarenga", "Bobi Wine"), &set("k", &[(3, 1)]))
            .unwrap();
        assert_eq!(store.find_by_checksum("k").unwrap(), Some(song));
        assert_eq!(store.find_by_checksum("other").unwrap(), None);
    }

    #[test]
    fn shards_cover_full_range() {
        for hash in [0u32, 1, 4095, 0xFFFF_FFFF, 0x8000_0000] {
            assert!(MemoryStore::shard_of(hash) < SHARD_COUNT);
        }
    }
}
