//! Chart aggregation: folds identification outcomes into per-station hourly
//! counters and per-station song play tallies.

use crate::config::{ChartConfig, StoreConfig};
use crate::error::{Error, Result};
use crate::models::{Detection, Identification, SongId, SongPlays, StationHourStat};
use chrono::{DateTime, FixedOffset, NaiveDate, Timelike, Utc};
use redis::{Client, Connection, Script};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// How long Redis remembers applied capture ids; far longer than any retry
const APPLIED_TTL_SECS: u64 = 2 * 24 * 3600;

/// Incremental mean after adding `value` as the `count`-th sample
fn running_mean(mean: f64, value: f64, count: u64) -> f64 {
    mean + (value - mean) / count as f64
}

pub trait StatsStore: Send + Sync {
    /// Upserts the (station, date, hour) row: one more capture, and one more
    /// detection if `detection` is present. Returns the updated row.
    ///
    /// Idempotent per `capture_id`: recording a capture id that was already
    /// applied leaves the row unchanged, so a call whose reply was lost can be
    /// retried.
    fn record(
        &self,
        capture_id: &str,
        station: &str,
        date: NaiveDate,
        hour: u32,
        detection: Option<&Detection>,
    ) -> Result<StationHourStat>;

    fn get(&self, station: &str, date: NaiveDate, hour: u32) -> Result<Option<StationHourStat>>;

    /// Play tallies for a station, most played first
    fn song_plays(&self, station: &str) -> Result<Vec<SongPlays>>;
}

fn sort_plays(plays: &mut [SongPlays]) {
    plays.sort_by(|a, b| b.plays.cmp(&a.plays).then(a.song_id.cmp(&b.song_id)));
}

#[derive(Default)]
struct StatsTables {
    hours: HashMap<(String, NaiveDate, u32), StationHourStat>,
    plays: HashMap<(String, SongId), SongPlays>,
    applied: HashSet<String>,
}

/// Mutex-guarded in-process statistics
#[derive(Default)]
pub struct MemoryStatsStore {
    tables: Mutex<StatsTables>,
}

impl MemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Store("stats lock poisoned".to_string())
}

impl StatsStore for MemoryStatsStore {
    fn record(
        &self,
        capture_id: &str,
        station: &str,
        date: NaiveDate,
        hour: u32,
        detection: Option<&Detection>,
    ) -> Result<StationHourStat> {
        let mut tables = self.tables.lock().map_err(poisoned)?;
        let key = (station.to_string(), date, hour);
        if !tables.applied.insert(capture_id.to_string()) {
            return Ok(tables
                .hours
                .get(&key)
                .cloned()
                .unwrap_or_else(|| StationHourStat::empty(station, date, hour)));
        }

        let stat = tables
            .hours
            .entry(key)
            .or_insert_with(|| StationHourStat::empty(station, date, hour));
        stat.captures += 1;
        if let Some(detection) = detection {
            stat.detections += 1;
            stat.avg_confidence = running_mean(
                stat.avg_confidence,
                detection.confidence as f64,
                stat.detections,
            );
        }
        let updated = stat.clone();

        if let Some(detection) = detection {
            let plays = tables
                .plays
                .entry((station.to_string(), detection.song_id))
                .or_insert_with(|| SongPlays {
                    station: station.to_string(),
                    song_id: detection.song_id,
                    plays: 0,
                    avg_confidence: 0.0,
                });
            plays.plays += 1;
            plays.avg_confidence =
                running_mean(plays.avg_confidence, detection.confidence as f64, plays.plays);
        }

        Ok(updated)
    }

    fn get(&self, station: &str, date: NaiveDate, hour: u32) -> Result<Option<StationHourStat>> {
        let tables = self.tables.lock().map_err(poisoned)?;
        Ok(tables.hours.get(&(station.to_string(), date, hour)).cloned())
    }

    fn song_plays(&self, station: &str) -> Result<Vec<SongPlays>> {
        let tables = self.tables.lock().map_err(poisoned)?;
        let mut plays: Vec<SongPlays> = tables
            .plays
            .values()
            .filter(|p| p.station == station)
            .cloned()
            .collect();
        sort_plays(&mut plays);
        Ok(plays)
    }
}

/// Upserts an hour row and, for detections, the song's play tally in one
/// server-side step so concurrent recorders cannot interleave. KEYS[3] holds
/// the capture ids already applied to the row.
const RECORD_SCRIPT: &str = r#"
if redis.call('SADD', KEYS[3], ARGV[4]) == 0 then
  return redis.call('HGETALL', KEYS[1])
end
redis.call('EXPIRE', KEYS[3], ARGV[5])
redis.call('HINCRBY', KEYS[1], 'captures', 1)
if ARGV[1] == '1' then
  local detections = redis.call('HINCRBY', KEYS[1], 'detections', 1)
  local avg = tonumber(redis.call('HGET', KEYS[1], 'avg_confidence') or '0')
  avg = avg + (tonumber(ARGV[2]) - avg) / detections
  redis.call('HSET', KEYS[1], 'avg_confidence', string.format('%.17g', avg))
  local plays = redis.call('HINCRBY', KEYS[2], ARGV[3] .. ':plays', 1)
  local pavg = tonumber(redis.call('HGET', KEYS[2], ARGV[3] .. ':avg') or '0')
  pavg = pavg + (tonumber(ARGV[2]) - pavg) / plays
  redis.call('HSET', KEYS[2], ARGV[3] .. ':avg', string.format('%.17g', pavg))
end
return redis.call('HGETALL', KEYS[1])
"#;

/// Statistics kept in Redis hashes next to the fingerprint index
pub struct RedisStatsStore {
    client: Client,
    prefix: String,
    timeout: Duration,
    script: Script,
}

impl RedisStatsStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::open(config.redis_url.as_str())
            .map_err(|e| Error::Config(format!("Invalid redis_url: {}", e)))?;
        Ok(Self {
            client,
            prefix: config.key_prefix.clone(),
            timeout: config.timeout(),
            script: Script::new(RECORD_SCRIPT),
        })
    }

    fn connection(&self) -> Result<Connection> {
        let conn = self.client.get_connection_with_timeout(self.timeout)?;
        conn.set_read_timeout(Some(self.timeout))?;
        conn.set_write_timeout(Some(self.timeout))?;
        Ok(conn)
    }

    fn hour_key(&self, station: &str, date: NaiveDate, hour: u32) -> String {
        format!("{}:stats:{}:{}:{:02}", self.prefix, station, date, hour)
    }

    fn applied_key(&self, station: &str, date: NaiveDate, hour: u32) -> String {
        format!("{}:applied", self.hour_key(station, date, hour))
    }

    fn plays_key(&self, station: &str) -> String {
        format!("{}:plays:{}", self.prefix, station)
    }
}

fn parse_field<T: std::str::FromStr>(fields: &HashMap<String, String>, name: &str) -> Result<T> {
    match fields.get(name) {
        None => T::from_str("0").map_err(|_| Error::Store(format!("no default for {}", name))),
        Some(raw) => raw
            .parse()
            .map_err(|_| Error::Store(format!("malformed stats field {}={}", name, raw))),
    }
}

fn stat_from_fields(
    station: &str,
    date: NaiveDate,
    hour: u32,
    fields: &HashMap<String, String>,
) -> Result<StationHourStat> {
    Ok(StationHourStat {
        station: station.to_string(),
        date,
        hour,
        captures: parse_field(fields, "captures")?,
        detections: parse_field(fields, "detections")?,
        avg_confidence: parse_field(fields, "avg_confidence")?,
    })
}

impl StatsStore for RedisStatsStore {
    fn record(
        &self,
        capture_id: &str,
        station: &str,
        date: NaiveDate,
        hour: u32,
        detection: Option<&Detection>,
    ) -> Result<StationHourStat> {
        let mut conn = self.connection()?;
        let (flag, confidence, song_id) = match detection {
            Some(d) => ("1", d.confidence as f64, d.song_id),
            None => ("0", 0.0, 0),
        };
        let fields: HashMap<String, String> = self
            .script
            .key(self.hour_key(station, date, hour))
            .key(self.plays_key(station))
            .key(self.applied_key(station, date, hour))
            .arg(flag)
            .arg(confidence)
            .arg(song_id)
            .arg(capture_id)
            .arg(APPLIED_TTL_SECS)
            .invoke(&mut conn)?;
        stat_from_fields(station, date, hour, &fields)
    }

    fn get(&self, station: &str, date: NaiveDate, hour: u32) -> Result<Option<StationHourStat>> {
        let mut conn = self.connection()?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.hour_key(station, date, hour))
            .query(&mut conn)?;
        if fields.is_empty() {
            return Ok(None);
        }
        stat_from_fields(station, date, hour, &fields).map(Some)
    }

    fn song_plays(&self, station: &str) -> Result<Vec<SongPlays>> {
        let mut conn = self.connection()?;
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.plays_key(station))
            .query(&mut conn)?;

        let mut by_song: HashMap<SongId, SongPlays> = HashMap::new();
        for (field, value) in &fields {
            let Some((id, kind)) = field.split_once(':') else {
                continue;
            };
            let song_id: SongId = id
                .parse()
                .map_err(|_| Error::Store(format!("malformed plays field {}", field)))?;
            let entry = by_song.entry(song_id).or_insert_with(|| SongPlays {
                station: station.to_string(),
                song_id,
                plays: 0,
                avg_confidence: 0.0,
            });
            let malformed = || Error::Store(format!("malformed plays field {}={}", field, value));
            match kind {
                "plays" => entry.plays = value.parse().map_err(|_| malformed())?,
                "avg" => entry.avg_confidence = value.parse().map_err(|_| malformed())?,
                _ => {}
            }
        }

        let mut plays: Vec<SongPlays> = by_song.into_values().collect();
        sort_plays(&mut plays);
        Ok(plays)
    }
}

/// Buckets captures by the stations' local date and hour
pub struct ChartAggregator {
    store: Arc<dyn StatsStore>,
    utc_offset: FixedOffset,
}

impl ChartAggregator {
    pub fn new(store: Arc<dyn StatsStore>, config: &ChartConfig) -> Result<Self> {
        let utc_offset = FixedOffset::east_opt(config.utc_offset_minutes * 60).ok_or_else(|| {
            Error::Config(format!(
                "utc_offset_minutes {} out of range",
                config.utc_offset_minutes
            ))
        })?;
        Ok(Self { store, utc_offset })
    }

    /// Local (date, hour) slot a capture belongs to
    pub fn slot(&self, captured_at: DateTime<Utc>) -> (NaiveDate, u32) {
        let local = captured_at.with_timezone(&self.utc_offset);
        (local.date_naive(), local.hour())
    }

    /// Counts one completed identification attempt
    ///
    /// # Arguments
    /// * `capture_id` - Unique per capture; repeating it does not count the capture twice
    /// * `station` - Station the capture came from
    /// * `captured_at` - Capture time, bucketed in local time
    /// * `outcome` - Result of the identification
    ///
    /// # Returns
    /// The station's updated row for that hour
    pub fn record(
        &self,
        capture_id: &str,
        station: &str,
        captured_at: DateTime<Utc>,
        outcome: &Identification,
    ) -> Result<StationHourStat> {
        let (date, hour) = self.slot(captured_at);
        let stat = self
            .store
            .record(capture_id, station, date, hour, outcome.detection())?;
        tracing::debug!(
            station,
            %date,
            hour,
            captures = stat.captures,
            detections = stat.detections,
            "Updated station hour stats"
        );
        Ok(stat)
    }

    pub fn station_hour(&self, station: &str, date: NaiveDate, hour: u32) -> Result<StationHourStat> {
        if hour > 23 {
            return Err(Error::NotFound(format!("hour {} does not exist", hour)));
        }
        self.store.get(station, date, hour)?.ok_or_else(|| {
            Error::NotFound(format!("no captures for {} on {} at {:02}:00", station, date, hour))
        })
    }

    pub fn song_plays(&self, station: &str) -> Result<Vec<SongPlays>> {
        self.store.song_plays(station)
    }
}
