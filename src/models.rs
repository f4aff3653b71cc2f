use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub type SongId = u64;

/// Caller-supplied description of a song being ingested
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SongMetadata {
    pub title: String,
    pub artist: String,
    /// File-level checksum from the decoder; the PCM checksum is used when absent
    #[serde(default)]
    pub checksum: Option<String>,
}

impl SongMetadata {
    pub fn new(title: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            artist: artist.into(),
            checksum: None,
        }
    }
}

/// A catalog entry. Written once, together with all of its postings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Song {
    pub song_id: SongId,
    pub title: String,
    pub artist: String,
    /// Duration in seconds at the canonical sample rate
    pub duration: f64,
    /// Number of analysis frames; every posting offset is below this
    pub duration_frames: u32,
    /// Fingerprints generated at ingest, used to normalize confidence
    pub total_hashes: u64,
    pub file_checksum: String,
}

/// One anchor/target pair: packed hash plus the anchor's frame index
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub hash: u32,
    pub offset: u32,
}

/// Index entry for a hash: which song, and where in it
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Posting {
    pub song_id: SongId,
    pub offset: u32,
}

/// Output of the fingerprinting pipeline for one buffer
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FingerprintSet {
    pub fingerprints: Vec<Fingerprint>,
    pub frame_count: u32,
    /// Seconds of canonical-rate audio analysed
    pub duration: f64,
    /// SHA-256 of the canonical-rate samples
    pub checksum: String,
}

impl FingerprintSet {
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// A positive identification of one capture
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Detection {
    pub song_id: SongId,
    /// Aligned hits normalized by the smaller fingerprint count, in [0, 1]
    pub confidence: f32,
    /// Position of the capture's start within the reference track
    pub offset_seconds: f64,
    pub station: String,
    pub captured_at: DateTime<Utc>,
    /// Votes in the winning offset bucket
    pub aligned_hits: u32,
}

/// Result of a completed identification. Store failures are errors, not `NoMatch`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Identification {
    Match(Detection),
    NoMatch,
}

impl Identification {
    pub fn detection(&self) -> Option<&Detection> {
        match self {
            Identification::Match(detection) => Some(detection),
            Identification::NoMatch => None,
        }
    }

    pub fn is_match(&self) -> bool {
        matches!(self, Identification::Match(_))
    }
}

/// Per-station, per-hour monitoring counters
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StationHourStat {
    pub station: String,
    pub date: NaiveDate,
    pub hour: u32,
    /// Every completed identification attempt
    pub captures: u64,
    /// Attempts that produced a detection
    pub detections: u64,
    /// Running mean of detection confidence
    pub avg_confidence: f64,
}

impl StationHourStat {
    pub fn empty(station: &str, date: NaiveDate, hour: u32) -> Self {
        Self {
            station: station.to_string(),
            date,
            hour,
            captures: 0,
            detections: 0,
            avg_confidence: 0.0,
        }
    }
}

/// Play tally of one song on one station, read by the external chart ranking
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct SongPlays {
    pub station: String,
    pub song_id: SongId,
    pub plays: u64,
    pub avg_confidence: f64,
}
