//! Fingerprint store: hash → postings index plus song metadata
//!
//! Backends must make a song's postings visible all at once, together with
//! its [`Song`] row, and must serialize ingest per checksum (first writer wins).

pub mod memory;
pub mod redis;
pub mod retry;

use crate::error::Result;
use crate::models::{FingerprintSet, Posting, Song, SongId, SongMetadata};
use std::collections::{HashMap, HashSet};

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::retry::{with_retry, RetryPolicy};

pub trait FingerprintStore: Send + Sync {
    /// Atomically adds a song and all of its postings.
    ///
    /// Returns `Error::DuplicateAsset` without touching the index when a
    /// committed song has the same checksum. While another ingest of the
    /// checksum is still in flight the backend either waits for it to settle
    /// or fails with a retryable `Error::StoreUnavailable`; it never reports a
    /// duplicate of a song that may yet roll back.
    fn ingest(&self, metadata: &SongMetadata, fingerprints: &FingerprintSet) -> Result<Song>;

    /// Batched multi-get. Hashes without postings are simply absent from the result.
    fn lookup(&self, hashes: &HashSet<u32>) -> Result<HashMap<u32, Vec<Posting>>>;

    fn get_song(&self, song_id: SongId) -> Result<Song>;

    /// Committed song with this checksum, if any
    fn find_by_checksum(&self, checksum: &str) -> Result<Option<Song>>;

    fn song_count(&self) -> Result<usize>;
}

/// Checksum that identifies the asset: caller-supplied file checksum, else the PCM checksum
pub fn asset_checksum<'a>(metadata: &'a SongMetadata, fingerprints: &'a FingerprintSet) -> &'a str {
    metadata
        .checksum
        .as_deref()
        .unwrap_or(fingerprints.checksum.as_str())
}

pub(crate) fn build_song(
    song_id: SongId,
    metadata: &SongMetadata,
    fingerprints: &FingerprintSet,
) -> Song {
    Song {
        song_id,
        title: metadata.title.clone(),
        artist: metadata.artist.clone(),
        duration: fingerprints.duration,
        duration_frames: fingerprints.frame_count,
        total_hashes: fingerprints.len() as u64,
        file_checksum: asset_checksum(metadata, fingerprints).to_string(),
    }
}
