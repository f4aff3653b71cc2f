//! Error types for the fingerprinting engine
//!
//! `NoMatch` is deliberately absent: an unidentified clip is a valid outcome
//! and is reported through [`crate::models::Identification`].

use thiserror::Error;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Content with this checksum is already in the catalog
    #[error("Duplicate asset: checksum {checksum} already ingested as song {song_id}")]
    DuplicateAsset { checksum: String, song_id: u64 },

    /// Requested song or statistics row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transient store failure (connection, timeout). Safe to retry.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Store answered but the request failed (bad data, protocol error)
    #[error("Store error: {0}")]
    Store(String),

    /// Malformed or too-short audio input
    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// True only for failures that a bounded retry may clear
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::StoreUnavailable(_))
    }

    /// True when the error is the idempotent re-ingest outcome
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Error::DuplicateAsset { .. })
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout()
            || err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            Error::StoreUnavailable(err.to_string())
        } else {
            Error::Store(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_store_unavailable_is_retryable() {
        assert!(Error::StoreUnavailable("timeout".into()).is_retryable());
        assert!(!Error::NotFound("song 3".into()).is_retryable());
        assert!(!Error::InvalidAudio("empty".into()).is_retryable());
        assert!(!Error::DuplicateAsset {
            checksum: "ab".into(),
            song_id: 1
        }
        .is_retryable());
    }

    #[test]
    fn duplicate_message_names_existing_song() {
        let err = Error::DuplicateAsset {
            checksum: "deadbeef".into(),
            song_id: 42,
        };
        assert!(err.is_duplicate());
        assert!(err.to_string().contains("42"));
    }
}
