pub mod aggregator;
pub mod audio;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod hashing;
pub mod matcher;
pub mod models;
pub mod peaks;
pub mod spectrogram;
pub mod store;

pub use aggregator::{ChartAggregator, MemoryStatsStore, RedisStatsStore, StatsStore};
pub use audio::{AudioLoader, PcmBuffer};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use fingerprint::AudioFingerprinter;
pub use models::{Detection, Identification, Song, SongMetadata, StationHourStat};
pub use store::{FingerprintStore, MemoryStore, RedisStore};
