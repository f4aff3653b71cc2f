//! Engine configuration
//!
//! Loaded from TOML. Every section has defaults, so an empty file (or no file
//! at all) yields a working configuration for the canonical 11025 Hz pipeline.

use crate::error::{Error, Result};
use crate::hashing::DELTA_BITS;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub spectral: SpectralConfig,
    pub peaks: PeakConfig,
    pub hashing: HashConfig,
    pub matching: MatchConfig,
    pub store: StoreConfig,
    pub charts: ChartConfig,
    pub logging: LoggingConfig,
}

/// Analysis window settings. Changing any of these invalidates stored fingerprints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpectralConfig {
    /// Canonical sample rate every buffer is resampled to
    pub sample_rate: u32,
    pub window_size: usize,
    pub hop_size: usize,
}

impl Default for SpectralConfig {
    fn default() -> Self {
        Self {
            sample_rate: 11025,
            window_size: 4096,
            hop_size: 2048,
        }
    }
}

impl SpectralConfig {
    /// Seconds represented by one frame step
    pub fn seconds_per_frame(&self) -> f64 {
        self.hop_size as f64 / self.sample_rate as f64
    }

    /// Number of magnitude bins per frame (DC through Nyquist)
    pub fn bin_count(&self) -> usize {
        self.window_size / 2 + 1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeakConfig {
    /// Number of logarithmically spaced frequency bands
    pub bands: usize,
    pub min_frequency: f32,
    pub max_frequency: f32,
    /// Frames on each side a candidate must dominate
    pub neighborhood_frames: usize,
    /// Absolute magnitude floor; keeps silence and padding from producing landmarks
    pub min_magnitude: f32,
    /// Candidate must exceed the band's mean magnitude by this factor
    pub band_mean_ratio: f32,
    /// Relative difference below which two frames of a band count as equal,
    /// so a held note peaks once at its start instead of wherever it wobbles highest
    pub plateau_tolerance: f32,
}

impl Default for PeakConfig {
    fn default() -> Self {
        Self {
            bands: 6,
            min_frequency: 40.0,
            max_frequency: 5000.0,
            neighborhood_frames: 2,
            min_magnitude: 0.5,
            band_mean_ratio: 1.5,
            plateau_tolerance: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashConfig {
    /// Maximum targets paired with one anchor
    pub fan_out: usize,
    pub min_delta_frames: u32,
    pub max_delta_frames: u32,
    /// Frequency extent of the target zone, in bins either side of the anchor
    pub max_bin_delta: u32,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            fan_out: 10,
            min_delta_frames: 1,
            max_delta_frames: 64,
            max_bin_delta: 1024,
        }
    }
}

/// Acceptance thresholds for the aligner. Tune against a labelled corpus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    /// The winning offset window must hold more votes than this
    pub min_hits: u32,
    /// Winner must have at least this multiple of the runner-up song's best votes
    pub min_ratio: f32,
    /// Detections scoring below this confidence are reported as no match
    pub min_confidence: f32,
    /// Frames a landmark may drift between capture and reference when the
    /// capture does not start on a hop boundary; 0 requires exact alignment
    pub frame_tolerance: u32,
    /// Shorter query clips are rejected as invalid audio
    pub min_query_seconds: f32,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            min_hits: 10,
            min_ratio: 1.5,
            min_confidence: 0.15,
            frame_tolerance: 1,
            min_query_seconds: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub redis_url: String,
    /// Prefix for every key the Redis backends write
    pub key_prefix: String,
    /// Bound on a single store call, and on all retries of it together
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub backoff_ms: u64,
    /// Lifetime of an uncommitted checksum reservation in Redis
    pub reservation_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis_url: "redis://127.0.0.1/".to_string(),
            key_prefix: "fp".to_string(),
            timeout_ms: 2000,
            max_retries: 3,
            backoff_ms: 50,
            reservation_ttl_ms: 60_000,
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    /// Offset applied to UTC capture times before bucketing by date/hour (EAT = +180)
    pub utc_offset_minutes: i32,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EngineConfig {
    /// Read, parse and validate a TOML config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "Loaded engine configuration");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.spectral;
        if s.sample_rate == 0 {
            return Err(Error::Config("spectral.sample_rate must be positive".into()));
        }
        if s.window_size < 64 || !s.window_size.is_power_of_two() {
            return Err(Error::Config(format!(
                "spectral.window_size must be a power of two >= 64, got {}",
                s.window_size
            )));
        }
        if s.hop_size == 0 || s.hop_size > s.window_size {
            return Err(Error::Config(format!(
                "spectral.hop_size must be in 1..={}, got {}",
                s.window_size, s.hop_size
            )));
        }

        let p = &self.peaks;
        let nyquist = s.sample_rate as f32 / 2.0;
        if !(p.min_frequency > 0.0 && p.min_frequency < p.max_frequency && p.max_frequency <= nyquist)
        {
            return Err(Error::Config(format!(
                "peaks frequency range must satisfy 0 < min < max <= {} Hz",
                nyquist
            )));
        }
        if p.bands == 0 || p.bands > 16 {
            return Err(Error::Config(format!("peaks.bands must be 1..=16, got {}", p.bands)));
        }
        if p.min_magnitude < 0.0 || p.band_mean_ratio < 0.0 {
            return Err(Error::Config("peaks thresholds must be non-negative".into()));
        }
        if !(0.0..0.5).contains(&p.plateau_tolerance) {
            return Err(Error::Config("peaks.plateau_tolerance must be in [0, 0.5)".into()));
        }

        let h = &self.hashing;
        if h.fan_out == 0 {
            return Err(Error::Config("hashing.fan_out must be at least 1".into()));
        }
        if h.max_bin_delta == 0 {
            return Err(Error::Config("hashing.max_bin_delta must be positive".into()));
        }
        if h.min_delta_frames == 0
            || h.min_delta_frames >= h.max_delta_frames
            || h.max_delta_frames >= (1 << DELTA_BITS)
        {
            return Err(Error::Config(format!(
                "hashing deltas must satisfy 1 <= min < max < {}",
                1u32 << DELTA_BITS
            )));
        }

        let m = &self.matching;
        if m.min_hits == 0 {
            return Err(Error::Config("matching.min_hits must be at least 1".into()));
        }
        if m.min_ratio < 1.0 {
            return Err(Error::Config("matching.min_ratio must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&m.min_confidence) {
            return Err(Error::Config("matching.min_confidence must be in [0, 1]".into()));
        }
        if m.frame_tolerance > 8 {
            return Err(Error::Config(format!(
                "matching.frame_tolerance must be at most 8, got {}",
                m.frame_tolerance
            )));
        }

        if self.store.timeout_ms == 0 {
            return Err(Error::Config("store.timeout_ms must be positive".into()));
        }
        if self.store.reservation_ttl_ms <= self.store.timeout_ms {
            return Err(Error::Config(
                "store.reservation_ttl_ms must exceed store.timeout_ms".into(),
            ));
        }
        if self.charts.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(Error::Config("charts.utc_offset_minutes out of range".into()));
        }

        Ok(())
    }
}
