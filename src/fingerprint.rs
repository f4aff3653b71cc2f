use crate::aggregator::{ChartAggregator, MemoryStatsStore, RedisStatsStore, StatsStore};
use crate::audio::{self, PcmBuffer};
use crate::config::{EngineConfig, StoreBackend};
use crate::error::{Error, Result};
use crate::hashing::FingerprintHasher;
use crate::matcher::{self, MatchAligner};
use crate::models::{
    Detection, FingerprintSet, Identification, Song, SongMetadata, SongPlays, StationHourStat,
};
use crate::peaks::PeakExtractor;
use crate::spectrogram::SpectrogramTransformer;
use crate::store::{with_retry, FingerprintStore, MemoryStore, RedisStore, RetryPolicy};
use chrono::{DateTime, NaiveDate, Utc};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Main fingerprinting engine
///
/// Runs the landmark pipeline (spectrogram, band peaks, target-zone hashes)
/// and connects it to a fingerprint store for ingest and identification and
/// to the chart aggregator for per-station statistics.
///
/// All operations take `&self`; one engine can serve many threads.
pub struct AudioFingerprinter {
    config: EngineConfig,
    store: Arc<dyn FingerprintStore>,
    charts: ChartAggregator,
    transformer: SpectrogramTransformer,
    extractor: PeakExtractor,
    hasher: FingerprintHasher,
    aligner: MatchAligner,
    retry: RetryPolicy,
    /// Distinguishes this engine's capture ids from other processes'
    capture_prefix: String,
    captures: AtomicU64,
}

impl AudioFingerprinter {
    /// Creates an engine over explicit store instances
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn FingerprintStore>,
        stats: Arc<dyn StatsStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(AudioFingerprinter {
            charts: ChartAggregator::new(stats, &config.charts)?,
            transformer: SpectrogramTransformer::new(&config.spectral),
            extractor: PeakExtractor::new(&config.peaks, &config.spectral),
            hasher: FingerprintHasher::new(&config.hashing, &config.spectral),
            aligner: MatchAligner::new(&config.matching),
            retry: RetryPolicy::from_config(&config.store),
            capture_prefix: capture_prefix(),
            captures: AtomicU64::new(0),
            store,
            config,
        })
    }

    /// Creates an engine with the backends named in `config.store`
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let (store, stats): (Arc<dyn FingerprintStore>, Arc<dyn StatsStore>) =
            match config.store.backend {
                StoreBackend::Memory => (
                    Arc::new(MemoryStore::new()),
                    Arc::new(MemoryStatsStore::new()),
                ),
                StoreBackend::Redis => (
                    Arc::new(RedisStore::new(&config.store)?),
                    Arc::new(RedisStatsStore::new(&config.store)?),
                ),
            };
        tracing::info!(backend = ?config.store.backend, "Created fingerprint engine");
        Self::new(config, store, stats)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn FingerprintStore> {
        &self.store
    }

    /// Generates the fingerprint set of a buffer without touching the store.
    ///
    /// The buffer is resampled to the canonical rate first; the checksum is
    /// taken over the canonical samples.
    pub fn fingerprint(&self, pcm: &PcmBuffer) -> Result<FingerprintSet> {
        let canonical = self.canonical(pcm)?;
        Ok(self.fingerprint_canonical(&canonical))
    }

    fn canonical<'a>(&self, pcm: &'a PcmBuffer) -> Result<Cow<'a, PcmBuffer>> {
        pcm.validate()?;
        let rate = self.config.spectral.sample_rate;
        if pcm.sample_rate == rate {
            Ok(Cow::Borrowed(pcm))
        } else {
            Ok(Cow::Owned(audio::resample(pcm.clone(), rate)?))
        }
    }

    fn fingerprint_canonical(&self, pcm: &PcmBuffer) -> FingerprintSet {
        let frames = self.transformer.frames(&pcm.samples);
        let frame_count = frames.len() as u32;
        let peaks = self.extractor.extract(frames);
        let fingerprints = self.hasher.hash_peaks(&peaks);

        tracing::debug!(
            frames = frame_count,
            peaks = peaks.len(),
            hashes = fingerprints.len(),
            "Generated fingerprints"
        );
        FingerprintSet {
            fingerprints,
            frame_count,
            duration: pcm.duration(),
            checksum: audio::checksum(&pcm.samples),
        }
    }

    /// Fingerprints a reference track and adds it to the catalog.
    ///
    /// Content already in the catalog returns `Error::DuplicateAsset` with
    /// the existing song id and leaves the store unchanged.
    pub fn ingest(&self, pcm: &PcmBuffer, metadata: &SongMetadata) -> Result<Song> {
        let canonical = self.canonical(pcm)?;
        let window = self.config.spectral.window_size;
        if canonical.samples.len() < window {
            return Err(Error::InvalidAudio(format!(
                "reference track has {} samples, need at least one {} sample window",
                canonical.samples.len(),
                window
            )));
        }

        let set = self.fingerprint_canonical(&canonical);
        if set.is_empty() {
            return Err(Error::InvalidAudio(format!(
                "'{}' produced no landmarks (silent or featureless audio)",
                metadata.title
            )));
        }

        match with_retry("ingest", &self.retry, || self.store.ingest(metadata, &set)) {
            Ok(song) => {
                tracing::info!(
                    song_id = song.song_id,
                    title = %song.title,
                    artist = %song.artist,
                    hashes = song.total_hashes,
                    "Ingested song"
                );
                Ok(song)
            }
            Err(Error::DuplicateAsset { checksum, song_id }) => {
                tracing::warn!(song_id, checksum = %checksum, title = %metadata.title, "Skipped duplicate ingest");
                Err(Error::DuplicateAsset { checksum, song_id })
            }
            Err(e) => Err(e),
        }
    }

    /// Identifies the song playing in a broadcast capture.
    ///
    /// `NoMatch` is a successful outcome. A completed identification is
    /// counted in the station's hourly stats; a failed one is not.
    pub fn identify(
        &self,
        clip: &PcmBuffer,
        station: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Identification> {
        let canonical = self.canonical(clip)?;
        let min_seconds = self.config.matching.min_query_seconds as f64;
        if canonical.duration() < min_seconds {
            return Err(Error::InvalidAudio(format!(
                "capture is {:.2}s, need at least {:.2}s",
                canonical.duration(),
                min_seconds
            )));
        }

        let query = self.fingerprint_canonical(&canonical);
        let outcome = self.match_query(&query, station, captured_at)?;

        let capture_id = self.next_capture_id();
        with_retry("record_capture", &self.retry, || {
            self.charts.record(&capture_id, station, captured_at, &outcome)
        })?;

        match &outcome {
            Identification::Match(d) => tracing::info!(
                station,
                song_id = d.song_id,
                confidence = d.confidence,
                offset_seconds = d.offset_seconds,
                "Identified capture"
            ),
            Identification::NoMatch => tracing::info!(
                station,
                hashes = query.len(),
                "No match for capture"
            ),
        }
        Ok(outcome)
    }

    fn match_query(
        &self,
        query: &FingerprintSet,
        station: &str,
        captured_at: DateTime<Utc>,
    ) -> Result<Identification> {
        if query.is_empty() {
            return Ok(Identification::NoMatch);
        }

        let hashes = self.aligner.lookup_hashes(&query.fingerprints);
        let postings = with_retry("lookup", &self.retry, || self.store.lookup(&hashes))?;
        tracing::debug!(
            query_hashes = hashes.len(),
            matched_hashes = postings.len(),
            "Looked up query hashes"
        );

        let Some(winner) = self.aligner.align(&query.fingerprints, &postings) else {
            return Ok(Identification::NoMatch);
        };
        let song = with_retry("get_song", &self.retry, || self.store.get_song(winner.song_id))?;

        let confidence = matcher::confidence(winner.votes, query.len() as u64, song.total_hashes);
        if !self.aligner.is_confident(confidence) {
            tracing::debug!(
                song_id = winner.song_id,
                confidence,
                votes = winner.votes,
                "Winner below confidence floor"
            );
            return Ok(Identification::NoMatch);
        }

        Ok(Identification::Match(Detection {
            song_id: winner.song_id,
            confidence,
            offset_seconds: winner.offset_frames * self.config.spectral.seconds_per_frame(),
            station: station.to_string(),
            captured_at,
            aligned_hits: winner.votes,
        }))
    }

    fn next_capture_id(&self) -> String {
        let seq = self.captures.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.capture_prefix, seq)
    }

    /// Hourly statistics for one station. Slots with no captures are `NotFound`.
    pub fn get_station_stats(&self, station: &str, date: NaiveDate, hour: u32) -> Result<StationHourStat> {
        with_retry("station_stats", &self.retry, || {
            self.charts.station_hour(station, date, hour)
        })
    }

    pub fn station_plays(&self, station: &str) -> Result<Vec<SongPlays>> {
        with_retry("station_plays", &self.retry, || self.charts.song_plays(station))
    }
}

/// Process id and start time, so capture ids stay unique across engines
fn capture_prefix() -> String {
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{}-{:x}", std::process::id(), started)
}
