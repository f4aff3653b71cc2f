use crate::config::{PeakConfig, SpectralConfig};
use crate::spectrogram::SpectralFrame;

/// A local maximum of the spectrogram in both time and frequency
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// STFT frame index the peak was found in
    pub frame: u32,
    /// FFT bin index, not yet quantized for hashing
    pub bin: u32,
    pub magnitude: f32,
}

/// Logarithmically spaced frequency bands, as `[start, end)` bin ranges.
///
/// Low bands are a handful of bins wide and high bands hundreds, so selecting
/// one candidate per band gives bass and treble an equal share of landmarks.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyBands {
    ranges: Vec<(usize, usize)>,
}

impl FrequencyBands {
    /// Splits `[min_frequency, max_frequency]` into `bands` log-spaced bin ranges
    ///
    /// # Arguments
    /// * `peaks` - Band count and frequency limits
    /// * `spectral` - Sample rate and window size, which fix the bin width
    ///
    /// # Returns
    /// Non-empty ranges clipped to the spectrum; fewer than `bands` only when
    /// the spectrum is too short to hold them all
    pub fn new(peaks: &PeakConfig, spectral: &SpectralConfig) -> Self {
        let bin_count = spectral.bin_count();
        let freq_resolution = spectral.sample_rate as f32 / spectral.window_size as f32;
        let ratio = peaks.max_frequency / peaks.min_frequency;

        let mut edges: Vec<usize> = (0..=peaks.bands)
            .map(|k| {
                let freq = peaks.min_frequency * ratio.powf(k as f32 / peaks.bands as f32);
                freq_to_bin(freq, freq_resolution).min(bin_count)
            })
            .collect();

        // Narrow low bands can round onto the same bin; keep every band non-empty
        for k in 1..edges.len() {
            if edges[k] <= edges[k - 1] {
                edges[k] = edges[k - 1] + 1;
            }
        }

        let ranges = edges
            .windows(2)
            .map(|w| (w[0], w[1]))
            .filter(|&(start, end)| end <= bin_count && start < end)
            .collect();

        Self { ranges }
    }

    /// `[start, end)` bin range of every band, lowest first
    pub fn ranges(&self) -> &[(usize, usize)] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

fn freq_to_bin(freq: f32, freq_resolution: f32) -> usize {
    (freq / freq_resolution).round() as usize
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    bin: u32,
    magnitude: f32,
}

/// Picks one candidate per band per frame, then keeps only the candidates
/// that dominate the same band across `neighborhood_frames` on either side.
#[derive(Debug, Clone)]
pub struct PeakExtractor {
    bands: FrequencyBands,
    neighborhood: usize,
    min_magnitude: f32,
    band_mean_ratio: f32,
    tolerance: f32,
}

impl PeakExtractor {
    /// Creates an extractor for spectra shaped by `spectral`
    ///
    /// # Arguments
    /// * `peaks` - Band layout and candidate thresholds
    /// * `spectral` - Analysis window settings the spectra were computed with
    pub fn new(peaks: &PeakConfig, spectral: &SpectralConfig) -> Self {
        Self {
            bands: FrequencyBands::new(peaks, spectral),
            neighborhood: peaks.neighborhood_frames,
            min_magnitude: peaks.min_magnitude,
            band_mean_ratio: peaks.band_mean_ratio,
            tolerance: peaks.plateau_tolerance,
        }
    }

    pub fn bands(&self) -> &FrequencyBands {
        &self.bands
    }

    /// Finds the landmark peaks of a spectrogram
    ///
    /// Consumes the frame sequence; only per-band candidates are retained, not spectra.
    ///
    /// # Arguments
    /// * `frames` - Magnitude spectra in frame order
    ///
    /// # Returns
    /// Peaks ordered by frame, then bin; at most one per band per frame
    pub fn extract<I>(&self, frames: I) -> Vec<Peak>
    where
        I: IntoIterator<Item = SpectralFrame>,
    {
        let candidates: Vec<(u32, Vec<Option<Candidate>>)> = frames
            .into_iter()
            .map(|frame| (frame.index, self.band_candidates(&frame.magnitudes)))
            .collect();

        let mut peaks = Vec::new();
        for (t, (frame_index, bands)) in candidates.iter().enumerate() {
            for (band, candidate) in bands.iter().enumerate() {
                let Some(candidate) = candidate else {
                    continue;
                };
                if self.dominates_neighbors(&candidates, t, band, candidate.magnitude) {
                    peaks.push(Peak {
                        frame: *frame_index,
                        bin: candidate.bin,
                        magnitude: candidate.magnitude,
                    });
                }
            }
        }

        tracing::debug!(
            frames = candidates.len(),
            peaks = peaks.len(),
            "Extracted landmark peaks"
        );
        peaks
    }

    fn band_candidates(&self, spectrum: &[f32]) -> Vec<Option<Candidate>> {
        self.bands
            .ranges()
            .iter()
            .map(|&(start, end)| {
                let end = end.min(spectrum.len());
                if start >= end {
                    return None;
                }
                let band = &spectrum[start..end];
                let mean = band.iter().sum::<f32>() / band.len() as f32;

                // First maximum wins on ties so selection is deterministic
                let (offset, &magnitude) = band
                    .iter()
                    .enumerate()
                    .fold(None, |best: Option<(usize, &f32)>, (i, m)| match best {
                        Some((_, b)) if b >= m => best,
                        _ => Some((i, m)),
                    })?;

                if magnitude < self.min_magnitude || magnitude <= mean * self.band_mean_ratio {
                    return None;
                }
                Some(Candidate {
                    bin: (start + offset) as u32,
                    magnitude,
                })
            })
            .collect()
    }

    /// Earlier frames must be beaten by more than the plateau tolerance; later
    /// frames only matched within it, so a sustained plateau yields a single
    /// landmark at its start.
    fn dominates_neighbors(
        &self,
        candidates: &[(u32, Vec<Option<Candidate>>)],
        t: usize,
        band: usize,
        magnitude: f32,
    ) -> bool {
        let lo = t.saturating_sub(self.neighborhood);
        let hi = (t + self.neighborhood).min(candidates.len().saturating_sub(1));

        (lo..=hi).filter(|&u| u != t).all(|u| {
            match candidates[u].1.get(band).copied().flatten() {
                None => true,
                Some(other) if u < t => magnitude > other.magnitude * (1.0 + self.tolerance),
                Some(other) => magnitude * (1.0 + self.tolerance) >= other.magnitude,
            }
        })
    }
}
