//! Fingerprint hasher
//!
//! Pairs every anchor peak with the peaks that follow it inside a bounded
//! target zone and packs each pair into a 32-bit hash:
//!
//! ```text
//!  31        22 21        12 11          0
//! +------------+------------+-------------+
//! | anchor f   | target f   | delta frames|
//! +------------+------------+-------------+
//! ```

use crate::config::{HashConfig, SpectralConfig};
use crate::models::Fingerprint;
use crate::peaks::Peak;

pub const FREQ_BITS: u32 = 10;
pub const DELTA_BITS: u32 = 12;

const FREQ_MASK: u32 = (1 << FREQ_BITS) - 1;
const DELTA_MASK: u32 = (1 << DELTA_BITS) - 1;

/// Packs quantized anchor/target bins and the frame delta into one hash
pub fn pack_hash(anchor_bin: u32, target_bin: u32, delta_frames: u32) -> u32 {
    ((anchor_bin & FREQ_MASK) << (FREQ_BITS + DELTA_BITS))
        | ((target_bin & FREQ_MASK) << DELTA_BITS)
        | (delta_frames & DELTA_MASK)
}

/// Inverse of [`pack_hash`]
pub fn unpack_hash(hash: u32) -> (u32, u32, u32) {
    (
        (hash >> (FREQ_BITS + DELTA_BITS)) & FREQ_MASK,
        (hash >> DELTA_BITS) & FREQ_MASK,
        hash & DELTA_MASK,
    )
}

/// Hashes of the same peak pair with its frame delta moved by up to `tolerance`
///
/// A capture that starts between two hops can see either peak of a pair land
/// one frame off its reference frame, which changes the packed delta.
///
/// # Arguments
/// * `hash` - Packed fingerprint hash
/// * `tolerance` - Largest shift of the delta, in frames
///
/// # Returns
/// `hash` itself first, then each shifted variant whose delta stays in
/// `1..2^DELTA_BITS`
pub fn delta_variants(hash: u32, tolerance: u32) -> impl Iterator<Item = u32> {
    let (anchor, target, delta) = unpack_hash(hash);
    let lo = delta.saturating_sub(tolerance).max(1);
    let hi = delta.saturating_add(tolerance).min(DELTA_MASK);
    std::iter::once(hash).chain(
        (lo..=hi)
            .filter(move |&d| d != delta)
            .map(move |d| pack_hash(anchor, target, d)),
    )
}

/// Peaks paired with one anchor, nearest in time first.
///
/// Walks forward from the anchor over a time-sorted slice, skipping peaks
/// closer than `min_delta` or farther apart in frequency than `max_bin_delta`,
/// and stops at `max_delta` frames or after `fan_out` targets.
#[derive(Debug, Clone)]
pub struct TargetZone<'a> {
    peaks: &'a [Peak],
    anchor: Peak,
    next: usize,
    remaining: usize,
    min_delta: u32,
    max_delta: u32,
    max_bin_delta: u32,
}

impl<'a> TargetZone<'a> {
    /// Target zone of `peaks[anchor_index]`
    ///
    /// # Arguments
    /// * `peaks` - Peaks sorted by frame, then bin
    /// * `anchor_index` - Index of the anchor within `peaks`
    /// * `config` - Fan-out and zone bounds
    pub fn new(peaks: &'a [Peak], anchor_index: usize, config: &HashConfig) -> Self {
        Self {
            peaks,
            anchor: peaks[anchor_index],
            next: anchor_index + 1,
            remaining: config.fan_out,
            min_delta: config.min_delta_frames,
            max_delta: config.max_delta_frames,
            max_bin_delta: config.max_bin_delta,
        }
    }
}

impl<'a> Iterator for TargetZone<'a> {
    type Item = &'a Peak;

    fn next(&mut self) -> Option<&'a Peak> {
        while self.remaining > 0 && self.next < self.peaks.len() {
            let target = &self.peaks[self.next];
            self.next += 1;

            let delta = target.frame - self.anchor.frame;
            if delta > self.max_delta {
                self.remaining = 0;
                return None;
            }
            if delta < self.min_delta || target.bin.abs_diff(self.anchor.bin) > self.max_bin_delta {
                continue;
            }

            self.remaining -= 1;
            return Some(target);
        }
        None
    }
}

/// Turns peak constellations into anchor/target fingerprints
#[derive(Debug, Clone)]
pub struct FingerprintHasher {
    config: HashConfig,
    freq_shift: u32,
}

impl FingerprintHasher {
    /// Creates a hasher whose bin quantization fits the spectrum into [`FREQ_BITS`]
    ///
    /// # Arguments
    /// * `config` - Target zone settings
    /// * `spectral` - Window size, which fixes the highest bin index
    pub fn new(config: &HashConfig, spectral: &SpectralConfig) -> Self {
        // Bits needed for the highest bin index, truncated to FREQ_BITS
        let max_bin = spectral.bin_count().saturating_sub(1) as u32;
        let bits_needed = u32::BITS - max_bin.leading_zeros();

        Self {
            config: config.clone(),
            freq_shift: bits_needed.saturating_sub(FREQ_BITS),
        }
    }

    /// Drops the low bits of an FFT bin so it fits in [`FREQ_BITS`]
    pub fn quantize_bin(&self, bin: u32) -> u32 {
        bin >> self.freq_shift
    }

    /// Pairs every anchor with its target zone
    ///
    /// # Arguments
    /// * `peaks` - Peaks in any order; they are sorted by frame, then bin, if needed
    ///
    /// # Returns
    /// Fingerprints ordered by anchor then target, each offset at its anchor frame
    pub fn hash_peaks(&self, peaks: &[Peak]) -> Vec<Fingerprint> {
        let sorted;
        let peaks = if peaks
            .windows(2)
            .all(|w| (w[0].frame, w[0].bin) <= (w[1].frame, w[1].bin))
        {
            peaks
        } else {
            let mut owned = peaks.to_vec();
            owned.sort_by_key(|p| (p.frame, p.bin));
            sorted = owned;
            &sorted
        };

        let mut fingerprints = Vec::with_capacity(peaks.len() * self.config.fan_out);
        for (i, anchor) in peaks.iter().enumerate() {
            let anchor_bin = self.quantize_bin(anchor.bin);
            for target in TargetZone::new(peaks, i, &self.config) {
                fingerprints.push(Fingerprint {
                    hash: pack_hash(
                        anchor_bin,
                        self.quantize_bin(target.bin),
                        target.frame - anchor.frame,
                    ),
                    offset: anchor.frame,
                });
            }
        }

        tracing::debug!(
            peaks = peaks.len(),
            fingerprints = fingerprints.len(),
            "Hashed peak pairs"
        );
        fingerprints
    }
}
