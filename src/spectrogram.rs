//! Spectral frame transformer
//!
//! Slides a Hamming-windowed analysis frame across canonical-rate PCM and
//! yields one magnitude spectrum per hop. The trailing partial window is
//! zero-padded so the whole signal is covered.

use crate::config::SpectralConfig;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// One analysis window of PCM, zero-padded to the full window length
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub index: u32,
    /// Index of the first sample in the source buffer
    pub start: usize,
    pub samples: Vec<f32>,
}

/// Magnitude spectrum of one [`AudioFrame`]. `magnitudes[bin]` covers DC through Nyquist.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFrame {
    pub index: u32,
    pub magnitudes: Vec<f32>,
}

/// Number of windows needed to cover `len` samples
pub fn frame_count(len: usize, window_size: usize, hop_size: usize) -> usize {
    if len == 0 {
        0
    } else if len <= window_size {
        1
    } else {
        1 + (len - window_size).div_ceil(hop_size)
    }
}

/// Shared FFT plan and window coefficients for one [`SpectralConfig`]
#[derive(Clone)]
pub struct SpectrogramTransformer {
    window_size: usize,
    hop_size: usize,
    fft: Arc<dyn Fft<f32>>,
    coefficients: Arc<[f32]>,
}

impl SpectrogramTransformer {
    pub fn new(config: &SpectralConfig) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.window_size);
        let coefficients: Arc<[f32]> = apodize::hamming_iter(config.window_size)
            .map(|x| x as f32)
            .collect();

        Self {
            window_size: config.window_size,
            hop_size: config.hop_size,
            fft,
            coefficients,
        }
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    pub fn bin_count(&self) -> usize {
        self.window_size / 2 + 1
    }

    /// Raw overlapping windows over `samples`
    pub fn audio_frames<'a>(&self, samples: &'a [f32]) -> AudioFrames<'a> {
        AudioFrames {
            samples,
            window_size: self.window_size,
            hop_size: self.hop_size,
            next: 0,
            total: frame_count(samples.len(), self.window_size, self.hop_size),
        }
    }

    /// Lazy spectrum sequence over `samples`. Clone the iterator to restart it.
    pub fn frames<'a>(&self, samples: &'a [f32]) -> SpectralFrames<'a> {
        SpectralFrames {
            inner: self.audio_frames(samples),
            transformer: self.clone(),
        }
    }

    pub fn transform(&self, frame: &AudioFrame) -> SpectralFrame {
        let mut buffer: Vec<Complex<f32>> = frame
            .samples
            .iter()
            .zip(self.coefficients.iter())
            .map(|(&x, &w)| Complex::new(x * w, 0.0))
            .collect();

        self.fft.process(&mut buffer);

        let magnitudes = buffer
            .iter()
            .take(self.bin_count())
            .map(|c| c.norm())
            .collect();

        SpectralFrame {
            index: frame.index,
            magnitudes,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AudioFrames<'a> {
    samples: &'a [f32],
    window_size: usize,
    hop_size: usize,
    next: usize,
    total: usize,
}

impl Iterator for AudioFrames<'_> {
    type Item = AudioFrame;

    fn next(&mut self) -> Option<AudioFrame> {
        if self.next >= self.total {
            return None;
        }
        let start = self.next * self.hop_size;
        let end = (start + self.window_size).min(self.samples.len());

        let mut samples = Vec::with_capacity(self.window_size);
        samples.extend_from_slice(&self.samples[start..end]);
        samples.resize(self.window_size, 0.0);

        let frame = AudioFrame {
            index: self.next as u32,
            start,
            samples,
        };
        self.next += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for AudioFrames<'_> {}

#[derive(Clone)]
pub struct SpectralFrames<'a> {
    inner: AudioFrames<'a>,
    transformer: SpectrogramTransformer,
}

impl Iterator for SpectralFrames<'_> {
    type Item = SpectralFrame;

    fn next(&mut self) -> Option<SpectralFrame> {
        let frame = self.inner.next()?;
        Some(self.transformer.transform(&frame))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for SpectralFrames<'_> {}
