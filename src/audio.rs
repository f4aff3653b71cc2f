use crate::error::{Error, Result};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use sha2::{Digest, Sha256};
use std::path::Path;
use tracing::debug;

/// Decoded mono PCM, normalized to [-1.0, 1.0]
#[derive(Debug, Clone, PartialEq)]
pub struct PcmBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    /// Rejects buffers no stage downstream can make sense of
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(Error::InvalidAudio("sample rate is zero".into()));
        }
        if self.samples.is_empty() {
            return Err(Error::InvalidAudio("buffer contains no samples".into()));
        }
        if let Some(pos) = self.samples.iter().position(|s| !s.is_finite()) {
            return Err(Error::InvalidAudio(format!(
                "non-finite sample at index {}",
                pos
            )));
        }
        Ok(())
    }

    /// Slice of the buffer by sample index, clamped to its length
    pub fn slice(&self, start: usize, len: usize) -> PcmBuffer {
        let start = start.min(self.samples.len());
        let end = start.saturating_add(len).min(self.samples.len());
        PcmBuffer::new(self.samples[start..end].to_vec(), self.sample_rate)
    }
}

/// Loads WAV files into mono [`PcmBuffer`]s
pub struct AudioLoader;

impl AudioLoader {
    /// Reads a WAV file, converts to float and averages channels down to mono
    pub fn load_wav(file_path: &Path) -> Result<PcmBuffer> {
        let mut reader = hound::WavReader::open(file_path).map_err(|e| {
            Error::InvalidAudio(format!("Failed to open {}: {}", file_path.display(), e))
        })?;

        let spec = reader.spec();
        debug!(
            path = %file_path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            bits = spec.bits_per_sample,
            "Reading WAV"
        );

        let samples: std::result::Result<Vec<f32>, _> = match spec.sample_format {
            hound::SampleFormat::Float => reader.samples::<f32>().collect(),
            hound::SampleFormat::Int => match spec.bits_per_sample {
                16 => reader
                    .samples::<i16>()
                    .map(|s| s.map(|s| s as f32 / i16::MAX as f32))
                    .collect(),
                24 => reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / ((1 << 23) as f32)))
                    .collect(),
                32 => reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s as f32 / i32::MAX as f32))
                    .collect(),
                bits => {
                    return Err(Error::InvalidAudio(format!(
                        "Unsupported bit depth: {}",
                        bits
                    )));
                }
            },
        };
        let samples =
            samples.map_err(|e| Error::InvalidAudio(format!("Corrupt WAV data: {}", e)))?;

        let channels = spec.channels.max(1) as usize;
        let mono = if channels == 1 {
            samples
        } else {
            samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
                .collect()
        };

        let buffer = PcmBuffer::new(mono, spec.sample_rate);
        debug!(
            samples = buffer.samples.len(),
            seconds = buffer.duration(),
            "Loaded WAV"
        );
        Ok(buffer)
    }
}

/// Converts a buffer to `target_rate`. Buffers already at that rate are returned as-is.
pub fn resample(buffer: PcmBuffer, target_rate: u32) -> Result<PcmBuffer> {
    buffer.validate()?;
    if buffer.sample_rate == target_rate {
        return Ok(buffer);
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = target_rate as f64 / buffer.sample_rate as f64;
    let input_len = buffer.samples.len();

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, input_len, 1)
        .map_err(|e| Error::InvalidAudio(format!("Failed to create resampler: {}", e)))?;
    let output = resampler
        .process(&[buffer.samples], None)
        .map_err(|e| Error::InvalidAudio(format!("Resampling failed: {}", e)))?;

    let samples = output.into_iter().next().unwrap_or_default();
    debug!(
        from = buffer.sample_rate,
        to = target_rate,
        input_len,
        output_len = samples.len(),
        "Resampled"
    );
    Ok(PcmBuffer::new(samples, target_rate))
}

/// Lowercase hex SHA-256 over the little-endian sample bytes
pub fn checksum(samples: &[f32]) -> String {
    let mut hasher = Sha256::new();
    for sample in samples {
        hasher.update(sample.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}
