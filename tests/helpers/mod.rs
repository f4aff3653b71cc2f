//! Deterministic audio for pipeline tests
//!
//! Songs are sequences of chords with random length, pitch and loudness, one
//! tone inside each default analysis band, so every band carries landmarks.
//! Each chord has a short attack and decays the way a struck note does.
//! Everything is seeded, so a given seed always yields the same music.

#![allow(dead_code)]

use airplay_fingerprinter::{AudioFingerprinter, EngineConfig, PcmBuffer};
use hound::{SampleFormat, WavSpec, WavWriter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::path::Path;

pub const RATE: u32 = 11025;
pub const HOP: usize = 2048;

/// Inside the six log-spaced bands between 40 Hz and 5 kHz
const REGIONS: [(f32, f32); 6] = [
    (45.0, 85.0),
    (100.0, 190.0),
    (210.0, 430.0),
    (470.0, 950.0),
    (1050.0, 2150.0),
    (2400.0, 4600.0),
];

const ATTACK_SECONDS: f64 = 0.01;
/// Level a chord has decayed to by the time the next one starts
const RELEASE_LEVEL: f64 = 0.15;

pub fn synthetic_song(seed: u64, seconds: f32) -> PcmBuffer {
    synthetic_song_at(seed, seconds, RATE)
}

/// The same music as [`synthetic_song`], rendered at `rate`
pub fn synthetic_song_at(seed: u64, seconds: f32, rate: u32) -> PcmBuffer {
    let mut rng = StdRng::seed_from_u64(seed);
    let total = (seconds as f64 * rate as f64) as usize;
    let mut samples = Vec::with_capacity(total);

    while samples.len() < total {
        let note_seconds = rng.gen_range(0.6f64..1.0);
        let chord: Vec<(f64, f64)> = REGIONS
            .iter()
            .map(|&(lo, hi)| {
                (
                    rng.gen_range(lo as f64..hi as f64),
                    rng.gen_range(0.08f64..0.14),
                )
            })
            .collect();
        let decay = RELEASE_LEVEL.ln() / note_seconds;
        let start = samples.len();
        let end = (start + (note_seconds * rate as f64) as usize).min(total);
        for i in start..end {
            let t = i as f64 / rate as f64;
            let age = (i - start) as f64 / rate as f64;
            let envelope = (age / ATTACK_SECONDS).min(1.0) * (decay * age).exp();
            let value: f64 = chord
                .iter()
                .map(|&(freq, amp)| amp * (2.0 * PI * freq * t).sin())
                .sum();
            samples.push((value * envelope) as f32);
        }
    }

    PcmBuffer::new(samples, rate)
}

pub fn white_noise(seed: u64, seconds: f32) -> PcmBuffer {
    let mut rng = StdRng::seed_from_u64(seed);
    let n = (seconds * RATE as f32) as usize;
    PcmBuffer::new((0..n).map(|_| rng.gen_range(-0.3f32..0.3)).collect(), RATE)
}

/// `seconds` of `song` starting `start_frame` hops in
pub fn hop_aligned_slice(song: &PcmBuffer, start_frame: usize, seconds: f32) -> PcmBuffer {
    song.slice(start_frame * HOP, (seconds * RATE as f32) as usize)
}

/// `seconds` of `song` starting at any sample, in the song's own rate
pub fn slice_at(song: &PcmBuffer, start_sample: usize, seconds: f32) -> PcmBuffer {
    song.slice(start_sample, (seconds * song.sample_rate as f32) as usize)
}

pub fn seconds_of_frames(frames: usize) -> f64 {
    frames as f64 * HOP as f64 / RATE as f64
}

pub fn memory_engine() -> AudioFingerprinter {
    AudioFingerprinter::from_config(EngineConfig::default()).unwrap()
}

pub fn write_wav_16bit(path: &Path, pcm: &PcmBuffer) -> Result<(), hound::Error> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: pcm.sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)?;
    for &sample in &pcm.samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
    }
    writer.finalize()
}
