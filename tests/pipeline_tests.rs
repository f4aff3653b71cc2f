//! End-to-end ingest and identification over synthetic catalogs

mod helpers;

use airplay_fingerprinter::{AudioLoader, Error, SongMetadata};
use chrono::{TimeZone, Utc};
use helpers::*;

fn captured_at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 12, 14, 20, 0).unwrap()
}

#[test]
fn verbatim_slice_is_identified_with_offset() {
    let engine = memory_engine();
    let songs: Vec<_> = (1..=3).map(|seed| synthetic_song(seed, 30.0)).collect();
    let ids: Vec<u64> = songs
        .iter()
        .enumerate()
        .map(|(i, pcm)| {
            engine
                .ingest(pcm, &SongMetadata::new(format!("Track {}", i), "Synth"))
                .unwrap()
                .song_id
        })
        .collect();

    let start_frame = 40;
    let clip = hop_aligned_slice(&songs[1], start_frame, 10.0);
    let outcome = engine.identify(&clip, "Capital FM", captured_at()).unwrap();

    let detection = outcome.detection().expect("slice should match");
    assert_eq!(detection.song_id, ids[1]);
    assert!(detection.confidence > 0.5, "confidence {}", detection.confidence);
    assert!(detection.confidence <= 1.0);
    let true_start = seconds_of_frames(start_frame);
    assert!(
        (detection.offset_seconds - true_start).abs() <= seconds_of_frames(1),
        "offset {} vs {}",
        detection.offset_seconds,
        true_start
    );
    assert_eq!(detection.station, "Capital FM");
}

#[test]
fn shifted_capture_shifts_offset_by_whole_frames() {
    let engine = memory_engine();
    let song = synthetic_song(11, 40.0);
    let song_id = engine
        .ingest(&song, &SongMetadata::new("Shifted", "Synth"))
        .unwrap()
        .song_id;

    let early = engine
        .identify(&hop_aligned_slice(&song, 20, 10.0), "Radio Simba", captured_at())
        .unwrap();
    let late = engine
        .identify(&hop_aligned_slice(&song, 27, 10.0), "Radio Simba", captured_at())
        .unwrap();

    let (early, late) = (early.detection().unwrap(), late.detection().unwrap());
    assert_eq!(early.song_id, song_id);
    assert_eq!(late.song_id, song_id);
    let shift = late.offset_seconds - early.offset_seconds;
    assert!((shift - seconds_of_frames(7)).abs() < seconds_of_frames(1) / 2.0, "shift {}", shift);
    assert!(early.confidence > 0.5 && late.confidence > 0.5);
}

#[test]
fn slice_at_any_sample_offset_is_identified_with_offset() {
    let engine = memory_engine();
    let song = synthetic_song(1, 60.0);
    engine
        .ingest(&synthetic_song(2, 30.0), &SongMetadata::new("Other", "Synth"))
        .unwrap();
    let song_id = engine
        .ingest(&song, &SongMetadata::new("Offsets", "Synth"))
        .unwrap()
        .song_id;

    // Twenty starts spread across one hop, from aligned to almost a full hop late
    for k in 0..20 {
        let start = 40 * HOP + k * 102;
        let outcome = engine
            .identify(&slice_at(&song, start, 10.0), "Capital FM", captured_at())
            .unwrap();

        let detection = outcome.detection().unwrap_or_else(|| panic!("no match at sample {}", start));
        assert_eq!(detection.song_id, song_id, "start {}", start);
        assert!(
            detection.confidence > 0.5,
            "start {} confidence {}",
            start,
            detection.confidence
        );
        let true_start = start as f64 / RATE as f64;
        assert!(
            (detection.offset_seconds - true_start).abs() <= seconds_of_frames(1),
            "start {} offset {} vs {}",
            start,
            detection.offset_seconds,
            true_start
        );
    }
}

#[test]
fn capture_at_44100_hz_is_identified_with_offset() {
    let broadcast_rate = 44100;
    let engine = memory_engine();
    engine
        .ingest(&synthetic_song(4, 30.0), &SongMetadata::new("Other", "Synth"))
        .unwrap();
    let song_id = engine
        .ingest(&synthetic_song(3, 60.0), &SongMetadata::new("Broadcast", "Synth"))
        .unwrap()
        .song_id;
    let broadcast = synthetic_song_at(3, 60.0, broadcast_rate);

    for start in [4 * 37 * HOP + 1234, 4 * 90 * HOP + 5001] {
        let clip = slice_at(&broadcast, start, 10.0);
        assert_eq!(clip.sample_rate, broadcast_rate);
        let outcome = engine.identify(&clip, "NBS TV", captured_at()).unwrap();

        let detection = outcome.detection().expect("resampled capture should match");
        assert_eq!(detection.song_id, song_id);
        assert!(detection.confidence > 0.5, "confidence {}", detection.confidence);
        let true_start = start as f64 / broadcast_rate as f64;
        assert!(
            (detection.offset_seconds - true_start).abs() <= seconds_of_frames(1),
            "offset {} vs {}",
            detection.offset_seconds,
            true_start
        );
    }
}

#[test]
fn reference_at_44100_hz_matches_native_rate_capture() {
    let engine = memory_engine();
    let song_id = engine
        .ingest(&synthetic_song_at(8, 40.0, 44100), &SongMetadata::new("Master", "Synth"))
        .unwrap()
        .song_id;

    let start = 25 * HOP + 777;
    let clip = slice_at(&synthetic_song(8, 40.0), start, 10.0);
    let detection = engine
        .identify(&clip, "Galaxy FM", captured_at())
        .unwrap()
        .detection()
        .cloned()
        .expect("native capture should match the resampled reference");

    assert_eq!(detection.song_id, song_id);
    assert!(detection.confidence > 0.5, "confidence {}", detection.confidence);
    let true_start = start as f64 / RATE as f64;
    assert!((detection.offset_seconds - true_start).abs() <= seconds_of_frames(1));
}

#[test]
fn white_noise_false_positive_rate_is_below_one_percent() {
    let engine = memory_engine();
    for seed in 1..=10 {
        engine
            .ingest(&synthetic_song(seed, 30.0), &SongMetadata::new(format!("Song {}", seed), "Synth"))
            .unwrap();
    }

    let trials = 200u64;
    let matched: Vec<u64> = (1000..1000 + trials)
        .filter(|&seed| {
            engine
                .identify(&white_noise(seed, 10.0), "NTV Uganda", captured_at())
                .unwrap()
                .is_match()
        })
        .collect();
    assert!(
        (matched.len() as u64) * 100 < trials,
        "{} of {} noise captures matched (seeds {:?})",
        matched.len(),
        trials,
        matched
    );
}

#[test]
fn unknown_song_is_no_match() {
    let engine = memory_engine();
    engine
        .ingest(&synthetic_song(5, 30.0), &SongMetadata::new("Known", "Synth"))
        .unwrap();

    let stranger = synthetic_song(6, 12.0);
    let outcome = engine.identify(&stranger, "Radio One", captured_at()).unwrap();
    assert!(!outcome.is_match());
}

#[test]
fn total_hashes_equals_generated_fingerprints() {
    let engine = memory_engine();
    let pcm = synthetic_song(21, 25.0);
    let expected = engine.fingerprint(&pcm).unwrap();
    let song = engine.ingest(&pcm, &SongMetadata::new("Counted", "Synth")).unwrap();

    assert_eq!(song.total_hashes, expected.len() as u64);
    assert_eq!(song.duration_frames, expected.frame_count);
    assert_eq!(song.file_checksum, expected.checksum);
    assert!((song.duration - 25.0).abs() < 0.01);
}

#[test]
fn reingest_is_idempotent() {
    let engine = memory_engine();
    let pcm = synthetic_song(31, 20.0);
    let first = engine.ingest(&pcm, &SongMetadata::new("Once", "Synth")).unwrap();

    let err = engine
        .ingest(&pcm, &SongMetadata::new("Once again", "Synth"))
        .unwrap_err();
    match err {
        Error::DuplicateAsset { song_id, checksum } => {
            assert_eq!(song_id, first.song_id);
            assert_eq!(checksum, first.file_checksum);
        }
        other => panic!("expected duplicate, got {other}"),
    }
    assert_eq!(engine.store().song_count().unwrap(), 1);
    assert_eq!(engine.store().get_song(first.song_id).unwrap(), first);
}

#[test]
fn wav_round_trip_through_loader_matches() {
    let dir = tempfile::tempdir().unwrap();
    let song_path = dir.path().join("reference.wav");
    let song = synthetic_song(41, 30.0);
    write_wav_16bit(&song_path, &song).unwrap();

    let engine = memory_engine();
    let loaded = AudioLoader::load_wav(&song_path).unwrap();
    let song_id = engine
        .ingest(&loaded, &SongMetadata::new("From disk", "Synth"))
        .unwrap()
        .song_id;

    let clip = hop_aligned_slice(&loaded, 15, 10.0);
    let outcome = engine.identify(&clip, "Galaxy FM", captured_at()).unwrap();
    assert_eq!(outcome.detection().map(|d| d.song_id), Some(song_id));
}

#[test]
fn short_capture_is_invalid_audio() {
    let engine = memory_engine();
    let clip = synthetic_song(2, 0.5);
    assert!(matches!(
        engine.identify(&clip, "Capital FM", captured_at()),
        Err(Error::InvalidAudio(_))
    ));
}
