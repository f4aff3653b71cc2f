//! Fingerprint store consistency under concurrent ingest

mod helpers;

use airplay_fingerprinter::config::{EngineConfig, StoreBackend};
use airplay_fingerprinter::models::{FingerprintSet, Posting};
use airplay_fingerprinter::{AudioFingerprinter, Error, FingerprintStore, Song, SongMetadata};
use helpers::*;
use std::collections::HashSet;
use std::thread;

/// Every fingerprint of `set` is present for `song`, and nothing else of it is
fn assert_posting_set(store: &dyn FingerprintStore, song: &Song, set: &FingerprintSet) {
    let hashes: HashSet<u32> = set.fingerprints.iter().map(|fp| fp.hash).collect();
    let postings = store.lookup(&hashes).unwrap();

    let mut stored: Vec<Posting> = postings
        .values()
        .flatten()
        .filter(|p| p.song_id == song.song_id)
        .copied()
        .collect();
    let mut expected: Vec<Posting> = set
        .fingerprints
        .iter()
        .map(|fp| Posting {
            song_id: song.song_id,
            offset: fp.offset,
        })
        .collect();
    stored.sort_by_key(|p| p.offset);
    expected.sort_by_key(|p| p.offset);

    assert_eq!(stored.len() as u64, song.total_hashes);
    assert_eq!(stored, expected);
    assert!(stored.iter().all(|p| p.offset < song.duration_frames));
}

#[test]
fn concurrent_ingest_of_different_songs_keeps_both_intact() {
    let engine = memory_engine();
    let a = synthetic_song(71, 30.0);
    let b = synthetic_song(72, 30.0);

    let (song_a, song_b) = thread::scope(|s| {
        let ha = s.spawn(|| engine.ingest(&a, &SongMetadata::new("Side A", "Synth")).unwrap());
        let hb = s.spawn(|| engine.ingest(&b, &SongMetadata::new("Side B", "Synth")).unwrap());
        (ha.join().unwrap(), hb.join().unwrap())
    });

    assert_ne!(song_a.song_id, song_b.song_id);
    assert_eq!(engine.store().song_count().unwrap(), 2);
    assert_posting_set(engine.store().as_ref(), &song_a, &engine.fingerprint(&a).unwrap());
    assert_posting_set(engine.store().as_ref(), &song_b, &engine.fingerprint(&b).unwrap());
}

#[test]
fn concurrent_duplicate_ingest_has_one_winner() {
    let engine = memory_engine();
    let pcm = synthetic_song(81, 20.0);

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let engine = &engine;
                let pcm = &pcm;
                s.spawn(move || engine.ingest(pcm, &SongMetadata::new(format!("Copy {}", i), "Synth")))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners: Vec<&Song> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1);
    let winner = winners[0];
    for result in &results {
        if let Err(err) = result {
            match err {
                Error::DuplicateAsset { song_id, .. } => assert_eq!(*song_id, winner.song_id),
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    assert_eq!(engine.store().song_count().unwrap(), 1);
    assert_posting_set(engine.store().as_ref(), winner, &engine.fingerprint(&pcm).unwrap());
}

#[test]
fn identify_runs_while_other_songs_ingest() {
    let engine = memory_engine();
    let known = synthetic_song(91, 30.0);
    let known_id = engine
        .ingest(&known, &SongMetadata::new("Known", "Synth"))
        .unwrap()
        .song_id;
    let newcomers: Vec<_> = (92..96).map(|seed| synthetic_song(seed, 20.0)).collect();
    let clip = hop_aligned_slice(&known, 30, 10.0);

    thread::scope(|s| {
        for (i, pcm) in newcomers.iter().enumerate() {
            let engine = &engine;
            s.spawn(move || {
                engine
                    .ingest(pcm, &SongMetadata::new(format!("New {}", i), "Synth"))
                    .unwrap()
            });
        }
        for _ in 0..4 {
            let outcome = engine
                .identify(&clip, "Capital FM", chrono::Utc::now())
                .unwrap();
            assert_eq!(outcome.detection().map(|d| d.song_id), Some(known_id));
        }
    });

    assert_eq!(engine.store().song_count().unwrap(), 5);
}

#[test]
fn file_checksum_overrides_content_checksum() {
    let engine = memory_engine();
    let pcm = synthetic_song(101, 20.0);
    let mut metadata = SongMetadata::new("Tagged", "Synth");
    metadata.checksum = Some("file-sha-1".to_string());

    let song = engine.ingest(&pcm, &metadata).unwrap();
    assert_eq!(song.file_checksum, "file-sha-1");
    assert_eq!(engine.store().find_by_checksum("file-sha-1").unwrap(), Some(song));

    // Same PCM under a different file checksum is a different asset
    metadata.checksum = Some("file-sha-2".to_string());
    assert!(engine.ingest(&pcm, &metadata).is_ok());
}

#[test]
fn unreachable_redis_surfaces_store_unavailable() {
    let mut config = EngineConfig::default();
    config.store.backend = StoreBackend::Redis;
    config.store.redis_url = "redis://127.0.0.1:1/".to_string();
    config.store.timeout_ms = 300;
    config.store.max_retries = 1;
    config.store.backoff_ms = 10;
    let engine = AudioFingerprinter::from_config(config).unwrap();

    let err = engine
        .ingest(&synthetic_song(111, 10.0), &SongMetadata::new("Offline", "Synth"))
        .unwrap_err();
    assert!(err.is_retryable(), "got {err}");

    let err = engine
        .identify(&synthetic_song(112, 5.0), "Capital FM", chrono::Utc::now())
        .unwrap_err();
    assert!(err.is_retryable(), "got {err}");
}

#[test]
#[ignore = "requires a running redis server on 127.0.0.1:6379"]
fn redis_engine_round_trip() {
    let mut config = EngineConfig::default();
    config.store.backend = StoreBackend::Redis;
    config.store.key_prefix = format!("fp-it-{}", std::process::id());
    let engine = AudioFingerprinter::from_config(config).unwrap();

    let pcm = synthetic_song(121, 30.0);
    let song = engine.ingest(&pcm, &SongMetadata::new("Live", "Synth")).unwrap();
    assert_posting_set(engine.store().as_ref(), &song, &engine.fingerprint(&pcm).unwrap());
    assert!(engine
        .ingest(&pcm, &SongMetadata::new("Live", "Synth"))
        .unwrap_err()
        .is_duplicate());

    let outcome = engine
        .identify(&hop_aligned_slice(&pcm, 25, 10.0), "Capital FM", chrono::Utc::now())
        .unwrap();
    assert_eq!(outcome.detection().map(|d| d.song_id), Some(song.song_id));
}
