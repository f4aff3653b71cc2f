//! Offset-histogram voting
//!
//! Every posting returned for a query fingerprint votes for
//! `(song_id, ref_offset - query_offset)`. A true match piles its votes into
//! one delta; chance hash collisions scatter across many.
//!
//! A capture seldom starts on a hop boundary of the reference, so its peaks
//! land up to a frame early or late. With a `frame_tolerance` of `t`, each
//! query hash is also looked up with its frame delta moved by up to `t`
//! ([`delta_variants`]), and songs are scored over windows of `2t + 1`
//! neighbouring deltas instead of single buckets.

use crate::config::MatchConfig;
use crate::hashing::delta_variants;
use crate::models::{Fingerprint, Posting, SongId};
use std::collections::{HashMap, HashSet};

/// Best-aligned offset window of one song
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate {
    pub song_id: SongId,
    /// Reference frame minus query frame at the centre of the window
    pub delta: i64,
    /// Vote-weighted mean delta inside the window, in frames
    pub offset_frames: f64,
    /// Distinct query fingerprints voting inside the window
    pub votes: u32,
}

/// Sparse per-song histogram of offset deltas
#[derive(Debug, Default, Clone)]
pub struct OffsetHistogram {
    tolerance: i64,
    /// Votes per exact delta
    buckets: HashMap<SongId, HashMap<i64, u32>>,
    /// Votes per window, keyed by its centre delta
    windows: HashMap<SongId, HashMap<i64, u32>>,
}

impl OffsetHistogram {
    /// Empty histogram whose windows span `frame_tolerance` deltas either side
    pub fn new(frame_tolerance: u32) -> Self {
        Self {
            tolerance: frame_tolerance as i64,
            ..Self::default()
        }
    }

    /// Votes for every posting of every query fingerprint.
    ///
    /// Repeated query fingerprints and repeated postings count once, so no
    /// window can exceed the number of distinct query fingerprints.
    ///
    /// # Arguments
    /// * `query` - Fingerprints of the capture
    /// * `postings` - Store lookup covering every [`delta_variants`] of the query hashes
    /// * `frame_tolerance` - Frame drift absorbed by variant lookups and windows
    pub fn build(
        query: &[Fingerprint],
        postings: &HashMap<u32, Vec<Posting>>,
        frame_tolerance: u32,
    ) -> Self {
        let mut histogram = Self::new(frame_tolerance);
        let distinct: HashSet<&Fingerprint> = query.iter().collect();
        let mut votes: HashSet<(SongId, i64)> = HashSet::new();

        for fp in distinct {
            votes.clear();
            for hash in delta_variants(fp.hash, frame_tolerance) {
                let Some(hits) = postings.get(&hash) else {
                    continue;
                };
                for posting in hits {
                    votes.insert((posting.song_id, posting.offset as i64 - fp.offset as i64));
                }
            }
            if !votes.is_empty() {
                histogram.add(&votes);
            }
        }
        histogram
    }

    /// Adds the votes of one query fingerprint
    pub fn add(&mut self, votes: &HashSet<(SongId, i64)>) {
        let mut centres: HashSet<(SongId, i64)> = HashSet::new();
        for &(song_id, delta) in votes {
            *self
                .buckets
                .entry(song_id)
                .or_default()
                .entry(delta)
                .or_default() += 1;
            for centre in delta - self.tolerance..=delta + self.tolerance {
                centres.insert((song_id, centre));
            }
        }
        for (song_id, centre) in centres {
            *self
                .windows
                .entry(song_id)
                .or_default()
                .entry(centre)
                .or_default() += 1;
        }
    }

    /// Votes cast for exactly `delta`
    pub fn votes(&self, song_id: SongId, delta: i64) -> u32 {
        self.buckets
            .get(&song_id)
            .and_then(|h| h.get(&delta))
            .copied()
            .unwrap_or(0)
    }

    /// Distinct fingerprints voting within the tolerance of `centre`
    pub fn window_votes(&self, song_id: SongId, centre: i64) -> u32 {
        self.windows
            .get(&song_id)
            .and_then(|h| h.get(&centre))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn weighted_delta(&self, song_id: SongId, centre: i64) -> f64 {
        let (mut sum, mut weight) = (0.0, 0.0);
        for delta in centre - self.tolerance..=centre + self.tolerance {
            let votes = self.votes(song_id, delta) as f64;
            sum += delta as f64 * votes;
            weight += votes;
        }
        if weight > 0.0 {
            sum / weight
        } else {
            centre as f64
        }
    }

    /// Each song's fullest window, strongest first.
    ///
    /// Equal windows go to the one with more votes on its own centre, then
    /// the smaller delta. Equal songs go to the lower song id.
    pub fn ranked(&self) -> Vec<MatchCandidate> {
        let mut best: Vec<MatchCandidate> = self
            .windows
            .iter()
            .filter_map(|(&song_id, centres)| {
                let (&delta, &votes) = centres.iter().max_by(|a, b| {
                    a.1.cmp(b.1)
                        .then_with(|| self.votes(song_id, *a.0).cmp(&self.votes(song_id, *b.0)))
                        .then(b.0.cmp(a.0))
                })?;
                Some(MatchCandidate {
                    song_id,
                    delta,
                    offset_frames: self.weighted_delta(song_id, delta),
                    votes,
                })
            })
            .collect();
        best.sort_by(|a, b| {
            b.votes
                .cmp(&a.votes)
                .then(a.song_id.cmp(&b.song_id))
                .then(a.delta.cmp(&b.delta))
        });
        best
    }
}

/// Picks the winning song from an offset histogram
#[derive(Debug, Clone)]
pub struct MatchAligner {
    min_hits: u32,
    min_ratio: f32,
    min_confidence: f32,
    frame_tolerance: u32,
}

impl MatchAligner {
    pub fn new(config: &MatchConfig) -> Self {
        Self {
            min_hits: config.min_hits,
            min_ratio: config.min_ratio,
            min_confidence: config.min_confidence,
            frame_tolerance: config.frame_tolerance,
        }
    }

    /// Hashes to look up for a query: every fingerprint hash and its delta variants
    pub fn lookup_hashes(&self, query: &[Fingerprint]) -> HashSet<u32> {
        query
            .iter()
            .flat_map(|fp| delta_variants(fp.hash, self.frame_tolerance))
            .collect()
    }

    /// Winning candidate, or `None` when the evidence is too weak or ambiguous
    ///
    /// # Arguments
    /// * `query` - Fingerprints of the capture
    /// * `postings` - Store lookup of [`MatchAligner::lookup_hashes`]
    pub fn align(
        &self,
        query: &[Fingerprint],
        postings: &HashMap<u32, Vec<Posting>>,
    ) -> Option<MatchCandidate> {
        self.decide(&OffsetHistogram::build(query, postings, self.frame_tolerance))
    }

    /// Applies the hit and separation thresholds to a histogram
    pub fn decide(&self, histogram: &OffsetHistogram) -> Option<MatchCandidate> {
        let ranked = histogram.ranked();
        let winner = *ranked.first()?;
        let runner_up = ranked.get(1).map_or(0, |c| c.votes);

        if winner.votes <= self.min_hits {
            tracing::debug!(votes = winner.votes, min_hits = self.min_hits, "Too few aligned hits");
            return None;
        }
        if (winner.votes as f32) < self.min_ratio * runner_up as f32 {
            tracing::debug!(
                votes = winner.votes,
                runner_up,
                min_ratio = self.min_ratio,
                "Winner not separated from runner-up"
            );
            return None;
        }
        Some(winner)
    }

    /// Whether a winner's confidence clears the configured floor
    pub fn is_confident(&self, confidence: f32) -> bool {
        confidence >= self.min_confidence
    }
}

/// Aligned votes over the smaller of the two fingerprint counts, clamped to [0, 1]
pub fn confidence(votes: u32, query_hashes: u64, song_hashes: u64) -> f32 {
    let denominator = query_hashes.min(song_hashes);
    if denominator == 0 {
        return 0.0;
    }
    (votes as f64 / denominator as f64).clamp(0.0, 1.0) as f32
}
