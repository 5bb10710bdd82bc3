use crate::store::ProcessedScore;
use hashbrown::HashMap;
use std::time::{Duration, Instant};

/// Cached leaderboard state for one level key.
#[derive(Debug, Clone)]
pub struct CachedScores {
    pub top_scores: Vec<ProcessedScore>,
    pub own_score: Option<ProcessedScore>,
    /// False once the server indicated it does not track this level.
    pub supported: bool,
    stamp: Instant,
}

impl CachedScores {
    fn new(now: Instant) -> CachedScores {
        CachedScores {
            top_scores: Vec::new(),
            own_score: None,
            supported: true,
            stamp: now,
        }
    }
}

/// Client side per-level score cache with time based invalidation. Issuing a request
/// stamps the entry immediately so a pending reply does not trigger a request storm.
/// There is no eviction; key cardinality equals the level count, which is small.
pub struct ScoreCache {
    ttl: Duration,
    entries: HashMap<String, CachedScores>,
}

impl ScoreCache {
    pub fn new(ttl: Duration) -> ScoreCache {
        ScoreCache {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// True when the key has never been fetched, or its entry has gone stale.
    pub fn should_request(&self, level_validator: &str, now: Instant) -> bool {
        match self.entries.get(level_validator) {
            Some(entry) => now.duration_since(entry.stamp) >= self.ttl,
            None => true,
        }
    }

    /// Records that a request for this key is in flight.
    pub fn mark_requested(&mut self, level_validator: &str, now: Instant) {
        self.entry(level_validator, now).stamp = now;
    }

    pub fn received_top_scores(&mut self, level_validator: &str, scores: Vec<ProcessedScore>, now: Instant) {
        let entry = self.entry(level_validator, now);
        entry.top_scores = scores;
        entry.stamp = now;
    }

    pub fn received_own_score(&mut self, level_validator: &str, score: Option<ProcessedScore>, now: Instant) {
        let entry = self.entry(level_validator, now);
        entry.own_score = score;
        entry.stamp = now;
    }

    pub fn set_unsupported(&mut self, level_validator: &str, now: Instant) {
        self.entry(level_validator, now).supported = false;
    }

    pub fn get(&self, level_validator: &str) -> Option<&CachedScores> {
        self.entries.get(level_validator)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn entry(&mut self, level_validator: &str, now: Instant) -> &mut CachedScores {
        self.entries
            .entry(level_validator.to_string())
            .or_insert_with(|| CachedScores::new(now))
    }
}
