//! # Publish rate limiter
//! Sliding window of publish timestamps with exact rolling-window semantics.
//! The provider enforces "N per rolling hour/day", not fixed-reset buckets,
//! so admission counts a pruned timestamp list instead of refilling tokens.
//! Each successfully published cast (every chunk) is one entry.

use serde::{Deserialize, Serialize};

use crate::store::StateStore;

pub const HOUR_MS: i64 = 60 * 60 * 1000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Safety margin added to the computed re-admission time.
const NEXT_ALLOWED_MARGIN_MS: i64 = 1_000;

const RECORD: &str = "rateLimitState";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitSnapshot {
    pub version: u32,
    #[serde(rename = "postedAt")]
    pub posted_at: Vec<i64>,
}

impl Default for RateLimitSnapshot {
    fn default() -> Self {
        Self {
            version: 1,
            posted_at: Vec::new(),
        }
    }
}

/// Admission answer: either allowed, or denied with a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny { reason: String },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Admission::Allow => None,
            Admission::Deny { reason } => Some(reason),
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    snapshot: RateLimitSnapshot,
    store: StateStore,
}

impl RateLimiter {
    pub fn new(store: StateStore) -> Self {
        let snapshot = store.load(RECORD, RateLimitSnapshot::default);
        Self { snapshot, store }
    }

    fn prune(&mut self, now: i64) {
        let day_ago = now - DAY_MS;
        self.snapshot.posted_at.retain(|&ts| ts >= day_ago);
    }

    /// Hour bound is evaluated before the day bound; the first violated bound
    /// is the one reported.
    pub fn can_post(&mut self, now: i64, per_hour: usize, per_day: usize) -> Admission {
        self.prune(now);
        let hour_ago = now - HOUR_MS;
        let in_hour = self.snapshot.posted_at.iter().filter(|&&ts| ts >= hour_ago).count();
        let in_day = self.snapshot.posted_at.len();

        if in_hour >= per_hour {
            return Admission::Deny {
                reason: format!("hour quota reached ({in_hour}/{per_hour})"),
            };
        }
        if in_day >= per_day {
            return Admission::Deny {
                reason: format!("day quota reached ({in_day}/{per_day})"),
            };
        }
        Admission::Allow
    }

    /// Earliest future instant at which pruning would bring the window back
    /// under both bounds, plus a one-second margin. Used to schedule the next
    /// admission attempt without busy-polling.
    pub fn next_allowed_at(&mut self, now: i64, per_hour: usize, per_day: usize) -> i64 {
        self.prune(now);
        let hour_ago = now - HOUR_MS;
        let mut in_hour: Vec<i64> = self
            .snapshot
            .posted_at
            .iter()
            .copied()
            .filter(|&ts| ts >= hour_ago)
            .collect();
        in_hour.sort_unstable();
        let mut in_day = self.snapshot.posted_at.clone();
        in_day.sort_unstable();

        let mut next_at = now;
        if in_hour.len() >= per_hour && per_hour > 0 {
            let anchor = in_hour[in_hour.len() - per_hour];
            next_at = next_at.max(anchor + HOUR_MS + NEXT_ALLOWED_MARGIN_MS);
        }
        if in_day.len() >= per_day && per_day > 0 {
            let anchor = in_day[in_day.len() - per_day];
            next_at = next_at.max(anchor + DAY_MS + NEXT_ALLOWED_MARGIN_MS);
        }
        next_at
    }

    /// Record a successful publish and persist the snapshot immediately.
    pub fn track_post(&mut self, now: i64) {
        self.prune(now);
        self.snapshot.posted_at.push(now);
        if let Err(e) = self.store.save(RECORD, &self.snapshot) {
            tracing::warn!(error = %e, "failed to persist rate-limit snapshot");
        }
    }

    pub fn snapshot(&self) -> &RateLimitSnapshot {
        &self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> (tempfile::TempDir, RateLimiter) {
        let tmp = tempfile::tempdir().unwrap();
        let lm = RateLimiter::new(StateStore::new(tmp.path()));
        (tmp, lm)
    }

    #[test]
    fn allows_with_no_history() {
        let (_t, mut lm) = limiter();
        let now = 1_700_000_000_000;
        assert!(lm.can_post(now, 10, 100).is_allowed());
    }

    #[test]
    fn hour_quota_reported_first() {
        let (_t, mut lm) = limiter();
        let now = 1_700_000_000_000;
        lm.track_post(now - 1_000);
        lm.track_post(now - 2_000);
        let verdict = lm.can_post(now, 2, 100);
        assert!(!verdict.is_allowed());
        assert!(verdict.reason().unwrap().contains("hour quota reached"));
        assert!(verdict.reason().unwrap().contains("(2/2)"));
    }

    #[test]
    fn day_quota_when_hour_is_clear() {
        let (_t, mut lm) = limiter();
        let now = 1_700_000_000_000;
        // Three posts spread outside the last hour but inside the day.
        for k in 1..=3 {
            lm.track_post(now - (k * 2 * HOUR_MS));
        }
        let verdict = lm.can_post(now, 10, 3);
        assert!(!verdict.is_allowed());
        assert!(verdict.reason().unwrap().contains("day quota reached (3/3)"));
    }

    #[test]
    fn entries_older_than_a_day_never_count() {
        let (_t, mut lm) = limiter();
        let now = 1_700_000_000_000;
        lm.track_post(now - DAY_MS - 5_000);
        lm.track_post(now - DAY_MS - 10_000);
        assert!(lm.can_post(now, 1, 1).is_allowed());
        assert_eq!(lm.next_allowed_at(now, 1, 1), now);
    }

    #[test]
    fn next_allowed_anchors_on_nth_most_recent() {
        let (_t, mut lm) = limiter();
        let now = 1_700_000_000_000;
        lm.track_post(now - 30 * 60 * 1000); // 30 min ago
        lm.track_post(now - 10 * 60 * 1000); // 10 min ago
        // per_hour = 2: window clears one hour after the 2nd most recent post.
        let next = lm.next_allowed_at(now, 2, 100);
        assert_eq!(next, now - 30 * 60 * 1000 + HOUR_MS + 1_000);
        assert!(next > now);
    }

    #[test]
    fn snapshot_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let now = 1_700_000_000_000;
        {
            let mut lm = RateLimiter::new(StateStore::new(tmp.path()));
            lm.track_post(now - 1_000);
            lm.track_post(now - 2_000);
        }
        let mut reloaded = RateLimiter::new(StateStore::new(tmp.path()));
        assert_eq!(reloaded.snapshot().posted_at.len(), 2);
        assert!(!reloaded.can_post(now, 2, 100).is_allowed());
    }
}
