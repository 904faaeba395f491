//! Per-subject sliding-log rate limiting.
//!
//! Each subject key owns an ordered log of request instants covering the
//! trailing 60 seconds.  Keys are partitioned over a fixed number of shards,
//! each behind its own mutex, so requests for different subjects rarely
//! contend while updates to one subject's window are always serialized.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Length of the trailing window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Number of independently locked partitions.
const SHARD_COUNT: usize = 32;

type Shard = HashMap<String, VecDeque<Instant>>;

/// Sliding-log limiter: at most `limit` accepted requests per key in any
/// trailing [`WINDOW`].
pub struct RateLimiter {
    limit: usize,
    shards: Vec<Mutex<Shard>>,
}

impl RateLimiter {
    /// Create a limiter accepting `limit` requests per key per minute.
    pub fn new(limit: usize) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self { limit, shards }
    }

    /// The configured per-minute ceiling.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Record a request for `key` now; `false` means the request is rejected.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Instant::now())
    }

    /// Record a request for `key` at `now`.
    ///
    /// Timestamps older than `now - WINDOW` are dropped first.  A rejected
    /// request leaves the window unchanged.
    pub fn allow_at(&self, key: &str, now: Instant) -> bool {
        let mut shard = self.shard_for(key).lock();
        let window = shard.entry(key.to_string()).or_default();

        prune(window, now);
        if window.len() >= self.limit {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Number of requests currently counted against `key`.
    pub fn in_window(&self, key: &str, now: Instant) -> usize {
        let mut shard = self.shard_for(key).lock();
        match shard.get_mut(key) {
            Some(window) => {
                prune(window, now);
                window.len()
            }
            None => 0,
        }
    }

    /// Drop every window that has no timestamps left inside the trailing
    /// interval.  Returns the number of keys removed.
    pub fn purge_idle(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, window| {
                prune(window, now);
                !window.is_empty()
            });
            removed += before - shard.len();
        }
        removed
    }

    /// Total number of tracked keys across all shards.
    pub fn tracked_keys(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    fn shard_for(&self, key: &str) -> &Mutex<Shard> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }
}

/// Remove timestamps that fell out of the window ending at `now`.
fn prune(window: &mut VecDeque<Instant>, now: Instant) {
    let Some(cutoff) = now.checked_sub(WINDOW) else {
        return;
    };
    while window.front().is_some_and(|t| *t < cutoff) {
        window.pop_front();
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_allows_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(3);
        let now = Instant::now();
        assert!(limiter.allow_at("u1", now));
        assert!(limiter.allow_at("u1", now));
        assert!(limiter.allow_at("u1", now));
        assert!(!limiter.allow_at("u1", now));
        assert_eq!(limiter.in_window("u1", now), 3);
        assert_eq!(limiter.limit(), 3);
    }

    #[test]
    fn test_rejection_leaves_window_unchanged() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.allow_at("u1", now));
        for i in 1..10 {
            assert!(!limiter.allow_at("u1", now + Duration::from_secs(i)));
        }
        // Only the first request was logged, so it alone has to age out.
        assert!(limiter.allow_at("u1", now + WINDOW + Duration::from_millis(1)));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2);
        let start = Instant::now();
        assert!(limiter.allow_at("u1", start));
        assert!(limiter.allow_at("u1", start + Duration::from_secs(30)));
        assert!(!limiter.allow_at("u1", start + Duration::from_secs(59)));

        // The first request has aged out, the second has not.
        let later = start + Duration::from_secs(61);
        assert!(limiter.allow_at("u1", later));
        assert!(!limiter.allow_at("u1", later));
    }

    #[test]
    fn test_subjects_are_independent() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.allow_at("alice", now));
        assert!(!limiter.allow_at("alice", now));
        assert!(limiter.allow_at("bob", now));
        assert!(limiter.allow_at("10.0.0.1", now));
    }

    #[test]
    fn test_purge_idle() {
        let limiter = RateLimiter::new(5);
        let now = Instant::now();
        limiter.allow_at("old", now);
        limiter.allow_at("fresh", now + Duration::from_secs(50));
        assert_eq!(limiter.tracked_keys(), 2);

        let removed = limiter.purge_idle(now + Duration::from_secs(70));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.in_window("old", now + Duration::from_secs(70)), 0);
    }

    #[test]
    fn test_concurrent_requests_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(50));
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..100)
                        .filter(|_| limiter.allow_at("shared", now))
                        .count()
                })
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 50);
        assert_eq!(limiter.in_window("shared", now), 50);
    }
}
