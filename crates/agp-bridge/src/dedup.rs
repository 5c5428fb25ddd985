//! Bounded memory of recently processed message ids.
//!
//! Ids are kept in insertion order next to a hash set for O(1) lookups. When
//! the ceiling is exceeded the oldest half is dropped, so the cache always
//! retains the most recently recorded ids, which are the ones a replaying peer
//! is most likely to resend.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

/// Default number of ids retained before eviction.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default retention window for a recorded id.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(600);

/// Default interval between periodic sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    max_age: Option<Duration>,
    order: VecDeque<(String, Instant)>,
    ids: HashSet<String>,
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::with_max_age(DEFAULT_CAPACITY, Some(DEFAULT_MAX_AGE))
    }
}

impl DedupCache {
    /// Create a cache without age-based expiry.
    pub fn new(capacity: usize) -> Self {
        Self::with_max_age(capacity, None)
    }

    /// Create a cache whose sweeps also drop ids older than `max_age`.
    ///
    /// Capacities below 2 are raised to 2 so eviction always keeps something.
    pub fn with_max_age(capacity: usize, max_age: Option<Duration>) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            max_age,
            order: VecDeque::with_capacity(capacity + 1),
            ids: HashSet::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Whether `id` has already been recorded.
    pub fn seen(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Record `id`. Returns `false` if it was already present.
    ///
    /// Exceeding the ceiling evicts synchronously down to half the capacity.
    pub fn record(&mut self, id: impl Into<String>) -> bool {
        self.record_at(id.into(), Instant::now())
    }

    /// Drop expired ids, then enforce the ceiling. Returns how many were removed.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn record_at(&mut self, id: String, now: Instant) -> bool {
        if !self.ids.insert(id.clone()) {
            return false;
        }
        self.order.push_back((id, now));
        if self.order.len() > self.capacity {
            self.evict_to(self.capacity / 2);
        }
        true
    }

    fn sweep_at(&mut self, now: Instant) -> usize {
        let before = self.order.len();

        if let Some(max_age) = self.max_age {
            while let Some((_, recorded_at)) = self.order.front() {
                if now.saturating_duration_since(*recorded_at) <= max_age {
                    break;
                }
                if let Some((id, _)) = self.order.pop_front() {
                    self.ids.remove(&id);
                }
            }
        }

        if self.order.len() > self.capacity {
            self.evict_to(self.capacity / 2);
        }

        before - self.order.len()
    }

    fn evict_to(&mut self, keep: usize) {
        while self.order.len() > keep {
            match self.order.pop_front() {
                Some((id, _)) => {
                    self.ids.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_seen() {
        let mut cache = DedupCache::new(10);
        assert!(!cache.seen("a"));
        assert!(cache.record("a"));
        assert!(cache.seen("a"));
        assert!(!cache.record("a"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_eviction_keeps_newest_half() {
        let mut cache = DedupCache::new(10);
        for i in 1..=11 {
            cache.record(format!("id-{i}"));
        }

        assert_eq!(cache.len(), 5);
        for i in 1..=6 {
            assert!(!cache.seen(&format!("id-{i}")), "id-{i} should be evicted");
        }
        for i in 7..=11 {
            assert!(cache.seen(&format!("id-{i}")), "id-{i} should be retained");
        }
    }

    #[test]
    fn test_size_never_exceeds_capacity() {
        let mut cache = DedupCache::new(8);
        for i in 0..100 {
            cache.record(format!("id-{i}"));
            assert!(cache.len() <= cache.capacity());
        }
        assert!(cache.seen("id-99"));
    }

    #[test]
    fn test_duplicate_does_not_count_toward_ceiling() {
        let mut cache = DedupCache::new(4);
        for _ in 0..10 {
            cache.record("same");
        }
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_sweep_drops_expired_ids() {
        let start = Instant::now();
        let mut cache = DedupCache::with_max_age(10, Some(Duration::from_secs(60)));
        cache.record_at("old".into(), start);
        cache.record_at("new".into(), start + Duration::from_secs(50));

        assert_eq!(cache.sweep_at(start + Duration::from_secs(30)), 0);
        assert_eq!(cache.sweep_at(start + Duration::from_secs(90)), 1);
        assert!(!cache.seen("old"));
        assert!(cache.seen("new"));
    }

    #[test]
    fn test_sweep_without_max_age_keeps_everything_under_ceiling() {
        let start = Instant::now();
        let mut cache = DedupCache::new(10);
        cache.record_at("a".into(), start);
        assert_eq!(cache.sweep_at(start + Duration::from_secs(86_400)), 0);
        assert!(cache.seen("a"));
    }

    #[test]
    fn test_tiny_capacity_is_raised() {
        let mut cache = DedupCache::new(0);
        assert_eq!(cache.capacity(), 2);
        cache.record("a");
        cache.record("b");
        cache.record("c");
        assert_eq!(cache.len(), 1);
        assert!(cache.seen("c"));
    }
}
