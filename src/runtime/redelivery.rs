//! Failed-attempt counting for queues that do not report a delivery count

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded table of failed attempts keyed by payload fingerprint
///
/// Identical payloads share a counter. The oldest entry is evicted once the
/// table is full.
#[derive(Debug)]
pub struct RedeliveryTracker {
    attempts: HashMap<u64, u32>,
    order: VecDeque<u64>,
    capacity: usize,
}

impl RedeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            attempts: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn fingerprint(payload: &[u8]) -> u64 {
        let mut hasher = DefaultHasher::new();
        payload.hash(&mut hasher);
        hasher.finish()
    }

    /// Count one more failed attempt; returns the total so far
    pub fn record_failure(&mut self, payload: &[u8]) -> u32 {
        let key = Self::fingerprint(payload);

        if let Some(count) = self.attempts.get_mut(&key) {
            *count = count.saturating_add(1);
            return *count;
        }

        while self.attempts.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.attempts.remove(&oldest);
                }
                None => break,
            }
        }

        self.attempts.insert(key, 1);
        self.order.push_back(key);
        1
    }

    /// Failed attempts recorded for `payload`
    pub fn attempts(&self, payload: &[u8]) -> u32 {
        self.attempts
            .get(&Self::fingerprint(payload))
            .copied()
            .unwrap_or(0)
    }

    /// Drop the counter of a message that reached a terminal disposition
    pub fn forget(&mut self, payload: &[u8]) {
        let key = Self::fingerprint(payload);
        if self.attempts.remove(&key).is_some() {
            self.order.retain(|k| *k != key);
        }
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

impl Default for RedeliveryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_per_payload() {
        let mut tracker = RedeliveryTracker::default();

        assert_eq!(tracker.record_failure(b"a"), 1);
        assert_eq!(tracker.record_failure(b"a"), 2);
        assert_eq!(tracker.record_failure(b"b"), 1);
        assert_eq!(tracker.attempts(b"a"), 2);
        assert_eq!(tracker.attempts(b"c"), 0);
        assert_eq!(tracker.len(), 2);
    }

    #[test]
    fn test_forget() {
        let mut tracker = RedeliveryTracker::default();
        tracker.record_failure(b"a");
        tracker.forget(b"a");

        assert!(tracker.is_empty());
        assert_eq!(tracker.record_failure(b"a"), 1);
    }

    #[test]
    fn test_evicts_oldest() {
        let mut tracker = RedeliveryTracker::new(2);
        tracker.record_failure(b"a");
        tracker.record_failure(b"b");
        tracker.record_failure(b"c");

        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.attempts(b"a"), 0);
        assert_eq!(tracker.attempts(b"b"), 1);
        assert_eq!(tracker.attempts(b"c"), 1);
    }
}
