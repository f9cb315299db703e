//! Dapp-message hash dedup.
//!
//! The original keeps a set that grows forever; per the redesign note in
//! SPEC_FULL §10 this is a bounded LRU with a TTL comparable to the
//! gossip horizon, so long-running nodes don't leak memory.

use std::collections::HashMap;
use std::time::{Duration, Instant};

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_TTL: Duration = Duration::from_secs(600);

pub struct MessageDedup {
    capacity: usize,
    ttl: Duration,
    seen: HashMap<String, Instant>,
    order: std::collections::VecDeque<String>,
}

impl Default for MessageDedup {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

impl MessageDedup {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            seen: HashMap::new(),
            order: std::collections::VecDeque::new(),
        }
    }

    fn evict_expired(&mut self) {
        let ttl = self.ttl;
        let now = Instant::now();
        while let Some(front) = self.order.front() {
            match self.seen.get(front) {
                Some(&t) if now.duration_since(t) > ttl => {
                    let hash = self.order.pop_front().unwrap();
                    self.seen.remove(&hash);
                }
                _ => break,
            }
        }
    }

    /// Returns `true` if `hash` was not seen before (and records it).
    /// Returns `false` for a duplicate within the TTL window.
    pub fn check_and_insert(&mut self, hash: &str) -> bool {
        self.evict_expired();
        if self.seen.contains_key(hash) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(hash.to_string(), Instant::now());
        self.order.push_back(hash.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_is_not_a_duplicate() {
        let mut d = MessageDedup::default();
        assert!(d.check_and_insert("h1"));
    }

    #[test]
    fn repeat_hash_is_a_duplicate() {
        let mut d = MessageDedup::default();
        assert!(d.check_and_insert("h1"));
        assert!(!d.check_and_insert("h1"));
    }

    #[test]
    fn capacity_evicts_oldest() {
        let mut d = MessageDedup::new(2, Duration::from_secs(600));
        assert!(d.check_and_insert("h1"));
        assert!(d.check_and_insert("h2"));
        assert!(d.check_and_insert("h3"));
        assert!(d.check_and_insert("h1"));
    }

    #[test]
    fn ttl_expiry_allows_reprocessing() {
        let mut d = MessageDedup::new(10, Duration::from_millis(10));
        assert!(d.check_and_insert("h1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(d.check_and_insert("h1"));
    }
}
