//! Per-key send throttle for chatty, idempotent notifications.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Allows at most one send per key inside a fixed window.
#[derive(Debug)]
pub struct Throttle {
    window: Duration,
    last_sent: DashMap<String, Instant>,
}

impl Throttle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: DashMap::new(),
        }
    }

    /// Returns true and records the send if `key` is outside its window.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        if let Some(last) = self.last_sent.get(key)
            && now.duration_since(*last) < self.window
        {
            return false;
        }
        self.last_sent.insert(key.to_string(), now);
        self.prune(now);
        true
    }

    /// Forgets `key`, so the next send goes out immediately.
    pub fn reset(&self, key: &str) {
        self.last_sent.remove(key);
    }

    pub fn clear(&self) {
        self.last_sent.clear();
    }

    fn prune(&self, now: Instant) {
        self.last_sent
            .retain(|_, last| now.duration_since(*last) < self.window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suppresses_inside_window() {
        let throttle = Throttle::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(throttle.try_acquire_at("typing:c1", t0));
        assert!(!throttle.try_acquire_at("typing:c1", t0 + Duration::from_secs(4)));
        assert!(throttle.try_acquire_at("typing:c1", t0 + Duration::from_secs(5)));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttle = Throttle::new(Duration::from_secs(5));
        let t0 = Instant::now();
        assert!(throttle.try_acquire_at("typing:c1", t0));
        assert!(throttle.try_acquire_at("typing:c2", t0));
    }

    #[test]
    fn test_reset_allows_immediate_send() {
        let throttle = Throttle::new(Duration::from_secs(5));
        assert!(throttle.try_acquire("presence"));
        throttle.reset("presence");
        assert!(throttle.try_acquire("presence"));
    }

    #[test]
    fn test_expired_entries_are_pruned() {
        let throttle = Throttle::new(Duration::from_secs(1));
        let t0 = Instant::now();
        throttle.try_acquire_at("a", t0);
        throttle.try_acquire_at("b", t0 + Duration::from_secs(2));
        assert!(!throttle.last_sent.contains_key("a"));
    }
}
