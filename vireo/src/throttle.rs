//! Coarse per-IP request gate.
//!
//! Each client address gets a counter; a background job clears the whole
//! map every five seconds, so the effective cap is `req_per_sec * 5` per
//! window.

use dashmap::DashMap;

pub struct Throttle {
    counters: DashMap<String, u32>,
    limit: u32,
}

impl Throttle {
    pub fn new(req_per_sec: u32) -> Self {
        Self {
            counters: DashMap::new(),
            limit: req_per_sec.saturating_mul(5),
        }
    }

    /// Count the attempt and decide whether it may proceed.
    pub fn allow(&self, ip: &str) -> bool {
        let mut counter = self.counters.entry(ip.to_string()).or_insert(0);
        *counter += 1;
        let allowed = *counter < self.limit;
        tracing::debug!(ip, attempts = *counter, allowed, "throttle");
        allowed
    }

    /// Open a fresh window for every client.
    pub fn reset(&self) {
        self.counters.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_allows_cap_minus_one() {
        let throttle = Throttle::new(1);
        for attempt in 1..=4 {
            assert!(throttle.allow("10.0.0.1"), "attempt {attempt}");
        }
        assert!(!throttle.allow("10.0.0.1"));
        assert!(!throttle.allow("10.0.0.1"));
    }

    #[test]
    fn clients_are_counted_separately() {
        let throttle = Throttle::new(1);
        for _ in 0..4 {
            assert!(throttle.allow("10.0.0.1"));
        }
        assert!(!throttle.allow("10.0.0.1"));
        assert!(throttle.allow("10.0.0.2"));
    }

    #[test]
    fn reset_opens_a_new_window() {
        let throttle = Throttle::new(1);
        for _ in 0..5 {
            throttle.allow("10.0.0.1");
        }
        assert!(!throttle.allow("10.0.0.1"));
        throttle.reset();
        assert!(throttle.allow("10.0.0.1"));
    }
}
