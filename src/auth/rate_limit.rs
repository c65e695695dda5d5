use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Sliding-window attempt limiter keyed by an arbitrary string (account
/// number for OTP verification).
pub struct RateLimiter {
    window: Duration,
    max_attempts: usize,
    entries: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_attempts: usize) -> Self {
        Self {
            window,
            max_attempts,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if the request is allowed, `false` if rate-limited.
    /// Records the attempt and evicts expired timestamps for this key.
    pub fn check_and_record(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.entries.lock();
        let timestamps = map.entry(key.to_string()).or_default();

        timestamps.retain(|&t| now.duration_since(t) < self.window);

        if timestamps.len() >= self.max_attempts {
            return false;
        }

        timestamps.push(now);
        true
    }

    /// Forget a key, e.g. after a successful verification.
    pub fn reset(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    /// Remove all entries whose timestamps are entirely outside the window.
    /// Returns how many keys were dropped.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.lock();
        let before = map.len();
        map.retain(|_, timestamps| {
            timestamps.retain(|&t| now.duration_since(t) < self.window);
            !timestamps.is_empty()
        });
        before - map.len()
    }
}
