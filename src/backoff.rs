// ===============================
// src/backoff.rs
// ===============================
use std::time::Duration;

use ahash::AHashMap as HashMap;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
    /// A key is forgotten this long after a successful subscribe/login ack.
    pub reset_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            max: Duration::from_secs(60),
            reset_after: Duration::from_secs(60),
        }
    }
}

/// Reconnect delays per connection key (resolved URL + query).
/// 1, 2, 4, ... capped at `max`; absent again after `reset`.
#[derive(Debug, Default)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    delays: Mutex<HashMap<String, Duration>>,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            delays: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn next_delay(&self, key: &str) -> Duration {
        let mut delays = self.delays.lock();
        let next = match delays.get(key) {
            None => self.policy.initial,
            Some(prev) => prev
                .checked_mul(self.policy.multiplier)
                .unwrap_or(self.policy.max)
                .min(self.policy.max),
        };
        delays.insert(key.to_string(), next);
        next
    }

    pub fn current(&self, key: &str) -> Option<Duration> {
        self.delays.lock().get(key).copied()
    }

    pub fn reset(&self, key: &str) {
        self.delays.lock().remove(key);
    }
}
