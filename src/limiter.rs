//! Per-identity rate limiting.
//!
//! Simple in-memory fixed window keyed by user identity. Counters live
//! only for the process lifetime; a restart resets everyone, which is an
//! acceptable soft limit for client event admission.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Configuration for rate limiting.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Maximum events per window.
    pub quota: u32,
    /// Window duration.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            quota: 10,
            window: Duration::from_secs(60),
        }
    }
}

struct CounterEntry {
    count: u32,
    window_start: Instant,
}

/// Rate limiter state tracking events per identity.
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Arc<Mutex<HashMap<String, CounterEntry>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check whether an event from this identity is admitted.
    ///
    /// Never raises on exceed; the caller decides how to react.
    pub fn allow(&self, identity: &str) -> bool {
        self.check(identity, Instant::now())
    }

    fn check(&self, identity: &str, now: Instant) -> bool {
        let mut state = self.state.lock();

        let entry = state
            .entry(identity.to_string())
            .or_insert(CounterEntry {
                count: 0,
                window_start: now,
            });

        // Reset window if expired
        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;

        if entry.count > self.config.quota {
            warn!(
                identity = %identity,
                count = entry.count,
                quota = self.config.quota,
                "🛑 Rate limit exceeded"
            );
            false
        } else {
            true
        }
    }

    /// Evict counters whose window is long gone (call from a maintenance task).
    pub fn cleanup(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        let window = self.config.window;

        state.retain(|_, entry| now.duration_since(entry.window_start) < window * 2);
    }

    #[cfg(test)]
    fn tracked_identities(&self) -> usize {
        self.state.lock().len()
    }
}
