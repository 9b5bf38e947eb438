//! Sliding-window limiter keyed by caller (user id or address).
//!
//! State is in memory and resets on restart. Each key keeps the timestamps
//! of its attempts inside the current window; expired stamps are pruned on
//! every check and idle keys are swept once the map grows past `max_keys`,
//! at most once per window.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::clock::Clock;
use crate::engine::EngineError;
use crate::model::Ms;
use crate::observability::{RATE_LIMITED_TOTAL, RATE_LIMIT_KEYS};

#[derive(Default)]
struct Attempts {
    keys: HashMap<String, VecDeque<Ms>>,
    last_sweep: Option<Ms>,
}

impl Attempts {
    /// Drop keys with no attempt after `cutoff`.
    fn sweep(&mut self, now: Ms, cutoff: Ms) {
        self.keys.retain(|_, stamps| {
            prune(stamps, cutoff);
            !stamps.is_empty()
        });
        self.last_sweep = Some(now);
    }
}

pub struct RateLimiter {
    attempts: Mutex<Attempts>,
    clock: Arc<dyn Clock>,
    max_keys: usize,
}

fn prune(stamps: &mut VecDeque<Ms>, cutoff: Ms) {
    while stamps.front().is_some_and(|t| *t <= cutoff) {
        stamps.pop_front();
    }
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>, max_keys: usize) -> Self {
        Self {
            attempts: Mutex::new(Attempts::default()),
            clock,
            max_keys: max_keys.max(1),
        }
    }

    /// Record an attempt for `key` if fewer than `max_requests` happened in
    /// the last `window`. Refused attempts are not recorded.
    pub fn check(&self, key: &str, max_requests: usize, window: Duration) -> Result<(), EngineError> {
        let now = self.clock.now_ms();
        let window_ms = Ms::try_from(window.as_millis()).unwrap_or(Ms::MAX);
        let cutoff = now.saturating_sub(window_ms);

        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        if attempts.keys.len() >= self.max_keys
            && !attempts.keys.contains_key(key)
            && attempts
                .last_sweep
                .is_none_or(|at| now.saturating_sub(at) >= window_ms)
        {
            attempts.sweep(now, cutoff);
        }

        let stamps = attempts.keys.entry(key.to_string()).or_default();
        prune(stamps, cutoff);

        if stamps.len() >= max_requests {
            let oldest = stamps.front().copied().unwrap_or(now);
            let wait_ms = oldest.saturating_add(window_ms).saturating_sub(now).max(0);
            let retry_after_secs = u64::try_from(wait_ms).unwrap_or(0).div_ceil(1000).max(1);
            metrics::counter!(RATE_LIMITED_TOTAL).increment(1);
            tracing::debug!(key, retry_after_secs, "rate limit hit");
            return Err(EngineError::TooManyRequests { retry_after_secs });
        }

        stamps.push_back(now);
        metrics::gauge!(RATE_LIMIT_KEYS).set(attempts.keys.len() as f64);
        Ok(())
    }

    pub fn tracked_keys(&self) -> usize {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner).keys.len()
    }
}
