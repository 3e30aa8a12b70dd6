// src/health.rs

use crate::clock::SharedClock;
use log::warn;
use rand::Rng;
use std::sync::Mutex;

/// Backoff tuning for a single endpoint's circuit breaker.
#[derive(Debug, Clone, Copy)]
pub struct BackoffConfig {
    /// Base of the exponential backoff applied on every failure.
    pub base_ms: u64,
    /// Hard cap on the exponential backoff.
    pub cap_ms: u64,
    /// Base of the forced window applied on rate-limit / unavailable outcomes.
    pub forced_base_ms: u64,
    /// Upper bound of the uniform jitter added to the forced window.
    pub forced_jitter_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            cap_ms: 60_000,
            forced_base_ms: 30_000,
            forced_jitter_ms: 30_000,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HealthState {
    failures: u32,
    successes: u64,
    last_failure_ms: u64,
    last_success_ms: u64,
    backoff_until_ms: u64,
}

/// Per-endpoint circuit-breaker state: consecutive failures drive an
/// exponential, capped backoff window during which the endpoint is not
/// selected. Success resets everything.
pub struct HealthTracker {
    state: Mutex<HealthState>,
    config: BackoffConfig,
    clock: SharedClock,
}

impl HealthTracker {
    pub fn new(clock: SharedClock, config: BackoffConfig) -> Self {
        Self {
            state: Mutex::new(HealthState::default()),
            config,
            clock,
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap();
        state.successes += 1;
        state.last_success_ms = now;
        state.failures = 0;
        state.backoff_until_ms = 0;
    }

    pub fn record_failure(&self) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap();
        state.failures += 1;
        state.last_failure_ms = now;
        let exp = self
            .config
            .base_ms
            .saturating_mul(1u64 << state.failures.min(16));
        state.backoff_until_ms = now + exp.min(self.config.cap_ms);
    }

    /// Forces a randomized backoff window regardless of the exponential
    /// value, so that endpoints throttled at the same moment do not
    /// resynchronize their retries.
    pub fn force_throttle_backoff(&self, url: &str) {
        let now = self.clock.now_ms();
        let jitter = if self.config.forced_jitter_ms > 0 {
            rand::thread_rng().gen_range(0..self.config.forced_jitter_ms)
        } else {
            0
        };
        let until = now + self.config.forced_base_ms + jitter;
        let mut state = self.state.lock().unwrap();
        if until > state.backoff_until_ms {
            state.backoff_until_ms = until;
        }
        warn!(
            "endpoint {} throttled, backing off for {}ms",
            url,
            state.backoff_until_ms.saturating_sub(now)
        );
    }

    pub fn is_healthy(&self) -> bool {
        let state = self.state.lock().unwrap();
        self.clock.now_ms() > state.backoff_until_ms
    }

    pub fn is_in_backoff(&self) -> bool {
        let state = self.state.lock().unwrap();
        self.clock.now_ms() < state.backoff_until_ms
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.lock().unwrap().failures
    }
}
