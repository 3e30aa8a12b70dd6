// src/concurrency.rs

use std::sync::Mutex;

/// Bounds for the adaptive per-endpoint concurrency cap.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyConfig {
    /// Cap an endpoint starts the session with.
    pub initial_max: usize,
    /// Hard ceiling the additive increase never exceeds.
    pub hard_cap: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            initial_max: 2,
            hard_cap: 6,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ConcurrencyState {
    max_concurrent: usize,
    in_flight: usize,
}

/// Adaptive per-endpoint concurrency cap, AIMD style: every reported success
/// raises the cap by one (up to a hard ceiling), every reported failure
/// lowers it by one (down to a floor of one). Slot accounting is
/// non-blocking; waiting is the caller's concern.
pub struct ConcurrencyLimiter {
    state: Mutex<ConcurrencyState>,
    hard_cap: usize,
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            state: Mutex::new(ConcurrencyState {
                max_concurrent: config.initial_max.clamp(1, config.hard_cap),
                in_flight: 0,
            }),
            hard_cap: config.hard_cap.max(1),
        }
    }

    /// Takes a slot if one is free. Returns false when the endpoint is
    /// already at its cap.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.in_flight < state.max_concurrent {
            state.in_flight += 1;
            true
        } else {
            false
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Additive increase on a reported success.
    pub fn increase_max(&self) {
        let mut state = self.state.lock().unwrap();
        if state.max_concurrent < self.hard_cap {
            state.max_concurrent += 1;
        }
    }

    /// Decrease on a reported failure, never below one.
    pub fn decrease_max(&self) {
        let mut state = self.state.lock().unwrap();
        if state.max_concurrent > 1 {
            state.max_concurrent -= 1;
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.state.lock().unwrap().max_concurrent
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap().in_flight
    }
}
