// src/endpoint_metrics.rs

use crate::clock::SharedClock;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const STATUS_RATE_LIMITED: u16 = 429;
pub const STATUS_UNAVAILABLE: u16 = 503;

/// Tuning for the sliding-window exclusion policy.
#[derive(Debug, Clone, Copy)]
pub struct ExclusionPolicy {
    pub window_ms: u64,
    pub rate_limit_threshold: usize,
    pub unavailable_threshold: usize,
}

impl Default for ExclusionPolicy {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            rate_limit_threshold: 20,
            unavailable_threshold: 5,
        }
    }
}

const LATENCY_CAPACITY: usize = 100;
const STATUS_CAPACITY: usize = 500;

#[derive(Debug, Default)]
struct MetricsState {
    latencies_ms: VecDeque<u64>,
    processed: u64,
    errors: u64,
    status_timestamps: HashMap<u16, VecDeque<u64>>,
}

/// Rolling per-endpoint samples: recent latencies and a time-windowed count
/// of throttle-class status codes. Drives a temporary exclusion signal that
/// is stricter than the circuit breaker — an endpoint can be out of backoff
/// yet still trending badly enough to skip for the current selection pass.
pub struct MetricsWindow {
    state: Mutex<MetricsState>,
    policy: ExclusionPolicy,
    clock: SharedClock,
}

impl MetricsWindow {
    pub fn new(clock: SharedClock, policy: ExclusionPolicy) -> Self {
        Self {
            state: Mutex::new(MetricsState::default()),
            policy,
            clock,
        }
    }

    pub fn record_latency(&self, latency_ms: u64) {
        let mut state = self.state.lock().unwrap();
        state.latencies_ms.push_back(latency_ms);
        if state.latencies_ms.len() > LATENCY_CAPACITY {
            state.latencies_ms.pop_front();
        }
    }

    pub fn average_latency_ms(&self) -> u64 {
        let state = self.state.lock().unwrap();
        if state.latencies_ms.is_empty() {
            return 0;
        }
        state.latencies_ms.iter().sum::<u64>() / state.latencies_ms.len() as u64
    }

    pub fn record_processed(&self) {
        self.state.lock().unwrap().processed += 1;
    }

    pub fn record_error(&self) {
        self.state.lock().unwrap().errors += 1;
    }

    pub fn record_status(&self, code: u16) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock().unwrap();
        let stamps = state.status_timestamps.entry(code).or_default();
        stamps.push_back(now);
        if stamps.len() > STATUS_CAPACITY {
            stamps.pop_front();
        }
    }

    pub fn count_in_window(&self, code: u16, window_ms: u64) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(window_ms);
        let state = self.state.lock().unwrap();
        state
            .status_timestamps
            .get(&code)
            .map(|stamps| stamps.iter().filter(|&&ts| ts >= cutoff).count())
            .unwrap_or(0)
    }

    /// Sliding-window exclusion signal, independent of the circuit breaker.
    /// Never removes an endpoint permanently — only filters it out of the
    /// current selection pass.
    pub fn should_exclude(&self) -> bool {
        let rate_limited = self.count_in_window(STATUS_RATE_LIMITED, self.policy.window_ms);
        let unavailable = self.count_in_window(STATUS_UNAVAILABLE, self.policy.window_ms);
        rate_limited >= self.policy.rate_limit_threshold
            || unavailable >= self.policy.unavailable_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use std::sync::Arc;

    fn window(clock: &Arc<ManualClock>) -> MetricsWindow {
        MetricsWindow::new(clock.clone(), ExclusionPolicy::default())
    }

    #[test]
    fn average_latency_over_bounded_buffer() {
        let clock = Arc::new(ManualClock::new(0));
        let metrics = window(&clock);
        assert_eq!(metrics.average_latency_ms(), 0);

        metrics.record_latency(100);
        metrics.record_latency(300);
        assert_eq!(metrics.average_latency_ms(), 200);

        // overflow the buffer with constant samples; the early outliers age out
        for _ in 0..LATENCY_CAPACITY {
            metrics.record_latency(50);
        }
        assert_eq!(metrics.average_latency_ms(), 50);
    }

    #[test]
    fn count_in_window_ignores_old_stamps() {
        let clock = Arc::new(ManualClock::new(100_000));
        let metrics = window(&clock);

        metrics.record_status(STATUS_RATE_LIMITED);
        clock.advance(59_000);
        metrics.record_status(STATUS_RATE_LIMITED);
        assert_eq!(metrics.count_in_window(STATUS_RATE_LIMITED, 60_000), 2);

        clock.advance(2_000);
        assert_eq!(metrics.count_in_window(STATUS_RATE_LIMITED, 60_000), 1);
    }

    #[test]
    fn exclusion_at_rate_limit_threshold() {
        let clock = Arc::new(ManualClock::new(100_000));
        let metrics = window(&clock);

        for _ in 0..19 {
            metrics.record_status(STATUS_RATE_LIMITED);
        }
        assert!(!metrics.should_exclude());
        metrics.record_status(STATUS_RATE_LIMITED);
        assert!(metrics.should_exclude());

        // window slides: after 60s the stamps no longer count
        clock.advance(60_001);
        assert!(!metrics.should_exclude());
    }

    #[test]
    fn exclusion_at_unavailable_threshold() {
        let clock = Arc::new(ManualClock::new(100_000));
        let metrics = window(&clock);

        for _ in 0..4 {
            metrics.record_status(STATUS_UNAVAILABLE);
        }
        assert!(!metrics.should_exclude());
        metrics.record_status(STATUS_UNAVAILABLE);
        assert!(metrics.should_exclude());
    }
}
