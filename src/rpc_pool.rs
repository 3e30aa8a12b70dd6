// src/rpc_pool.rs

use crate::clock::SharedClock;
use crate::concurrency::{ConcurrencyConfig, ConcurrencyLimiter};
use crate::endpoint_metrics::{
    ExclusionPolicy, MetricsWindow, STATUS_RATE_LIMITED, STATUS_UNAVAILABLE,
};
use crate::health::{BackoffConfig, HealthTracker};
use crate::metrics;
use crate::probe::EndpointProbe;
use crate::session_store::SessionStore;
use crate::settings::{EndpointConfig, RpcSettings};
use crate::transport::{FailureKind, RpcTransport};
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use log::{debug, info, warn};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const ACQUIRE_RETRY_SLEEP: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PoolError {
    /// The entire pool stayed saturated or unhealthy for the caller's wait
    /// budget. Surfaced, never retried internally.
    #[error("no available RPC endpoint for session {session}")]
    NoAvailableEndpoint { session: String },
    #[error("no candidate endpoints configured")]
    EmptyCandidateList,
}

/// Outcome the caller reports back through the lease, exactly once.
#[derive(Debug, Clone, Copy)]
pub enum LeaseOutcome {
    Success { latency: Duration },
    Failure { kind: FailureKind },
}

/// Runtime state for one endpoint within one session's pool. Counters for
/// different endpoints never interact; each tracker serializes its own
/// updates internally.
pub struct EndpointState {
    pub config: EndpointConfig,
    pub health: HealthTracker,
    pub concurrency: ConcurrencyLimiter,
    pub metrics: MetricsWindow,
    limiter: DirectRateLimiter,
}

impl EndpointState {
    fn new(config: EndpointConfig, clock: SharedClock, settings: &RpcSettings) -> Self {
        let qps = NonZeroU32::new(settings.qps_limit).unwrap_or(NonZeroU32::MIN);
        Self {
            health: HealthTracker::new(
                clock.clone(),
                BackoffConfig {
                    base_ms: settings.backoff.base_ms,
                    cap_ms: settings.backoff.cap_ms,
                    forced_base_ms: settings.backoff.forced_base_ms,
                    forced_jitter_ms: settings.backoff.forced_jitter_ms,
                },
            ),
            concurrency: ConcurrencyLimiter::new(ConcurrencyConfig {
                initial_max: settings.concurrency.initial_max,
                hard_cap: settings.concurrency.hard_cap,
            }),
            metrics: MetricsWindow::new(
                clock,
                ExclusionPolicy {
                    window_ms: settings.exclusion.window_ms,
                    rate_limit_threshold: settings.exclusion.rate_limit_threshold,
                    unavailable_threshold: settings.exclusion.unavailable_threshold,
                },
            ),
            limiter: RateLimiter::direct(Quota::per_second(qps)),
            config,
        }
    }
}

/// The set of endpoints plus their runtime state, scoped to one session.
/// Read-mostly after bootstrap; a forced refresh replaces the whole pool.
pub struct Pool {
    endpoints: Vec<Arc<EndpointState>>,
}

impl Pool {
    fn new(configs: Vec<EndpointConfig>, clock: SharedClock, settings: &RpcSettings) -> Self {
        let endpoints = configs
            .into_iter()
            .map(|config| Arc::new(EndpointState::new(config, clock.clone(), settings)))
            .collect();
        Self { endpoints }
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn endpoints(&self) -> &[Arc<EndpointState>] {
        &self.endpoints
    }

    /// Candidate set for one selection pass, widened in stages so a
    /// transient bad-metrics period never fully starves the caller:
    /// healthy and not excluded, then healthy only, then the entire pool.
    fn candidates(&self) -> Vec<Arc<EndpointState>> {
        let healthy: Vec<Arc<EndpointState>> = self
            .endpoints
            .iter()
            .filter(|ep| ep.health.is_healthy() && !ep.health.is_in_backoff())
            .cloned()
            .collect();
        let preferred: Vec<Arc<EndpointState>> = healthy
            .iter()
            .filter(|ep| !ep.metrics.should_exclude())
            .cloned()
            .collect();

        if !preferred.is_empty() {
            preferred
        } else if !healthy.is_empty() {
            healthy
        } else {
            self.endpoints.clone()
        }
    }
}

/// Single-use capability for one endpoint. Exactly one `release` per lease;
/// a lease dropped without release frees its concurrency slot (so a bug
/// cannot deadlock the endpoint) but records no outcome.
pub struct Lease {
    endpoint: Arc<EndpointState>,
    /// False for `allow_stale` force-acquires: their release must not touch
    /// the in-flight counter.
    slot_counted: bool,
    released: bool,
}

impl Lease {
    pub fn url(&self) -> &str {
        &self.endpoint.config.url
    }

    pub fn endpoint_name(&self) -> &str {
        &self.endpoint.config.name
    }

    pub fn release(mut self, outcome: LeaseOutcome) {
        if self.slot_counted {
            self.endpoint.concurrency.release();
        }
        self.released = true;

        match outcome {
            LeaseOutcome::Success { latency } => {
                self.endpoint.health.record_success();
                self.endpoint.metrics.record_processed();
                self.endpoint
                    .metrics
                    .record_latency(latency.as_millis() as u64);
                self.endpoint.concurrency.increase_max();
            }
            LeaseOutcome::Failure { kind } => {
                self.endpoint.health.record_failure();
                self.endpoint.metrics.record_error();
                self.endpoint.concurrency.decrease_max();
                match kind {
                    FailureKind::RateLimited => {
                        self.endpoint.metrics.record_status(STATUS_RATE_LIMITED);
                        self.endpoint
                            .health
                            .force_throttle_backoff(&self.endpoint.config.url);
                        metrics::increment_rpc_429(&self.endpoint.config.url);
                    }
                    FailureKind::ServiceUnavailable => {
                        self.endpoint.metrics.record_status(STATUS_UNAVAILABLE);
                        self.endpoint
                            .health
                            .force_throttle_backoff(&self.endpoint.config.url);
                        metrics::increment_rpc_unavailable(&self.endpoint.config.url);
                    }
                    FailureKind::Other => {}
                }
            }
        }
        metrics::set_adaptive_concurrency(
            &self.endpoint.config.url,
            self.endpoint.concurrency.max_concurrent() as f64,
        );
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("endpoint", &self.endpoint.config.url)
            .field("slot_counted", &self.slot_counted)
            .finish_non_exhaustive()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            if self.slot_counted {
                self.endpoint.concurrency.release();
            }
            warn!(
                "lease for {} dropped without an outcome",
                self.endpoint.config.url
            );
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    /// How long to keep retrying when every candidate is at its cap.
    pub wait_for: Option<Duration>,
    /// Degraded mode: bypass the concurrency cap for this one lease instead
    /// of failing outright.
    pub allow_stale: bool,
}

/// Turns "I need to do one unit of RPC work" into a [`Lease`], hiding
/// endpoint choice, health and concurrency from callers. Pools are created
/// lazily per session, optionally seeded from the session store.
pub struct PoolManager {
    pools: DashMap<String, Arc<Pool>>,
    probe: EndpointProbe,
    store: Option<SessionStore>,
    candidates: Vec<EndpointConfig>,
    clock: SharedClock,
    settings: RpcSettings,
}

impl PoolManager {
    pub fn new(
        transport: Arc<dyn RpcTransport>,
        settings: RpcSettings,
        clock: SharedClock,
        store: Option<SessionStore>,
    ) -> Self {
        let probe = EndpointProbe::new(
            transport,
            Duration::from_millis(settings.probe_timeout_ms),
        );
        Self {
            pools: DashMap::new(),
            probe,
            store,
            candidates: settings.endpoints.clone(),
            clock,
            settings,
        }
    }

    /// Loads or lazily creates the session's pool: persisted list first,
    /// bootstrap probe otherwise.
    pub async fn ensure_pool(&self, session: &str) -> Result<Arc<Pool>, PoolError> {
        if let Some(pool) = self.pools.get(session) {
            return Ok(Arc::clone(pool.value()));
        }
        if self.candidates.is_empty() {
            return Err(PoolError::EmptyCandidateList);
        }

        let configs = match self.load_persisted(session).await {
            Some(persisted) => persisted,
            None => {
                let probed = self.probe.probe(&self.candidates).await;
                self.persist(session, &probed).await;
                probed
            }
        };

        let pool = Arc::new(Pool::new(configs, self.clock.clone(), &self.settings));
        info!(
            "session {} pool ready with {} endpoints",
            session,
            pool.len()
        );
        self.pools.insert(session.to_string(), pool.clone());
        Ok(pool)
    }

    /// Re-probes the candidates and replaces the whole pool, counters zeroed.
    pub async fn refresh_pool(&self, session: &str) -> Result<Arc<Pool>, PoolError> {
        if self.candidates.is_empty() {
            return Err(PoolError::EmptyCandidateList);
        }
        let probed = self.probe.probe(&self.candidates).await;
        self.persist(session, &probed).await;
        let pool = Arc::new(Pool::new(probed, self.clock.clone(), &self.settings));
        self.pools.insert(session.to_string(), pool.clone());
        info!("session {} pool refreshed", session);
        Ok(pool)
    }

    /// Drops a session's pool so state never leaks into an unrelated run.
    pub fn reset_session(&self, session: &str) {
        self.pools.remove(session);
    }

    async fn load_persisted(&self, session: &str) -> Option<Vec<EndpointConfig>> {
        self.store.as_ref()?.load(session).await
    }

    async fn persist(&self, session: &str, endpoints: &[EndpointConfig]) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(session, endpoints).await {
                warn!("failed to persist pool for session {}: {}", session, e);
            }
        }
    }

    pub async fn acquire(
        &self,
        session: &str,
        options: AcquireOptions,
    ) -> Result<Lease, PoolError> {
        let pool = self.ensure_pool(session).await?;
        let started = Instant::now();
        let wait_for = options.wait_for.unwrap_or(Duration::ZERO);

        loop {
            let candidates = pool.candidates();
            for endpoint in &candidates {
                if endpoint.concurrency.try_acquire() {
                    endpoint.limiter.until_ready().await;
                    debug!("leased {} for session {}", endpoint.config.url, session);
                    return Ok(Lease {
                        endpoint: endpoint.clone(),
                        slot_counted: true,
                        released: false,
                    });
                }
            }

            if options.allow_stale {
                if let Some(endpoint) = candidates.first() {
                    warn!(
                        "all endpoints saturated, force-leasing {} for session {}",
                        endpoint.config.url, session
                    );
                    endpoint.limiter.until_ready().await;
                    return Ok(Lease {
                        endpoint: endpoint.clone(),
                        slot_counted: false,
                        released: false,
                    });
                }
            }

            if started.elapsed() < wait_for {
                sleep(ACQUIRE_RETRY_SLEEP).await;
                continue;
            }

            metrics::increment_pool_starved(session);
            return Err(PoolError::NoAvailableEndpoint {
                session: session.to_string(),
            });
        }
    }

    /// Endpoints eligible for a cross-check fan-out: healthy first, the
    /// whole pool when nothing is healthy.
    pub async fn cross_check_endpoints(
        &self,
        session: &str,
    ) -> Result<Vec<EndpointConfig>, PoolError> {
        let pool = self.ensure_pool(session).await?;
        let healthy: Vec<EndpointConfig> = pool
            .endpoints()
            .iter()
            .filter(|ep| ep.health.is_healthy() && !ep.health.is_in_backoff())
            .map(|ep| ep.config.clone())
            .collect();
        if !healthy.is_empty() {
            return Ok(healthy);
        }
        Ok(pool
            .endpoints()
            .iter()
            .map(|ep| ep.config.clone())
            .collect())
    }

    pub async fn pool_size(&self, session: &str) -> Result<usize, PoolError> {
        Ok(self.ensure_pool(session).await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::ManualClock;
    use crate::settings::Settings;
    use crate::transport::mock::MockTransport;

    fn manager_with(urls: &[&str]) -> (PoolManager, Arc<MockTransport>, Arc<ManualClock>) {
        let transport = Arc::new(MockTransport::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut settings = Settings::default().rpc;
        settings.endpoints = urls
            .iter()
            .map(|u| EndpointConfig::new(*u, format!("http://{}", u)))
            .collect();
        let manager = PoolManager::new(transport.clone(), settings, clock.clone(), None);
        (manager, transport, clock)
    }

    #[tokio::test]
    async fn acquire_and_release_roundtrip() {
        let (manager, _, _) = manager_with(&["a"]);
        let lease = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(lease.endpoint_name(), "a");
        lease.release(LeaseOutcome::Success {
            latency: Duration::from_millis(20),
        });

        let pool = manager.ensure_pool("s").await.unwrap();
        let ep = &pool.endpoints()[0];
        assert_eq!(ep.concurrency.in_flight(), 0);
        // additive increase applied on the reported success
        assert_eq!(ep.concurrency.max_concurrent(), 3);
        assert_eq!(ep.metrics.average_latency_ms(), 20);
    }

    #[tokio::test]
    async fn saturated_pool_with_zero_wait_fails_immediately() {
        let (manager, _, _) = manager_with(&["a"]);
        let _l1 = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        let _l2 = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();

        let err = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableEndpoint { .. }));
    }

    #[tokio::test]
    async fn waiting_acquire_succeeds_when_a_slot_frees_up() {
        let (manager, _, _) = manager_with(&["a"]);
        let manager = Arc::new(manager);
        let l1 = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        let _l2 = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();

        let releaser = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            l1.release(LeaseOutcome::Success {
                latency: Duration::from_millis(5),
            });
        });

        let lease = manager
            .acquire(
                "s",
                AcquireOptions {
                    wait_for: Some(Duration::from_secs(2)),
                    allow_stale: false,
                },
            )
            .await
            .unwrap();
        releaser.await.unwrap();
        lease.release(LeaseOutcome::Success {
            latency: Duration::from_millis(5),
        });
    }

    #[tokio::test]
    async fn allow_stale_bypasses_cap_and_release_is_a_noop_on_the_counter() {
        let (manager, _, _) = manager_with(&["a"]);
        let l1 = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        let _l2 = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();

        let stale = manager
            .acquire(
                "s",
                AcquireOptions {
                    wait_for: None,
                    allow_stale: true,
                },
            )
            .await
            .unwrap();

        let pool = manager.ensure_pool("s").await.unwrap();
        let ep = pool.endpoints()[0].clone();
        assert_eq!(ep.concurrency.in_flight(), 2);

        // releasing the stale lease must not decrement a slot it never took
        stale.release(LeaseOutcome::Success {
            latency: Duration::from_millis(1),
        });
        assert_eq!(ep.concurrency.in_flight(), 2);

        l1.release(LeaseOutcome::Success {
            latency: Duration::from_millis(1),
        });
        assert_eq!(ep.concurrency.in_flight(), 1);
    }

    #[tokio::test]
    async fn backoff_endpoint_is_still_reachable_through_widening() {
        let (manager, _, _) = manager_with(&["a"]);
        let lease = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        lease.release(LeaseOutcome::Failure {
            kind: FailureKind::Other,
        });

        // sole endpoint is now in backoff, but the widened pass still leases it
        let lease = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(lease.endpoint_name(), "a");
        lease.release(LeaseOutcome::Success {
            latency: Duration::from_millis(1),
        });
    }

    #[tokio::test]
    async fn rate_limited_release_forces_backoff_and_records_status() {
        let (manager, _, clock) = manager_with(&["a", "b"]);
        let lease = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        let leased_name = lease.endpoint_name().to_string();
        lease.release(LeaseOutcome::Failure {
            kind: FailureKind::RateLimited,
        });

        let pool = manager.ensure_pool("s").await.unwrap();
        let ep = pool
            .endpoints()
            .iter()
            .find(|e| e.config.name == leased_name)
            .unwrap();
        assert!(!ep.health.is_healthy());
        assert_eq!(ep.metrics.count_in_window(STATUS_RATE_LIMITED, 60_000), 1);
        assert_eq!(ep.concurrency.max_concurrent(), 1);

        // past the maximum forced window the endpoint recovers
        clock.advance(60_001);
        assert!(ep.health.is_healthy());
    }

    #[tokio::test]
    async fn excluded_endpoint_is_skipped_while_alternatives_exist() {
        let (manager, _, _) = manager_with(&["a", "b"]);
        let pool = manager.ensure_pool("s").await.unwrap();
        let first = pool.endpoints()[0].clone();
        for _ in 0..20 {
            first.metrics.record_status(STATUS_RATE_LIMITED);
        }
        assert!(first.metrics.should_exclude());

        let lease = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        assert_eq!(lease.endpoint_name(), "b");
        lease.release(LeaseOutcome::Success {
            latency: Duration::from_millis(1),
        });
    }

    #[tokio::test]
    async fn dropped_lease_frees_its_slot() {
        let (manager, _, _) = manager_with(&["a"]);
        {
            let _lease = manager
                .acquire("s", AcquireOptions::default())
                .await
                .unwrap();
        }
        let pool = manager.ensure_pool("s").await.unwrap();
        assert_eq!(pool.endpoints()[0].concurrency.in_flight(), 0);
        // no outcome was recorded for the dropped lease
        assert_eq!(pool.endpoints()[0].concurrency.max_concurrent(), 2);
    }

    #[tokio::test]
    async fn dead_candidates_are_pruned_at_bootstrap() {
        let (manager, transport, _) = manager_with(&["a", "b", "c"]);
        transport.mark_dead("http://b");
        let pool = manager.ensure_pool("s").await.unwrap();
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn reset_session_rebuilds_state_from_zero() {
        let (manager, _, _) = manager_with(&["a"]);
        let lease = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap();
        lease.release(LeaseOutcome::Failure {
            kind: FailureKind::Other,
        });

        manager.reset_session("s");
        let pool = manager.ensure_pool("s").await.unwrap();
        assert!(pool.endpoints()[0].health.is_healthy());
        assert_eq!(pool.endpoints()[0].concurrency.max_concurrent(), 2);
    }

    #[tokio::test]
    async fn empty_candidate_list_is_a_hard_error() {
        let (manager, _, _) = manager_with(&[]);
        let err = manager
            .acquire("s", AcquireOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::EmptyCandidateList));
    }
}
