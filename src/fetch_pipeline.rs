// src/fetch_pipeline.rs

use crate::metrics;
use crate::rpc_pool::{AcquireOptions, LeaseOutcome, PoolError, PoolManager};
use crate::settings::PipelineSettings;
use crate::transport::{RpcTransport, SignatureRecord, TransactionDetail};
use anyhow::Result;
use futures::future::join_all;
use log::{debug, info, warn};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::sleep;

/// Result of a paginated, cutoff-bounded listing. `total_seen` counts every
/// record the scan touched, including those older than the cutoff, so a
/// caller can judge how partial the result is.
#[derive(Debug, Default)]
pub struct ListOutcome {
    pub items: Vec<SignatureRecord>,
    pub total_seen: usize,
}

/// Per-endpoint answer sets for one reconciliation pass. Transient value:
/// computed fresh per call, never persisted.
#[derive(Debug, Default)]
pub struct CrossCheckOutcome {
    pub per_endpoint: HashMap<String, HashSet<String>>,
    pub union: HashSet<String>,
    pub intersection: HashSet<String>,
}

impl CrossCheckOutcome {
    pub fn agreement_ratio(&self) -> f64 {
        if self.union.is_empty() {
            return 1.0;
        }
        self.intersection.len() as f64 / self.union.len() as f64
    }
}

/// Result of a bounded-concurrency detail fetch. Items whose every attempt
/// failed land in `failed` instead of being dropped.
#[derive(Debug, Default)]
pub struct DetailOutcome {
    pub items: Vec<TransactionDetail>,
    pub failed: Vec<String>,
}

/// The two recurring access patterns, performed reliably over leased
/// endpoints: paginated listing with cross-endpoint reconciliation, and
/// per-item detail fetching with independent retries.
pub struct ResilientFetchPipeline {
    manager: Arc<PoolManager>,
    transport: Arc<dyn RpcTransport>,
    settings: PipelineSettings,
}

impl ResilientFetchPipeline {
    pub fn new(
        manager: Arc<PoolManager>,
        transport: Arc<dyn RpcTransport>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            manager,
            transport,
            settings,
        }
    }

    pub fn manager(&self) -> &Arc<PoolManager> {
        &self.manager
    }

    /// Paginated signature listing, newest first, down to `cutoff_ms`.
    /// Each page request retries across freshly leased endpoints; a page
    /// that exhausts its attempts ends the scan with what was gathered so
    /// far rather than failing the whole listing.
    pub async fn list_since(
        &self,
        session: &str,
        account: &str,
        cutoff_ms: u64,
    ) -> Result<ListOutcome, PoolError> {
        let attempts_per_page = self.manager.pool_size(session).await?.max(1);
        let mut items: Vec<SignatureRecord> = Vec::new();
        let mut total_seen = 0usize;
        let mut before: Option<String> = None;

        for page in 1..=self.settings.max_pages {
            let page_records = match self
                .fetch_page(session, account, before.as_deref(), attempts_per_page)
                .await
            {
                Some(records) => records,
                None => {
                    warn!(
                        "account {} page {} exhausted its attempts, keeping partial scan",
                        account, page
                    );
                    break;
                }
            };

            if page_records.is_empty() {
                break;
            }
            let full_page = page_records.len() >= self.settings.page_size;
            total_seen += page_records.len();

            // records arrive newest first: stop consuming at the first one
            // older than the cutoff
            let mut reached_cutoff = false;
            for record in &page_records {
                match record.block_time_ms() {
                    Some(ts) if ts < cutoff_ms => {
                        reached_cutoff = true;
                        break;
                    }
                    Some(_) => items.push(record.clone()),
                    None => {}
                }
            }
            debug!(
                "account {} page {}: {} records, kept {}",
                account,
                page,
                page_records.len(),
                items.len()
            );

            if reached_cutoff || !full_page {
                break;
            }
            before = page_records.last().map(|r| r.signature.clone());
        }

        metrics::record_signatures_listed(total_seen as u64);
        info!(
            "account {}: scanned {} signatures, {} within cutoff",
            account,
            total_seen,
            items.len()
        );
        Ok(ListOutcome { items, total_seen })
    }

    async fn fetch_page(
        &self,
        session: &str,
        account: &str,
        before: Option<&str>,
        attempts: usize,
    ) -> Option<Vec<SignatureRecord>> {
        for attempt in 0..attempts {
            let lease = match self
                .manager
                .acquire(
                    session,
                    AcquireOptions {
                        wait_for: Some(Duration::from_millis(2_000)),
                        allow_stale: false,
                    },
                )
                .await
            {
                Ok(lease) => lease,
                Err(e) => {
                    debug!("page acquire failed ({}), retrying", e);
                    self.short_jitter().await;
                    continue;
                }
            };

            let started = Instant::now();
            match self
                .transport
                .signatures_for_account(lease.url(), account, before, self.settings.page_size)
                .await
            {
                Ok(records) => {
                    lease.release(LeaseOutcome::Success {
                        latency: started.elapsed(),
                    });
                    return Some(records);
                }
                Err(e) => {
                    let kind = e.kind();
                    lease.release(LeaseOutcome::Failure { kind });
                    if matches!(kind, crate::transport::FailureKind::RateLimited) {
                        let delay = exponential_delay(
                            self.settings.page_backoff_base_ms,
                            attempt as u32,
                            self.settings.page_backoff_cap_ms,
                        );
                        warn!(
                            "rate limited listing {} (attempt {}), sleeping {:?}",
                            account,
                            attempt + 1,
                            delay
                        );
                        sleep(delay).await;
                    } else {
                        debug!("page fetch error for {}: {}", account, e);
                        self.short_jitter().await;
                    }
                }
            }
        }
        None
    }

    /// Fans the same listing query out to `k` distinct endpoints and builds
    /// the per-endpoint / union / intersection sets. Each endpoint scan is
    /// time-boxed so one slow replica cannot dominate the pass; partial
    /// scans still contribute what they saw.
    pub async fn cross_check(
        &self,
        session: &str,
        account: &str,
        cutoff_ms: u64,
        k: usize,
    ) -> Result<CrossCheckOutcome, PoolError> {
        let endpoints = self.manager.cross_check_endpoints(session).await?;
        let chosen: Vec<_> = endpoints.into_iter().take(k.max(1)).collect();

        let scans = chosen.iter().map(|ep| {
            let url = ep.url.clone();
            async move {
                let signatures = self.scan_endpoint(&url, account, cutoff_ms).await;
                (url, signatures)
            }
        });
        let per_endpoint: HashMap<String, HashSet<String>> =
            join_all(scans).await.into_iter().collect();

        let mut union: HashSet<String> = HashSet::new();
        for set in per_endpoint.values() {
            union.extend(set.iter().cloned());
        }
        let mut sets = per_endpoint.values();
        let mut intersection: HashSet<String> = sets.next().cloned().unwrap_or_default();
        for set in sets {
            intersection.retain(|s| set.contains(s));
        }

        info!(
            "cross-check for {}: endpoints={} union={} intersection={}",
            account,
            per_endpoint.len(),
            union.len(),
            intersection.len()
        );
        Ok(CrossCheckOutcome {
            per_endpoint,
            union,
            intersection,
        })
    }

    /// One endpoint's view of the listing, bounded by the per-endpoint time
    /// budget and page cap. Errors end the scan with whatever was gathered.
    async fn scan_endpoint(&self, url: &str, account: &str, cutoff_ms: u64) -> HashSet<String> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut before: Option<String> = None;
        let started = Instant::now();
        let budget = Duration::from_millis(self.settings.cross_check_endpoint_budget_ms);

        for _ in 0..self.settings.cross_check_max_pages {
            if started.elapsed() > budget {
                warn!("cross-check scan budget exceeded for {}", url);
                break;
            }
            match self
                .transport
                .signatures_for_account(url, account, before.as_deref(), self.settings.page_size)
                .await
            {
                Ok(records) => {
                    if records.is_empty() {
                        break;
                    }
                    for record in &records {
                        if record.block_time_ms().map_or(false, |ts| ts >= cutoff_ms) {
                            seen.insert(record.signature.clone());
                        }
                    }
                    let last = records.last().cloned();
                    if records.len() < self.settings.page_size {
                        break;
                    }
                    if let Some(last) = &last {
                        if last.block_time_ms().map_or(false, |ts| ts < cutoff_ms) {
                            break;
                        }
                    }
                    before = last.map(|r| r.signature);
                }
                Err(e) if matches!(e.kind(), crate::transport::FailureKind::RateLimited) => {
                    // brief pause, then keep paging within the budget
                    let pause = 500 + rand::thread_rng().gen_range(0..800);
                    sleep(Duration::from_millis(pause)).await;
                }
                Err(e) => {
                    debug!("cross-check scan error on {}: {}", url, e);
                    break;
                }
            }
        }
        seen
    }

    /// Reconciles a listing against several endpoints' views. Widens the
    /// fan-out while agreement stays poor, then applies the decision rule:
    /// high agreement trusts the intersection (drops items only one replica
    /// claims to have seen); low agreement trusts the union (a lagging
    /// replica must not lose valid items); an empty intersection keeps the
    /// unvalidated listing as-is.
    pub async fn reconcile(
        &self,
        session: &str,
        account: &str,
        cutoff_ms: u64,
        items: Vec<SignatureRecord>,
    ) -> Result<Vec<SignatureRecord>, PoolError> {
        let started = Instant::now();
        let budget = Duration::from_millis(self.settings.cross_check_budget_ms);
        let mut k = self.settings.cross_check_initial;

        let mut cross = self.cross_check(session, account, cutoff_ms, k).await?;
        while !cross.union.is_empty()
            && cross.agreement_ratio() < self.settings.cross_check_threshold
            && k < self.settings.cross_check_max
        {
            if started.elapsed() > budget {
                warn!("cross-check time budget exceeded for {}", account);
                break;
            }
            k = (k + self.settings.cross_check_step).min(self.settings.cross_check_max);
            info!(
                "agreement {:.2} below threshold, widening cross-check to {} endpoints",
                cross.agreement_ratio(),
                k
            );
            cross = self.cross_check(session, account, cutoff_ms, k).await?;
            self.short_jitter().await;
        }

        if cross.union.is_empty() {
            return Ok(items);
        }
        if cross.intersection.is_empty() {
            warn!(
                "cross-check intersection empty for {}, keeping unvalidated listing",
                account
            );
            return Ok(items);
        }

        let ratio = cross.agreement_ratio();
        if ratio < self.settings.cross_check_threshold {
            // under-reporting is the worse failure mode: take the union,
            // reusing the timestamps we already have
            let known: HashMap<&str, &SignatureRecord> =
                items.iter().map(|r| (r.signature.as_str(), r)).collect();
            let merged = cross
                .union
                .iter()
                .map(|sig| {
                    known.get(sig.as_str()).map(|r| (*r).clone()).unwrap_or(
                        SignatureRecord {
                            signature: sig.clone(),
                            slot: None,
                            block_time: None,
                            err: None,
                        },
                    )
                })
                .collect::<Vec<_>>();
            warn!(
                "agreement {:.2} below threshold for {}, using union of {} signatures",
                ratio,
                account,
                merged.len()
            );
            return Ok(merged);
        }

        let before = items.len();
        let confirmed: Vec<SignatureRecord> = items
            .into_iter()
            .filter(|r| cross.intersection.contains(&r.signature))
            .collect();
        if confirmed.len() != before {
            warn!(
                "cross-check trimmed listing for {} from {} to {}",
                account,
                before,
                confirmed.len()
            );
        }
        Ok(confirmed)
    }

    /// Listing plus reconciliation in one call: the shape most callers want.
    pub async fn list_validated(
        &self,
        session: &str,
        account: &str,
        cutoff_ms: u64,
    ) -> Result<ListOutcome, PoolError> {
        let outcome = self.list_since(session, account, cutoff_ms).await?;
        if outcome.items.is_empty() {
            return Ok(outcome);
        }
        let items = self
            .reconcile(session, account, cutoff_ms, outcome.items)
            .await?;
        Ok(ListOutcome {
            items,
            total_seen: outcome.total_seen,
        })
    }

    /// Fetches full detail for every signature with a bounded number of
    /// outstanding leases. Every item retries independently; exhausted items
    /// are reported in `failed`, never dropped and never fatal to the batch.
    pub async fn fetch_details(&self, session: &str, signatures: &[String]) -> DetailOutcome {
        let gate = Arc::new(Semaphore::new(self.settings.detail_concurrency.max(1)));

        let tasks = signatures.iter().map(|signature| {
            let gate = gate.clone();
            async move {
                // closed only on shutdown, and we never close it
                let _permit = match gate.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(signature.clone()),
                };
                self.fetch_one_detail(session, signature).await
            }
        });

        let mut outcome = DetailOutcome::default();
        for result in join_all(tasks).await {
            match result {
                Ok(detail) => outcome.items.push(detail),
                Err(signature) => outcome.failed.push(signature),
            }
        }

        if !outcome.failed.is_empty() {
            metrics::increment_detail_fetch_failed(outcome.failed.len() as u64);
            warn!(
                "detail fetch: {} of {} signatures failed every attempt",
                outcome.failed.len(),
                signatures.len()
            );
        }
        outcome
    }

    async fn fetch_one_detail(
        &self,
        session: &str,
        signature: &str,
    ) -> Result<TransactionDetail, String> {
        for attempt in 0..self.settings.detail_max_attempts {
            let lease = match self
                .manager
                .acquire(
                    session,
                    AcquireOptions {
                        wait_for: Some(Duration::from_millis(5_000)),
                        allow_stale: false,
                    },
                )
                .await
            {
                Ok(lease) => lease,
                Err(e) => {
                    debug!("detail acquire failed ({}), retrying", e);
                    self.short_jitter().await;
                    continue;
                }
            };

            let started = Instant::now();
            match self.transport.transaction_detail(lease.url(), signature).await {
                Ok(Some(detail)) => {
                    lease.release(LeaseOutcome::Success {
                        latency: started.elapsed(),
                    });
                    // smooth burstiness even on the happy path
                    sleep(Duration::from_millis(25 + rand::thread_rng().gen_range(0..50))).await;
                    return Ok(detail);
                }
                Ok(None) => {
                    // the replica does not know this transaction yet
                    lease.release(LeaseOutcome::Failure {
                        kind: crate::transport::FailureKind::Other,
                    });
                    self.short_jitter().await;
                }
                Err(e) => {
                    let kind = e.kind();
                    lease.release(LeaseOutcome::Failure { kind });
                    if matches!(kind, crate::transport::FailureKind::RateLimited) {
                        let delay = exponential_delay(
                            self.settings.detail_backoff_base_ms,
                            attempt as u32,
                            self.settings.detail_backoff_cap_ms,
                        );
                        sleep(delay).await;
                    } else {
                        self.short_jitter().await;
                    }
                }
            }
        }
        Err(signature.to_string())
    }

    async fn short_jitter(&self) {
        let jitter = self.settings.retry_jitter_ms.max(1);
        let delay = 100.min(jitter) + rand::thread_rng().gen_range(0..jitter);
        sleep(Duration::from_millis(delay)).await;
    }
}

/// Exponential delay scaled by attempt count, capped, with up to 50% jitter.
fn exponential_delay(base_ms: u64, attempt: u32, cap_ms: u64) -> Duration {
    let raw = base_ms.saturating_mul(1u64 << attempt.min(16)).min(cap_ms);
    let jitter = if raw > 1 {
        rand::thread_rng().gen_range(0..raw / 2 + 1)
    } else {
        0
    };
    Duration::from_millis(raw + jitter)
}
