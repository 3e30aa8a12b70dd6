// src/probe.rs

use crate::settings::EndpointConfig;
use crate::transport::RpcTransport;
use futures::future::join_all;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Bootstrap liveness check: one cheap read-only call per candidate,
/// concurrently, each bounded by a short timeout. Runs once per session (or
/// on a forced refresh) and its result becomes the initial pool.
pub struct EndpointProbe {
    transport: Arc<dyn RpcTransport>,
    probe_timeout: Duration,
}

impl EndpointProbe {
    pub fn new(transport: Arc<dyn RpcTransport>, probe_timeout: Duration) -> Self {
        Self {
            transport,
            probe_timeout,
        }
    }

    /// Returns the subset of candidates that answered the liveness call in
    /// time. When zero candidates pass, returns the original list unchanged:
    /// an empty pool is fatal for all downstream work, an unverified pool
    /// merely risks wasted retries.
    pub async fn probe(&self, candidates: &[EndpointConfig]) -> Vec<EndpointConfig> {
        if candidates.is_empty() {
            return Vec::new();
        }
        info!("probing {} candidate endpoints", candidates.len());

        let checks = candidates.iter().map(|ep| {
            let transport = self.transport.clone();
            let probe_timeout = self.probe_timeout;
            async move {
                let outcome = timeout(
                    probe_timeout,
                    transport.check_liveness(&ep.url, probe_timeout),
                )
                .await;
                match outcome {
                    Ok(Ok(())) => {
                        info!("probe ok: {}", ep.name);
                        Some(ep.clone())
                    }
                    Ok(Err(e)) => {
                        warn!("probe failed: {} ({})", ep.name, e);
                        None
                    }
                    Err(_) => {
                        warn!("probe timed out: {}", ep.name);
                        None
                    }
                }
            }
        });

        let alive: Vec<EndpointConfig> = join_all(checks).await.into_iter().flatten().collect();

        if alive.is_empty() {
            warn!(
                "no candidate endpoint answered the probe, keeping the full list of {}",
                candidates.len()
            );
            return candidates.to_vec();
        }

        info!("probe kept {}/{} endpoints", alive.len(), candidates.len());
        alive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn candidates() -> Vec<EndpointConfig> {
        vec![
            EndpointConfig::new("a", "http://rpc-a"),
            EndpointConfig::new("b", "http://rpc-b"),
            EndpointConfig::new("c", "http://rpc-c"),
        ]
    }

    #[tokio::test]
    async fn keeps_only_responsive_endpoints() {
        let transport = Arc::new(MockTransport::new());
        transport.mark_dead("http://rpc-b");
        let probe = EndpointProbe::new(transport, Duration::from_millis(100));

        let kept = probe.probe(&candidates()).await;
        let names: Vec<_> = kept.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn falls_back_to_full_list_when_everything_is_dead() {
        let transport = Arc::new(MockTransport::new());
        for ep in candidates() {
            transport.mark_dead(&ep.url);
        }
        let probe = EndpointProbe::new(transport, Duration::from_millis(50));

        let kept = probe.probe(&candidates()).await;
        assert_eq!(kept, candidates());
    }

    #[tokio::test]
    async fn empty_candidate_list_stays_empty() {
        let transport = Arc::new(MockTransport::new());
        let probe = EndpointProbe::new(transport, Duration::from_millis(50));
        assert!(probe.probe(&[]).await.is_empty());
    }
}
