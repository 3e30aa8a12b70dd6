// src/metrics.rs
//
// Wrapper functions so call sites stay unconditional; every wrapper is a
// no-op unless the `observability` feature is enabled.

#[cfg(feature = "observability")]
mod enabled {
    use metrics::{counter, describe_counter, describe_gauge, gauge, histogram, Unit};

    /// Installs the Prometheus recorder and its scrape endpoint.
    pub fn init_exporter() -> anyhow::Result<()> {
        metrics_exporter_prometheus::PrometheusBuilder::new().install()?;
        describe_metrics();
        Ok(())
    }

    pub fn describe_metrics() {
        describe_counter!(
            "rpc_429_total",
            Unit::Count,
            "Rate-limit responses per provider."
        );
        describe_counter!(
            "rpc_unavailable_total",
            Unit::Count,
            "Service-unavailable responses per provider."
        );
        describe_counter!(
            "pool_starved_total",
            Unit::Count,
            "Acquire calls that exhausted their wait budget."
        );
        describe_gauge!(
            "adaptive_concurrency_limit",
            "Current AIMD concurrency cap per provider."
        );
        describe_counter!("cache_hit_total", Unit::Count, "Namespaced cache hits.");
        describe_counter!("cache_miss_total", Unit::Count, "Namespaced cache misses.");
        describe_counter!(
            "signatures_listed_total",
            Unit::Count,
            "Signatures seen by paginated scans."
        );
        describe_counter!(
            "detail_fetch_failed_total",
            Unit::Count,
            "Items whose every detail-fetch attempt failed."
        );
    }

    pub fn increment_rpc_429(url: &str) {
        counter!("rpc_429_total", 1, "provider" => url.to_string());
    }

    pub fn increment_rpc_unavailable(url: &str) {
        counter!("rpc_unavailable_total", 1, "provider" => url.to_string());
    }

    pub fn increment_pool_starved(session: &str) {
        counter!("pool_starved_total", 1, "session" => session.to_string());
    }

    pub fn set_adaptive_concurrency(url: &str, value: f64) {
        gauge!("adaptive_concurrency_limit", value, "provider" => url.to_string());
    }

    pub fn increment_cache_hit(namespace: &str) {
        counter!("cache_hit_total", 1, "namespace" => namespace.to_string());
    }

    pub fn increment_cache_miss(namespace: &str) {
        counter!("cache_miss_total", 1, "namespace" => namespace.to_string());
    }

    pub fn record_signatures_listed(count: u64) {
        counter!("signatures_listed_total", count);
    }

    pub fn increment_detail_fetch_failed(count: u64) {
        counter!("detail_fetch_failed_total", count);
    }

    pub fn record_rpc_latency(url: &str, latency: std::time::Duration) {
        histogram!("rpc_latency_ms", latency.as_millis() as f64, "provider" => url.to_string());
    }
}

#[cfg(feature = "observability")]
pub use enabled::*;

#[cfg(not(feature = "observability"))]
mod disabled {
    pub fn init_exporter() -> anyhow::Result<()> {
        Ok(())
    }
    pub fn describe_metrics() {}
    pub fn increment_rpc_429(_url: &str) {}
    pub fn increment_rpc_unavailable(_url: &str) {}
    pub fn increment_pool_starved(_session: &str) {}
    pub fn set_adaptive_concurrency(_url: &str, _value: f64) {}
    pub fn increment_cache_hit(_namespace: &str) {}
    pub fn increment_cache_miss(_namespace: &str) {}
    pub fn record_signatures_listed(_count: u64) {}
    pub fn increment_detail_fetch_failed(_count: u64) {}
    pub fn record_rpc_latency(_url: &str, _latency: std::time::Duration) {}
}

#[cfg(not(feature = "observability"))]
pub use disabled::*;
