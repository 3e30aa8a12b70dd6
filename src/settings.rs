// src/settings.rs

use config::{Config, ConfigError, File};
use serde::{Deserialize, Serialize};
use std::env;

/// Identity of one upstream RPC provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointConfig {
    pub name: String,
    pub url: String,
}

impl EndpointConfig {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackoffSettings {
    #[serde(default = "default_backoff_base_ms")]
    pub base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub cap_ms: u64,
    #[serde(default = "default_forced_base_ms")]
    pub forced_base_ms: u64,
    #[serde(default = "default_forced_jitter_ms")]
    pub forced_jitter_ms: u64,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_cap_ms() -> u64 {
    60_000
}
fn default_forced_base_ms() -> u64 {
    30_000
}
fn default_forced_jitter_ms() -> u64 {
    30_000
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base_ms(),
            cap_ms: default_backoff_cap_ms(),
            forced_base_ms: default_forced_base_ms(),
            forced_jitter_ms: default_forced_jitter_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConcurrencySettings {
    #[serde(default = "default_initial_concurrency")]
    pub initial_max: usize,
    #[serde(default = "default_concurrency_hard_cap")]
    pub hard_cap: usize,
}

fn default_initial_concurrency() -> usize {
    2
}
fn default_concurrency_hard_cap() -> usize {
    6
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            initial_max: default_initial_concurrency(),
            hard_cap: default_concurrency_hard_cap(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExclusionSettings {
    #[serde(default = "default_exclusion_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_rate_limit_threshold")]
    pub rate_limit_threshold: usize,
    #[serde(default = "default_unavailable_threshold")]
    pub unavailable_threshold: usize,
}

fn default_exclusion_window_ms() -> u64 {
    60_000
}
fn default_rate_limit_threshold() -> usize {
    20
}
fn default_unavailable_threshold() -> usize {
    5
}

impl Default for ExclusionSettings {
    fn default() -> Self {
        Self {
            window_ms: default_exclusion_window_ms(),
            rate_limit_threshold: default_rate_limit_threshold(),
            unavailable_threshold: default_unavailable_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcSettings {
    /// Static candidate endpoint list handed to the bootstrap probe.
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Per-endpoint request pacing quota.
    #[serde(default = "default_qps_limit")]
    pub qps_limit: u32,
    /// Default budget an acquire call waits for a free slot.
    #[serde(default = "default_acquire_wait_ms")]
    pub acquire_wait_ms: u64,
    #[serde(default)]
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    #[serde(default)]
    pub exclusion: ExclusionSettings,
}

fn default_probe_timeout_ms() -> u64 {
    4_000
}
fn default_request_timeout_ms() -> u64 {
    15_000
}
fn default_qps_limit() -> u32 {
    10
}
fn default_acquire_wait_ms() -> u64 {
    2_000
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            probe_timeout_ms: default_probe_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            qps_limit: default_qps_limit(),
            acquire_wait_ms: default_acquire_wait_ms(),
            backoff: BackoffSettings::default(),
            concurrency: ConcurrencySettings::default(),
            exclusion: ExclusionSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_cross_check_initial")]
    pub cross_check_initial: usize,
    #[serde(default = "default_cross_check_step")]
    pub cross_check_step: usize,
    #[serde(default = "default_cross_check_max")]
    pub cross_check_max: usize,
    #[serde(default = "default_cross_check_threshold")]
    pub cross_check_threshold: f64,
    #[serde(default = "default_cross_check_budget_ms")]
    pub cross_check_budget_ms: u64,
    #[serde(default = "default_cross_check_endpoint_budget_ms")]
    pub cross_check_endpoint_budget_ms: u64,
    #[serde(default = "default_cross_check_max_pages")]
    pub cross_check_max_pages: usize,
    #[serde(default = "default_detail_concurrency")]
    pub detail_concurrency: usize,
    #[serde(default = "default_detail_max_attempts")]
    pub detail_max_attempts: usize,
    #[serde(default = "default_page_backoff_base_ms")]
    pub page_backoff_base_ms: u64,
    #[serde(default = "default_page_backoff_cap_ms")]
    pub page_backoff_cap_ms: u64,
    #[serde(default = "default_detail_backoff_base_ms")]
    pub detail_backoff_base_ms: u64,
    #[serde(default = "default_detail_backoff_cap_ms")]
    pub detail_backoff_cap_ms: u64,
    #[serde(default = "default_retry_jitter_ms")]
    pub retry_jitter_ms: u64,
}

fn default_page_size() -> usize {
    1_000
}
fn default_max_pages() -> usize {
    50
}
fn default_cross_check_initial() -> usize {
    3
}
fn default_cross_check_step() -> usize {
    2
}
fn default_cross_check_max() -> usize {
    7
}
fn default_cross_check_threshold() -> f64 {
    0.90
}
fn default_cross_check_budget_ms() -> u64 {
    5_000
}
fn default_cross_check_endpoint_budget_ms() -> u64 {
    1_500
}
fn default_cross_check_max_pages() -> usize {
    20
}
fn default_detail_concurrency() -> usize {
    10
}
fn default_detail_max_attempts() -> usize {
    3
}
fn default_page_backoff_base_ms() -> u64 {
    2_000
}
fn default_page_backoff_cap_ms() -> u64 {
    30_000
}
fn default_detail_backoff_base_ms() -> u64 {
    500
}
fn default_detail_backoff_cap_ms() -> u64 {
    60_000
}
fn default_retry_jitter_ms() -> u64 {
    200
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_pages: default_max_pages(),
            cross_check_initial: default_cross_check_initial(),
            cross_check_step: default_cross_check_step(),
            cross_check_max: default_cross_check_max(),
            cross_check_threshold: default_cross_check_threshold(),
            cross_check_budget_ms: default_cross_check_budget_ms(),
            cross_check_endpoint_budget_ms: default_cross_check_endpoint_budget_ms(),
            cross_check_max_pages: default_cross_check_max_pages(),
            detail_concurrency: default_detail_concurrency(),
            detail_max_attempts: default_detail_max_attempts(),
            page_backoff_base_ms: default_page_backoff_base_ms(),
            page_backoff_cap_ms: default_page_backoff_cap_ms(),
            detail_backoff_base_ms: default_detail_backoff_base_ms(),
            detail_backoff_cap_ms: default_detail_backoff_cap_ms(),
            retry_jitter_ms: default_retry_jitter_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReportSettings {
    /// Root directory for the session store and the namespaced cache.
    #[serde(default = "default_cache_root")]
    pub cache_root: String,
    /// External batch decoder command; instructions decode to "unknown"
    /// when unset.
    #[serde(default)]
    pub decoder_command: Option<String>,
}

fn default_cache_root() -> String {
    "cache".to_string()
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            decoder_command: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub rpc: RpcSettings,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub report: ReportSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        // Environment variable override for the candidate endpoint list:
        // either a JSON array of {name, url} objects or a comma list of URLs.
        if let Ok(raw) = env::var("SDK_RPC_ENDPOINTS") {
            if let Some(list) = parse_endpoint_list(&raw) {
                if !list.is_empty() {
                    settings.rpc.endpoints = list;
                }
            }
        }
        if let Ok(raw) = env::var("SDK_DECODER_COMMAND") {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                settings.report.decoder_command = Some(trimmed.to_string());
            }
        }

        Ok(settings)
    }
}

fn parse_endpoint_list(raw: &str) -> Option<Vec<EndpointConfig>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('[') {
        return serde_json::from_str::<Vec<EndpointConfig>>(trimmed).ok();
    }
    let list = trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|url| EndpointConfig::new(short_name(url), url))
        .collect::<Vec<_>>();
    Some(list)
}

fn short_name(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_tunables() {
        let settings = Settings::default();
        assert_eq!(settings.rpc.concurrency.initial_max, 2);
        assert_eq!(settings.rpc.concurrency.hard_cap, 6);
        assert_eq!(settings.rpc.exclusion.rate_limit_threshold, 20);
        assert_eq!(settings.rpc.exclusion.unavailable_threshold, 5);
        assert_eq!(settings.pipeline.page_size, 1_000);
        assert_eq!(settings.pipeline.max_pages, 50);
        assert_eq!(settings.pipeline.cross_check_initial, 3);
        assert_eq!(settings.pipeline.cross_check_max, 7);
        assert!((settings.pipeline.cross_check_threshold - 0.90).abs() < f64::EPSILON);
    }

    #[test]
    fn endpoint_list_parses_json_and_comma_forms() {
        let json = r#"[{"name":"a","url":"http://a.example"},{"name":"b","url":"http://b.example"}]"#;
        let parsed = parse_endpoint_list(json).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].name, "a");

        let commas = "http://a.example, http://b.example";
        let parsed = parse_endpoint_list(commas).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[1].name, "b.example");
    }
}
