//! Integration tests for configuration defaults
//!
//! The documented tunables must hold without a Config.toml present.

use ledger_activity_sdk::settings::Settings;

#[test]
fn rpc_defaults_are_sane() {
    let settings = Settings::default();

    assert_eq!(settings.rpc.probe_timeout_ms, 4_000);
    assert!(settings.rpc.qps_limit > 0, "pacing quota must be non-zero");
    assert_eq!(settings.rpc.backoff.cap_ms, 60_000);
    assert!(
        settings.rpc.backoff.forced_base_ms >= 30_000,
        "forced throttle window should start at 30s"
    );
    assert!(settings.rpc.concurrency.initial_max <= settings.rpc.concurrency.hard_cap);
}

#[test]
fn pipeline_defaults_are_sane() {
    let settings = Settings::default();

    assert_eq!(settings.pipeline.page_size, 1_000);
    assert_eq!(settings.pipeline.max_pages, 50);
    assert!(settings.pipeline.cross_check_initial <= settings.pipeline.cross_check_max);
    assert!(
        settings.pipeline.cross_check_threshold > 0.0
            && settings.pipeline.cross_check_threshold <= 1.0
    );
    assert!(settings.pipeline.detail_concurrency > 0);
    assert!(settings.pipeline.detail_max_attempts > 0);
}
