//! # Fee Report CLI
//!
//! One-shot report run: probe (or reload) the endpoint pool, scan the
//! account's activity window, fetch details, aggregate, print JSON.
//!
//! ```bash
//! SDK_RPC_ENDPOINTS="https://rpc-a.example,https://rpc-b.example" \
//!     cargo run --bin fee_report -- --account <PUBKEY> --days 30
//! ```

use anyhow::Result;
use clap::Parser;
use ledger_activity_sdk::cache::CacheStore;
use ledger_activity_sdk::clock::system_clock;
use ledger_activity_sdk::decoder::DecoderHandle;
use ledger_activity_sdk::fetch_pipeline::ResilientFetchPipeline;
use ledger_activity_sdk::metrics;
use ledger_activity_sdk::report::ReportBuilder;
use ledger_activity_sdk::rpc_pool::PoolManager;
use ledger_activity_sdk::session_store::SessionStore;
use ledger_activity_sdk::settings::Settings;
use ledger_activity_sdk::transport::HttpTransport;
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "fee_report", about = "Fee/operation report for one account")]
struct Args {
    /// Account to report on
    #[arg(long)]
    account: String,

    /// Session identifier; defaults to the account
    #[arg(long)]
    session: Option<String>,

    /// Days of history to scan
    #[arg(long, default_value_t = 30)]
    days: i64,

    /// Re-probe the endpoint pool instead of reusing a persisted list
    #[arg(long)]
    refresh_pool: bool,

    /// Run the targeted double-check pass when the first pass is partial
    #[arg(long)]
    double_check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();
    metrics::init_exporter()?;

    let args = Args::parse();
    let settings = Settings::new()?;
    if settings.rpc.endpoints.is_empty() {
        anyhow::bail!("no RPC endpoints configured (Config.toml or SDK_RPC_ENDPOINTS)");
    }

    let session = args.session.clone().unwrap_or_else(|| args.account.clone());
    let cutoff_ms = (chrono::Utc::now() - chrono::Duration::days(args.days)).timestamp_millis();
    let cutoff_ms = cutoff_ms.max(0) as u64;

    let transport = Arc::new(HttpTransport::new(Duration::from_millis(
        settings.rpc.request_timeout_ms,
    )));
    let store = SessionStore::new(&settings.report.cache_root);
    let manager = Arc::new(PoolManager::new(
        transport.clone(),
        settings.rpc.clone(),
        system_clock(),
        Some(store),
    ));
    if args.refresh_pool {
        manager.refresh_pool(&session).await?;
    }

    let pipeline = Arc::new(ResilientFetchPipeline::new(
        manager,
        transport,
        settings.pipeline.clone(),
    ));
    let builder = ReportBuilder::new(
        pipeline,
        CacheStore::new(&settings.report.cache_root),
        DecoderHandle::new(settings.report.decoder_command.clone()),
    );

    info!(
        "building report for {} over the last {} days",
        args.account, args.days
    );
    let mut report = builder.build(&session, &args.account, cutoff_ms).await?;

    if !report.failed.is_empty() && args.double_check {
        warn!(
            "{} signatures failed, running double-check pass",
            report.failed.len()
        );
        let recovered = builder
            .double_check(&session, &args.account, cutoff_ms)
            .await?;
        info!("double-check recovered {} signatures", recovered);
        if recovered > 0 {
            report = builder.build(&session, &args.account, cutoff_ms).await?;
        }
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
