//! # Ledger Activity SDK
//!
//! A Rust library for ingesting on-chain activity for an account through a
//! pool of interchangeable, rate-limited, occasionally-unreliable JSON-RPC
//! providers, and aggregating it into a fee/operation report.
//!
//! ## Overview
//!
//! The hard part of this crate is not the reporting — it is surviving the
//! upstream: thousands of paginated signature lookups and per-transaction
//! fetches per report, without tripping provider rate limits, while
//! tolerating provider downtime, replication lag between providers, and
//! partial failures, and without losing data silently.
//!
//! ## Architecture
//!
//! ### Endpoint state layer
//! Per-endpoint circuit breaking ([`health`]), AIMD concurrency caps
//! ([`concurrency`]) and sliding-window error metrics ([`endpoint_metrics`]),
//! each endpoint's counters an independent critical section.
//!
//! ### Pool layer
//! Session-scoped pools bootstrapped by a liveness probe ([`probe`]),
//! optionally persisted ([`session_store`]), and orchestrated by the
//! [`rpc_pool::PoolManager`], which hands out single-use leases whose
//! release feeds outcomes back into the endpoint state.
//!
//! ### Fetch layer
//! The [`fetch_pipeline::ResilientFetchPipeline`] performs cutoff-bounded
//! paginated listings, cross-endpoint reconciliation of disagreeing
//! replicas, and bounded-concurrency detail fetches with per-item retries.
//!
//! ### Reporting layer
//! Thin orchestration ([`report`]) over a namespaced disk cache ([`cache`])
//! and an opaque external decoder ([`decoder`]).

// Endpoint state
/// Injectable millisecond clock
pub mod clock;
/// Per-endpoint circuit breaker with capped exponential backoff
pub mod health;
/// Adaptive per-endpoint concurrency caps (AIMD)
pub mod concurrency;
/// Rolling latency samples and windowed error-rate exclusion
pub mod endpoint_metrics;

// Pool
/// Bootstrap liveness probing of candidate endpoints
pub mod probe;
/// Persisted per-session endpoint lists
pub mod session_store;
/// Endpoint pool, manager and lease lifecycle
pub mod rpc_pool;

// Fetch
/// Upstream JSON-RPC transport and failure classification
pub mod transport;
/// Paginated listing, cross-endpoint reconciliation, detail fetching
pub mod fetch_pipeline;

// Reporting
/// Namespaced key/value cache on disk
pub mod cache;
/// Opaque external instruction decoder
pub mod decoder;
/// Fee/operation aggregation and the double-check pass
pub mod report;

// Infrastructure
/// Metrics wrappers (no-ops unless the `observability` feature is on)
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use fetch_pipeline::ResilientFetchPipeline;
pub use report::ReportBuilder;
pub use rpc_pool::{AcquireOptions, Lease, LeaseOutcome, PoolError, PoolManager};
pub use settings::Settings;
pub use transport::{HttpTransport, RpcTransport};
