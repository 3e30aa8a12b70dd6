// src/transport.rs

use async_trait::async_trait;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

/// Failure classification the pool feeds back into health/metrics state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    ServiceUnavailable,
    Other,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rate limited by {url}")]
    RateLimited { url: String },
    #[error("service unavailable at {url}")]
    ServiceUnavailable { url: String },
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("http {status} from {url}")]
    Http { url: String, status: u16 },
    #[error("rpc error {code} from {url}: {message}")]
    Rpc {
        url: String,
        code: i64,
        message: String,
    },
    #[error("malformed response from {url}: {detail}")]
    Malformed { url: String, detail: String },
    #[error("network error talking to {url}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::RateLimited { .. } => FailureKind::RateLimited,
            TransportError::ServiceUnavailable { .. } => FailureKind::ServiceUnavailable,
            _ => FailureKind::Other,
        }
    }
}

/// One entry from a paged signature listing, newest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
    pub signature: String,
    #[serde(default)]
    pub slot: Option<u64>,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub err: Option<Value>,
}

impl SignatureRecord {
    pub fn block_time_ms(&self) -> Option<u64> {
        self.block_time
            .filter(|t| *t >= 0)
            .map(|t| t as u64 * 1_000)
    }
}

/// Full detail for one item, with the fee extracted for aggregation and the
/// raw response kept for the decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDetail {
    pub signature: String,
    pub slot: Option<u64>,
    pub block_time: Option<i64>,
    pub fee_lamports: u64,
    pub raw: Value,
}

/// Upstream transport: everything the pool and pipeline need from one
/// endpoint URL. Implementations must classify failures well enough for the
/// pool to distinguish throttling from genuine faults.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Cheap read-only liveness call, bounded by `timeout`.
    async fn check_liveness(&self, url: &str, timeout: Duration) -> Result<(), TransportError>;

    /// One page of signatures for `account`, newest first, starting strictly
    /// after `before` when given.
    async fn signatures_for_account(
        &self,
        url: &str,
        account: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureRecord>, TransportError>;

    /// Full detail for one signature. `None` when the upstream does not know
    /// the transaction (a lagging replica, not an error).
    async fn transaction_detail(
        &self,
        url: &str,
        signature: &str,
    ) -> Result<Option<TransactionDetail>, TransportError>;
}

static SHARED_CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC 2.0 over HTTP. Uses one shared connection pool for every
/// endpoint; per-call timeouts are set on each request.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    request_timeout: Duration,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    async fn call(
        &self,
        url: &str,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method,
            params,
        };

        let response = SHARED_CLIENT
            .post(url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(url, e))?;

        let status = response.status().as_u16();
        match status {
            429 => {
                return Err(TransportError::RateLimited {
                    url: url.to_string(),
                })
            }
            502 | 503 | 504 => {
                return Err(TransportError::ServiceUnavailable {
                    url: url.to_string(),
                })
            }
            s if !(200..300).contains(&s) => {
                return Err(TransportError::Http {
                    url: url.to_string(),
                    status: s,
                })
            }
            _ => {}
        }

        let parsed: RpcResponse = response
            .json()
            .await
            .map_err(|e| classify_reqwest_error(url, e))?;

        if let Some(err) = parsed.error {
            return Err(TransportError::Rpc {
                url: url.to_string(),
                code: err.code,
                message: err.message,
            });
        }

        parsed.result.ok_or_else(|| TransportError::Malformed {
            url: url.to_string(),
            detail: "response carried neither result nor error".to_string(),
        })
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

fn classify_reqwest_error(url: &str, e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
        }
    } else {
        TransportError::Network {
            url: url.to_string(),
            source: e,
        }
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn check_liveness(&self, url: &str, timeout: Duration) -> Result<(), TransportError> {
        self.call(url, "getVersion", json!([]), timeout).await?;
        Ok(())
    }

    async fn signatures_for_account(
        &self,
        url: &str,
        account: &str,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SignatureRecord>, TransportError> {
        let mut opts = json!({ "limit": limit, "commitment": "confirmed" });
        if let Some(cursor) = before {
            opts["before"] = json!(cursor);
        }
        let result = self
            .call(
                url,
                "getSignaturesForAddress",
                json!([account, opts]),
                self.request_timeout,
            )
            .await?;

        serde_json::from_value(result).map_err(|e| TransportError::Malformed {
            url: url.to_string(),
            detail: format!("signature page: {}", e),
        })
    }

    async fn transaction_detail(
        &self,
        url: &str,
        signature: &str,
    ) -> Result<Option<TransactionDetail>, TransportError> {
        let opts = json!({
            "maxSupportedTransactionVersion": 0,
            "commitment": "confirmed",
            "encoding": "json"
        });
        let result = self
            .call(
                url,
                "getTransaction",
                json!([signature, opts]),
                self.request_timeout,
            )
            .await?;

        if result.is_null() {
            return Ok(None);
        }

        let fee_lamports = result
            .pointer("/meta/fee")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let slot = result.get("slot").and_then(Value::as_u64);
        let block_time = result.get("blockTime").and_then(Value::as_i64);

        Ok(Some(TransactionDetail {
            signature: signature.to_string(),
            slot,
            block_time,
            fee_lamports,
            raw: result,
        }))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport used by the pool and pipeline unit tests.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockTransport {
        /// Newest-first signature chain served per endpoint URL. Endpoints
        /// missing from the map serve an empty chain.
        pub chains: Mutex<HashMap<String, Vec<SignatureRecord>>>,
        /// URLs whose liveness probe never answers in time.
        pub dead: Mutex<HashSet<String>>,
        /// Signatures whose detail fetch always fails.
        pub poisoned: Mutex<HashSet<String>>,
        /// URLs whose listing calls are rate limited.
        pub throttled: Mutex<HashSet<String>>,
        pub list_calls: AtomicUsize,
        pub detail_calls: AtomicUsize,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_chain(&self, url: &str, records: Vec<SignatureRecord>) {
            self.chains.lock().unwrap().insert(url.to_string(), records);
        }

        pub fn mark_dead(&self, url: &str) {
            self.dead.lock().unwrap().insert(url.to_string());
        }

        pub fn poison(&self, signature: &str) {
            self.poisoned.lock().unwrap().insert(signature.to_string());
        }

        pub fn throttle(&self, url: &str) {
            self.throttled.lock().unwrap().insert(url.to_string());
        }
    }

    pub fn record(signature: &str, block_time: i64) -> SignatureRecord {
        SignatureRecord {
            signature: signature.to_string(),
            slot: Some(1),
            block_time: Some(block_time),
            err: None,
        }
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn check_liveness(
            &self,
            url: &str,
            _timeout: Duration,
        ) -> Result<(), TransportError> {
            if self.dead.lock().unwrap().contains(url) {
                return Err(TransportError::Timeout {
                    url: url.to_string(),
                });
            }
            Ok(())
        }

        async fn signatures_for_account(
            &self,
            url: &str,
            _account: &str,
            before: Option<&str>,
            limit: usize,
        ) -> Result<Vec<SignatureRecord>, TransportError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            if self.throttled.lock().unwrap().contains(url) {
                return Err(TransportError::RateLimited {
                    url: url.to_string(),
                });
            }
            let chains = self.chains.lock().unwrap();
            let chain = chains.get(url).cloned().unwrap_or_default();
            let start = match before {
                Some(cursor) => chain
                    .iter()
                    .position(|r| r.signature == cursor)
                    .map(|i| i + 1)
                    .unwrap_or(chain.len()),
                None => 0,
            };
            Ok(chain.into_iter().skip(start).take(limit).collect())
        }

        async fn transaction_detail(
            &self,
            url: &str,
            signature: &str,
        ) -> Result<Option<TransactionDetail>, TransportError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            if self.poisoned.lock().unwrap().contains(signature) {
                return Err(TransportError::ServiceUnavailable {
                    url: url.to_string(),
                });
            }
            Ok(Some(TransactionDetail {
                signature: signature.to_string(),
                slot: Some(1),
                block_time: Some(0),
                fee_lamports: 5_000,
                raw: serde_json::json!({ "meta": { "fee": 5000 } }),
            }))
        }
    }
}
