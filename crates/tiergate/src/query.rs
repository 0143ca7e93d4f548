//! Ledger query client: read-only getter calls against the contract.
//!
//! One call, one bounded attempt. Transport errors, non-2xx status, `ok: false`, non-zero exit
//! codes and unparseable bodies all come back as a [QueryError]; retrying is the caller's job.

use crate::abi::{StackEntry, TAG_ADDR};
use crate::address::{TonAddress, TAG_SLICE};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Raw getter outcome: VM exit code and result stack.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GetMethodResult {
    #[serde(alias = "exitCode")]
    pub exit_code: i32,
    #[serde(default)]
    pub stack: Vec<StackEntry>,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,
    #[error("HTTP request failed: {0}")]
    Transport(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("gateway rejected request: {0}")]
    Rejected(String),
    #[error("getter exited with code {0}")]
    ExitCode(i32),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("bad getter argument: {0}")]
    Argument(String),
}

impl QueryError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, QueryError::Timeout)
    }
}

impl From<reqwest::Error> for QueryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            QueryError::Timeout
        } else if e.is_decode() {
            QueryError::Malformed(e.to_string())
        } else {
            QueryError::Transport(e.to_string())
        }
    }
}

/// Read-only getter transport.
#[async_trait]
pub trait LedgerQuery: Send + Sync {
    /// Run `method` on `contract` with `args`. Succeeds only for exit code 0.
    async fn query(
        &self,
        contract: &str,
        method: &str,
        args: &[StackEntry],
    ) -> Result<GetMethodResult, QueryError>;
}

#[async_trait]
impl<T: LedgerQuery + ?Sized> LedgerQuery for Arc<T> {
    async fn query(
        &self,
        contract: &str,
        method: &str,
        args: &[StackEntry],
    ) -> Result<GetMethodResult, QueryError> {
        (**self).query(contract, method, args).await
    }
}

#[derive(Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    result: Option<GetMethodResult>,
    #[serde(default)]
    error: Option<Value>,
}

/// HTTP client for a toncenter-style `runGetMethod` endpoint.
#[derive(Debug, Clone)]
pub struct HttpLedgerClient {
    http_client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpLedgerClient {
    /// `base_url` is the API root (e.g. `https://toncenter.com/api/v2`); every call is
    /// bounded by `timeout`.
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, QueryError> {
        let http_client = reqwest::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .map_err(|e| QueryError::Transport(e.to_string()))?;
        Ok(Self {
            http_client,
            endpoint: format!("{}/runGetMethod", base_url.trim_end_matches('/')),
            api_key,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Build the request body. Address arguments go out as `tvm.Slice` cells.
fn request_body(contract: &str, method: &str, args: &[StackEntry]) -> Result<Value, QueryError> {
    let stack = args
        .iter()
        .map(|e| {
            if e.type_tag == TAG_ADDR {
                let addr = TonAddress::parse(&e.value)
                    .map_err(|err| QueryError::Argument(err.to_string()))?;
                Ok(json!([TAG_SLICE, addr.to_slice_boc()]))
            } else {
                Ok(json!([e.type_tag, e.value]))
            }
        })
        .collect::<Result<Vec<Value>, QueryError>>()?;
    Ok(json!({
        "address": contract,
        "method": method,
        "stack": stack,
    }))
}

/// Parse a response body into a successful getter result.
fn parse_envelope(body: &str) -> Result<GetMethodResult, QueryError> {
    let envelope: Envelope =
        serde_json::from_str(body).map_err(|e| QueryError::Malformed(e.to_string()))?;
    if !envelope.ok {
        let reason = match envelope.error {
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
            None => "unknown error".to_string(),
        };
        return Err(QueryError::Rejected(reason));
    }
    let result = envelope
        .result
        .ok_or_else(|| QueryError::Malformed("missing result".into()))?;
    if result.exit_code != 0 {
        return Err(QueryError::ExitCode(result.exit_code));
    }
    Ok(result)
}

#[async_trait]
impl LedgerQuery for HttpLedgerClient {
    async fn query(
        &self,
        contract: &str,
        method: &str,
        args: &[StackEntry],
    ) -> Result<GetMethodResult, QueryError> {
        tracing::debug!(contract, method, "runGetMethod");
        let body = request_body(contract, method, args)?;
        let mut req = self.http_client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("X-API-Key", key);
        }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(QueryError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        parse_envelope(&body)
    }
}
