//! Reconciler configuration.

use anyhow::{Context, Result};
use std::time::Duration;

/// Default toncenter v2 API root.
pub const DEFAULT_API_URL: &str = "https://toncenter.com/api/v2";

/// Reconciler configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// API root serving `runGetMethod`.
    pub api_url: String,
    /// Optional API key (sent as `X-API-Key`).
    pub api_key: Option<String>,
    /// Subscription contract address.
    pub contract_address: String,
    /// Delay between cycles.
    pub poll_interval: Duration,
    /// Per-call timeout for getter queries.
    pub query_timeout: Duration,
    /// Max in-flight getter queries within a cycle.
    pub concurrency: usize,
    /// SQLite database path for the entitlement store.
    pub db_path: String,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: None,
            contract_address: String::new(),
            poll_interval: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            concurrency: 4,
            db_path: "entitlements.db".to_string(),
        }
    }
}

impl ReconcilerConfig {
    /// Load from the process environment. `SUBSCRIPTION_CONTRACT` is required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Store path alone, for commands that never touch the ledger.
    pub fn db_path_from_env() -> String {
        Self::db_path_from_lookup(|key| std::env::var(key).ok())
    }

    fn db_path_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> String {
        lookup("ENTITLEMENT_DB")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| Self::default().db_path)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration> {
            match lookup(key) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .with_context(|| format!("{key} must be whole seconds, got {v:?}")),
                None => Ok(default),
            }
        };
        let contract_address = lookup("SUBSCRIPTION_CONTRACT")
            .filter(|v| !v.is_empty())
            .context("SUBSCRIPTION_CONTRACT is not set")?;
        let concurrency = match lookup("RECONCILE_CONCURRENCY") {
            Some(v) => v
                .parse::<usize>()
                .with_context(|| format!("RECONCILE_CONCURRENCY must be an integer, got {v:?}"))?,
            None => defaults.concurrency,
        };
        if concurrency == 0 {
            anyhow::bail!("RECONCILE_CONCURRENCY must be at least 1");
        }
        Ok(Self {
            api_url: lookup("TONCENTER_URL").unwrap_or(defaults.api_url),
            api_key: lookup("TON_API_KEY").filter(|v| !v.is_empty()),
            contract_address,
            poll_interval: secs("POLL_INTERVAL_SECS", defaults.poll_interval)?,
            query_timeout: secs("QUERY_TIMEOUT_SECS", defaults.query_timeout)?,
            concurrency,
            db_path: Self::db_path_from_lookup(&lookup),
        })
    }
}
