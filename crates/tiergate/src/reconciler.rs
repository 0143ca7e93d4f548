//! Reconciler: keeps the entitlement store in step with the Subscription contract.
//!
//! Each cycle lists every linked wallet, runs `get_subscription` for each one with bounded
//! concurrency, decodes the stack, asks the [MergePolicy] what to write, and flushes all
//! writes in one batch. A failing address is logged and skipped; a failed flush drops that
//! cycle's writes. Both heal on the next cycle because every cycle re-derives state from
//! the chain. Cycles never overlap: [Reconciler::run_cycle] takes `&mut self`.

use crate::abi::{decode_subscription, DecodeError, StackEntry};
use crate::clock::{Clock, SystemClock};
use crate::contract::GET_SUBSCRIPTION;
use crate::merge::{MergePolicy, PromoteOnly};
use crate::query::{LedgerQuery, QueryError};
use crate::store::{EntitlementRecord, EntitlementStore, RowUpdate};
use crate::tier::Tier;
use futures_util::{stream, FutureExt, StreamExt};
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;

/// Why one address produced no update this cycle.
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("query failed: {0}")]
    Query(#[from] QueryError),
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("reconcile task panicked")]
    Panicked,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error("{0} required")]
    Missing(&'static str),
    #[error("concurrency must be at least 1")]
    ZeroConcurrency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedAddress {
    pub address: String,
    pub reason: String,
}

/// Summary of one cycle, ready for JSON output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub started_at: u64,
    pub addresses: usize,
    /// Row changes produced by the merge policy.
    pub pending: usize,
    /// Rows actually written by the flush (0 when the flush failed or was empty).
    pub written: usize,
    pub unchanged: usize,
    pub failed: Vec<FailedAddress>,
    /// Cycle-level failure (listing or flushing).
    pub error: Option<String>,
}

/// Builder for the reconciler.
pub struct ReconcilerBuilder<Q, S> {
    query: Q,
    store: S,
    contract_address: Option<String>,
    policy: Option<Box<dyn MergePolicy>>,
    clock: Option<Arc<dyn Clock>>,
    interval: Duration,
    concurrency: usize,
    method: String,
}

impl<Q: LedgerQuery, S: EntitlementStore> ReconcilerBuilder<Q, S> {
    pub fn new(query: Q, store: S) -> Self {
        Self {
            query,
            store,
            contract_address: None,
            policy: None,
            clock: None,
            interval: Duration::from_secs(60),
            concurrency: 4,
            method: GET_SUBSCRIPTION.to_string(),
        }
    }

    pub fn contract_address(mut self, addr: impl Into<String>) -> Self {
        self.contract_address = Some(addr.into());
        self
    }

    /// Set the merge policy (defaults to [PromoteOnly]).
    pub fn policy(mut self, p: impl MergePolicy + 'static) -> Self {
        self.policy = Some(Box::new(p));
        self
    }

    pub fn clock(mut self, c: Arc<dyn Clock>) -> Self {
        self.clock = Some(c);
        self
    }

    pub fn interval(mut self, d: Duration) -> Self {
        self.interval = d;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.concurrency = n;
        self
    }

    /// Getter name (defaults to `get_subscription`).
    pub fn method(mut self, m: impl Into<String>) -> Self {
        self.method = m.into();
        self
    }

    pub fn build(self) -> Result<Reconciler<Q, S>, BuildError> {
        let contract_address = self
            .contract_address
            .ok_or(BuildError::Missing("contract_address"))?;
        if self.concurrency == 0 {
            return Err(BuildError::ZeroConcurrency);
        }
        let (report_tx, _) = broadcast::channel(64);
        Ok(Reconciler {
            query: self.query,
            store: self.store,
            contract_address,
            policy: self.policy.unwrap_or_else(|| Box::new(PromoteOnly)),
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            interval: self.interval,
            concurrency: self.concurrency,
            method: self.method,
            cycles: 0,
            report_tx,
        })
    }
}

pub struct Reconciler<Q, S> {
    query: Q,
    store: S,
    contract_address: String,
    policy: Box<dyn MergePolicy>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    concurrency: usize,
    method: String,
    cycles: u64,
    report_tx: broadcast::Sender<CycleReport>,
}

impl<Q: LedgerQuery, S: EntitlementStore> Reconciler<Q, S> {
    /// Subscribe to per-cycle reports.
    pub fn subscribe(&self) -> broadcast::Receiver<CycleReport> {
        self.report_tx.subscribe()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn query(&self) -> &Q {
        &self.query
    }

    /// Number of cycles started so far.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one full cycle. Never fails; problems are logged and reported.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let cycle = self.cycles;
        let now = self.clock.now();
        let mut report = CycleReport {
            cycle,
            started_at: now,
            ..Default::default()
        };

        let records = match self.store.linked_records().await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(cycle, reason = %e, "listing linked wallets failed");
                report.error = Some(e.to_string());
                let _ = self.report_tx.send(report.clone());
                return report;
            }
        };
        report.addresses = records.len();

        let this = &*self;
        let outcomes: Vec<_> = stream::iter(records)
            .map(|record| async move {
                let outcome = AssertUnwindSafe(this.reconcile_one(&record))
                    .catch_unwind()
                    .await
                    .unwrap_or(Err(AddressError::Panicked));
                (record, outcome)
            })
            .buffer_unordered(this.concurrency)
            .collect()
            .await;

        let mut pending = Vec::new();
        for (record, outcome) in outcomes {
            match outcome {
                Ok(Some((tier, expires_at))) => {
                    tracing::debug!(
                        address = %record.address,
                        from = %record.tier,
                        to = %tier,
                        expires_at,
                        "entitlement change queued"
                    );
                    pending.push(RowUpdate {
                        address: record.address,
                        tier,
                        expires_at,
                        synced_at: now,
                    });
                }
                Ok(None) => report.unchanged += 1,
                Err(e) => {
                    tracing::warn!(
                        cycle,
                        address = %record.address,
                        op = %self.method,
                        reason = %e,
                        "address skipped this cycle"
                    );
                    report.failed.push(FailedAddress {
                        address: record.address,
                        reason: e.to_string(),
                    });
                }
            }
        }
        pending.sort_by(|a, b| a.address.cmp(&b.address));
        report.failed.sort_by(|a, b| a.address.cmp(&b.address));
        report.pending = pending.len();

        if !pending.is_empty() {
            match self.store.apply_batch(pending).await {
                Ok(n) => report.written = n,
                Err(e) => {
                    tracing::warn!(
                        cycle,
                        pending = report.pending,
                        reason = %e,
                        "batch flush failed, changes dropped until next cycle"
                    );
                    report.error = Some(e.to_string());
                }
            }
        }

        tracing::info!(
            cycle,
            addresses = report.addresses,
            written = report.written,
            unchanged = report.unchanged,
            failed = report.failed.len(),
            "reconcile cycle complete"
        );
        let _ = self.report_tx.send(report.clone());
        report
    }

    async fn reconcile_one(
        &self,
        record: &EntitlementRecord,
    ) -> Result<Option<(Tier, u64)>, AddressError> {
        let result = self
            .query
            .query(
                &self.contract_address,
                &self.method,
                &[StackEntry::address(&record.address)],
            )
            .await?;
        let decoded = decode_subscription(&result.stack)?;
        Ok(self.policy.merge(record, &decoded))
    }

    /// Run cycles until `stop` reads `true` or its sender is dropped. The wait between
    /// cycles ends early on either; a cycle already in progress finishes its flush.
    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            concurrency = self.concurrency,
            "reconciler started"
        );
        loop {
            if *stop.borrow_and_update() {
                break;
            }
            self.run_cycle().await;
            if !wait_or_stop(self.interval, &mut stop).await {
                break;
            }
        }
        tracing::info!(cycles = self.cycles, "reconciler stopped");
    }
}

/// Sleep for `interval`. Returns `false` as soon as `stop` reads `true` or its sender goes
/// away; a change back to `false` keeps the original deadline.
async fn wait_or_stop(interval: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    let wait = sleep(interval);
    tokio::pin!(wait);
    loop {
        tokio::select! {
            _ = &mut wait => return true,
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow_and_update() {
                    return false;
                }
            }
        }
    }
}
