//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_entries_posted_total` - Entries committed by posting
//! - `ledger_insufficient_funds_total` - Debits and edits turned away for lack of funds
//! - `ledger_transfers_total` - Compensating transfers committed
//! - `ledger_transfers_aborted_total` - Transfer resolutions that wrote nothing
//! - `ledger_drift_corrections_total` - Cached balances repaired by recomputation
//! - `ledger_store_retries_total` - Units of work re-run after a failed commit

use prometheus::{IntCounter, Registry};
use std::sync::Arc;

/// Metrics collector
///
/// Counters live in a private registry, so every ledger instance (and every
/// test) gets its own set.
#[derive(Clone)]
pub struct Metrics {
    /// Entries committed by posting
    pub entries_posted: IntCounter,

    /// Postings and edits rejected with insufficient funds
    pub insufficient_funds: IntCounter,

    /// Compensating transfers committed
    pub transfers: IntCounter,

    /// Transfer resolutions aborted
    pub transfers_aborted: IntCounter,

    /// Drift corrections by the recomputation engine
    pub drift_corrections: IntCounter,

    /// Commit retries
    pub store_retries: IntCounter,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let register = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        Ok(Self {
            entries_posted: register(
                "ledger_entries_posted_total",
                "Entries committed by posting",
            )?,
            insufficient_funds: register(
                "ledger_insufficient_funds_total",
                "Debits and edits turned away for lack of funds",
            )?,
            transfers: register("ledger_transfers_total", "Compensating transfers committed")?,
            transfers_aborted: register(
                "ledger_transfers_aborted_total",
                "Transfer resolutions that wrote nothing",
            )?,
            drift_corrections: register(
                "ledger_drift_corrections_total",
                "Cached balances repaired by recomputation",
            )?,
            store_retries: register(
                "ledger_store_retries_total",
                "Units of work re-run after a failed commit",
            )?,
            registry,
        })
    }

    /// Record a committed entry
    pub fn record_entry_posted(&self) {
        self.entries_posted.inc();
    }

    /// Record an insufficient-funds outcome
    pub fn record_insufficient_funds(&self) {
        self.insufficient_funds.inc();
    }

    /// Record a committed transfer
    pub fn record_transfer(&self) {
        self.transfers.inc();
    }

    /// Record an aborted transfer resolution
    pub fn record_transfer_aborted(&self) {
        self.transfers_aborted.inc();
    }

    /// Record a repaired cached balance
    pub fn record_drift_correction(&self) {
        self.drift_corrections.inc();
    }

    /// Record a commit retry
    pub fn record_store_retry(&self) {
        self.store_retries.inc();
    }

    /// Get metrics registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("entries_posted", &self.entries_posted.get())
            .field("insufficient_funds", &self.insufficient_funds.get())
            .field("transfers", &self.transfers.get())
            .field("drift_corrections", &self.drift_corrections.get())
            .finish()
    }
}
