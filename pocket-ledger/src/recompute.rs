//! Balance recomputation engine
//!
//! Cached balances are a materialized view over the entries. This module is
//! the view's rebuild path: it derives leaf balances from entries and root
//! balances from cached leaf balances, repairing and reporting any drift.
//! It is also the only recovery path after an interrupted process.

use crate::{
    locks::{LockKey, LockTable},
    metrics::Metrics,
    storage::{RetryPolicy, Storage},
    types::{LeafId, RootId, StorageContext},
    Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use uuid::Uuid;

/// Which kind of cached balance drifted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftKind {
    /// Leaf balance disagreed with its entries
    Leaf,
    /// Root balance disagreed with its leaves
    Root,
}

/// A cached balance that disagreed with its recomputation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Drift {
    /// Context of the account
    pub ctx: StorageContext,
    /// Account kind
    pub kind: DriftKind,
    /// Account ID
    pub account: Uuid,
    /// Value found in the cache
    pub cached: Decimal,
    /// Value written back
    pub recomputed: Decimal,
}

/// Summary of a reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Leaves recomputed successfully
    pub leaves_checked: usize,
    /// Roots recomputed successfully
    pub roots_checked: usize,
    /// Corrections applied
    pub drifts: Vec<Drift>,
    /// Accounts (or listings) that could not be recomputed
    pub failures: Vec<String>,
}

impl ReconcileReport {
    /// True when every account recomputed cleanly
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Derives and repairs cached balances
#[derive(Debug, Clone)]
pub struct BalanceRecomputer {
    storage: Arc<Storage>,
    locks: Arc<LockTable>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl BalanceRecomputer {
    /// Create the engine over an injected store
    pub fn new(
        storage: Arc<Storage>,
        locks: Arc<LockTable>,
        retry: RetryPolicy,
        metrics: Metrics,
    ) -> Self {
        Self {
            storage,
            locks,
            retry,
            metrics,
        }
    }

    /// Recompute a leaf from its entries and cache the result
    pub fn recompute_leaf(&self, ctx: StorageContext, leaf_id: LeafId) -> Result<Decimal> {
        self.recompute_leaf_inner(ctx, leaf_id).map(|(balance, _)| balance)
    }

    fn recompute_leaf_inner(
        &self,
        ctx: StorageContext,
        leaf_id: LeafId,
    ) -> Result<(Decimal, Option<Drift>)> {
        let root_id = self.storage.require_leaf(ctx, leaf_id)?.root_id;
        let keys = [LockKey::root(ctx, root_id), LockKey::leaf(ctx, leaf_id)];

        self.retry.run("recompute_leaf", || {
            self.locks.with_locks(&keys, || {
                let mut leaf = self.storage.require_leaf(ctx, leaf_id)?;
                let recomputed: Decimal = self
                    .storage
                    .entries_of_leaf(ctx, leaf_id)?
                    .iter()
                    .map(|entry| entry.signed_amount())
                    .sum();

                if leaf.balance == recomputed {
                    return Ok((recomputed, None));
                }

                let drift = Drift {
                    ctx,
                    kind: DriftKind::Leaf,
                    account: leaf_id.as_uuid(),
                    cached: leaf.balance,
                    recomputed,
                };
                leaf.balance = recomputed;
                let mut batch = self.storage.batch(ctx);
                batch.put_leaf(&leaf);
                batch.commit()?;

                self.metrics.record_drift_correction();
                tracing::warn!(
                    ctx = %ctx,
                    leaf_id = %leaf_id,
                    cached = %drift.cached,
                    recomputed = %recomputed,
                    "Leaf balance drift corrected"
                );
                Ok((recomputed, Some(drift)))
            })
        })
    }

    /// Recompute a root from its leaves' cached balances and cache the result
    ///
    /// Leaves must already be consistent.
    pub fn recompute_root(&self, ctx: StorageContext, root_id: RootId) -> Result<Decimal> {
        self.recompute_root_inner(ctx, root_id).map(|(balance, _)| balance)
    }

    fn recompute_root_inner(
        &self,
        ctx: StorageContext,
        root_id: RootId,
    ) -> Result<(Decimal, Option<Drift>)> {
        let keys = [LockKey::root(ctx, root_id)];

        self.retry.run("recompute_root", || {
            self.locks.with_locks(&keys, || {
                let mut root = self.storage.require_root(ctx, root_id)?;
                let recomputed: Decimal = self
                    .storage
                    .leaves_of(ctx, root_id)?
                    .iter()
                    .map(|leaf| leaf.balance)
                    .sum();

                if root.balance == recomputed {
                    return Ok((recomputed, None));
                }

                let drift = Drift {
                    ctx,
                    kind: DriftKind::Root,
                    account: root_id.as_uuid(),
                    cached: root.balance,
                    recomputed,
                };
                root.balance = recomputed;
                let mut batch = self.storage.batch(ctx);
                batch.put_root(&root);
                batch.commit()?;

                self.metrics.record_drift_correction();
                tracing::warn!(
                    ctx = %ctx,
                    root_id = %root_id,
                    cached = %drift.cached,
                    recomputed = %recomputed,
                    "Root balance drift corrected"
                );
                Ok((recomputed, Some(drift)))
            })
        })
    }

    /// Reconcile every account of both contexts: all leaves, then all roots
    pub fn recompute_all(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        for ctx in StorageContext::ALL {
            self.reconcile_context(ctx, &mut report);
        }

        if report.is_success() {
            tracing::info!(
                leaves = report.leaves_checked,
                roots = report.roots_checked,
                drifts = report.drifts.len(),
                "Reconciliation pass complete"
            );
        } else {
            tracing::error!(
                failures = report.failures.len(),
                drifts = report.drifts.len(),
                "Reconciliation pass finished with failures"
            );
        }
        report
    }

    fn reconcile_context(&self, ctx: StorageContext, report: &mut ReconcileReport) {
        match self.storage.leaves(ctx) {
            Ok(leaves) => {
                for leaf in leaves {
                    match self.recompute_leaf_inner(ctx, leaf.id) {
                        Ok((_, drift)) => {
                            report.leaves_checked += 1;
                            report.drifts.extend(drift);
                        }
                        // Deleted since listing
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            tracing::error!(ctx = %ctx, leaf_id = %leaf.id, error = %e, "Leaf recompute failed");
                            report.failures.push(format!("{} leaf {}: {}", ctx, leaf.id, e));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(ctx = %ctx, error = %e, "Listing leaves failed");
                report.failures.push(format!("{} leaves: {}", ctx, e));
            }
        }

        match self.storage.roots(ctx) {
            Ok(roots) => {
                for root in roots {
                    match self.recompute_root_inner(ctx, root.id) {
                        Ok((_, drift)) => {
                            report.roots_checked += 1;
                            report.drifts.extend(drift);
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => {
                            tracing::error!(ctx = %ctx, root_id = %root.id, error = %e, "Root recompute failed");
                            report.failures.push(format!("{} root {}: {}", ctx, root.id, e));
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!(ctx = %ctx, error = %e, "Listing roots failed");
                report.failures.push(format!("{} roots: {}", ctx, e));
            }
        }
    }

    /// Root total summed straight from entries, bypassing leaves
    ///
    /// Diagnostic only; the cached leaf sum stays authoritative and this value
    /// is never written back.
    pub fn audit_root_from_entries(&self, ctx: StorageContext, root_id: RootId) -> Result<Decimal> {
        self.storage.require_root(ctx, root_id)?;
        Ok(self
            .storage
            .entries(ctx)?
            .iter()
            .filter(|entry| entry.root_id == root_id)
            .map(|entry| entry.signed_amount())
            .sum())
    }
}
