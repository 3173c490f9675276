//! Ledger posting and compensating transfer protocol
//!
//! Every operation here is one atomic unit: it locks the accounts it touches
//! (leaf and root, or both leaves and both roots for a transfer), re-reads them,
//! stages the entry writes together with the balance deltas in a single
//! `WriteBatch`, and commits.
//!
//! # Posting state machine
//!
//! ```text
//! Pending ──► Committed
//!    │
//!    └──► Rejected(InsufficientFunds) ──► resolve_insufficient_funds
//!                                           ├──► Committed ──► retry post_entry
//!                                           └──► Aborted
//! ```
//!
//! # Invariants
//!
//! - A debit (or edit) never leaves a leaf negative; it is turned away first
//! - A transfer moves money between leaves; the total across all leaves is
//!   unchanged
//! - Entry, leaf and root writes commit together or not at all

use crate::{
    locks::{LockKey, LockTable},
    metrics::Metrics,
    storage::{RetryPolicy, Storage},
    types::{
        validate_magnitude, AbortReason, Direction, EditOutcome, EntryEdit, EntryId, LeafAccount,
        LeafId, LedgerEntry, NewEntry, PostOutcome, RootAccount, StorageContext, TargetSelector,
        TransferId, TransferOutcome, TransferReceipt, TransferRequest,
    },
    Result,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Apply a signed delta to a leaf and its root
pub(crate) fn apply_delta(leaf: &mut LeafAccount, root: &mut RootAccount, delta: Decimal) {
    leaf.balance += delta;
    root.balance += delta;
}

/// Posts, edits and deletes entries; resolves shortfalls by transfer
#[derive(Debug, Clone)]
pub struct PostingProtocol {
    storage: Arc<Storage>,
    locks: Arc<LockTable>,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl PostingProtocol {
    /// Create the protocol over an injected store
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

    /// Post an entry against a leaf
    ///
    /// A debit larger than the leaf balance writes nothing and returns
    /// [`PostOutcome::InsufficientFunds`].
    pub fn post_entry(&self, ctx: StorageContext, request: &NewEntry) -> Result<PostOutcome> {
        validate_magnitude(request.magnitude)?;

        // Roots never change, so the unlocked read is enough to pick locks
        let root_id = self.storage.require_leaf(ctx, request.leaf_id)?.root_id;
        let keys = [LockKey::root(ctx, root_id), LockKey::leaf(ctx, request.leaf_id)];

        self.retry.run("post_entry", || {
            self.locks.with_locks(&keys, || {
                let mut leaf = self.storage.require_leaf(ctx, request.leaf_id)?;
                let mut root = self.storage.require_root(ctx, leaf.root_id)?;
                if let Some(category_id) = request.category_id {
                    self.storage.require_category(ctx, category_id)?;
                }

                if request.direction == Direction::Debit && request.magnitude > leaf.balance {
                    let shortfall = request.magnitude - leaf.balance;
                    self.metrics.record_insufficient_funds();
                    tracing::info!(
                        ctx = %ctx,
                        leaf_id = %leaf.id,
                        balance = %leaf.balance,
                        magnitude = %request.magnitude,
                        shortfall = %shortfall,
                        "Debit rejected: insufficient funds"
                    );
                    return Ok(PostOutcome::InsufficientFunds { shortfall });
                }

                let entry = request.clone().into_entry(leaf.root_id);
                apply_delta(&mut leaf, &mut root, entry.signed_amount());

                let mut batch = self.storage.batch(ctx);
                batch.put_entry(&entry);
                batch.put_leaf(&leaf);
                batch.put_root(&root);
                batch.commit()?;

                self.metrics.record_entry_posted();
                tracing::debug!(
                    ctx = %ctx,
                    entry_id = %entry.id,
                    leaf_id = %leaf.id,
                    delta = %entry.signed_amount(),
                    leaf_balance = %leaf.balance,
                    root_balance = %root.balance,
                    "Entry posted"
                );
                Ok(PostOutcome::Committed(entry.id))
            })
        })
    }

    /// Leaves other than the source that can cover `required_amount`
    pub fn transfer_candidates(
        &self,
        ctx: StorageContext,
        source_leaf_id: LeafId,
        required_amount: Decimal,
    ) -> Result<Vec<LeafAccount>> {
        validate_magnitude(required_amount)?;
        self.storage.require_leaf(ctx, source_leaf_id)?;

        let mut candidates: Vec<LeafAccount> = self
            .storage
            .leaves(ctx)?
            .into_iter()
            .filter(|leaf| leaf.id != source_leaf_id && leaf.balance >= required_amount)
            .collect();
        candidates.sort_by(|a, b| b.balance.cmp(&a.balance).then_with(|| a.name.cmp(&b.name)));
        Ok(candidates)
    }

    /// Cover a shortfall on the source leaf by moving funds from a selected leaf
    ///
    /// On success the caller retries the original debit through
    /// [`PostingProtocol::post_entry`].
    pub fn resolve_insufficient_funds(
        &self,
        ctx: StorageContext,
        request: &TransferRequest,
        selector: TargetSelector,
    ) -> Result<TransferOutcome> {
        let candidates =
            self.transfer_candidates(ctx, request.source_leaf_id, request.required_amount)?;

        if candidates.is_empty() {
            return Ok(self.abort(ctx, request, AbortReason::NoCandidates));
        }

        let target_leaf_id = match selector.select(&candidates) {
            Some(id) => id,
            None => return Ok(self.abort(ctx, request, AbortReason::Declined)),
        };

        self.transfer(ctx, request, target_leaf_id)
    }

    /// Atomically move `required_amount` from `target_leaf_id` to the source
    fn transfer(
        &self,
        ctx: StorageContext,
        request: &TransferRequest,
        target_leaf_id: LeafId,
    ) -> Result<TransferOutcome> {
        if target_leaf_id == request.source_leaf_id {
            return Ok(self.abort(ctx, request, AbortReason::TargetNotEligible));
        }

        let source_root_id = self.storage.require_leaf(ctx, request.source_leaf_id)?.root_id;
        let target_root_id = match self.storage.leaf(ctx, target_leaf_id)? {
            Some(target) => target.root_id,
            None => return Ok(self.abort(ctx, request, AbortReason::TargetNotEligible)),
        };
        let keys = [
            LockKey::root(ctx, source_root_id),
            LockKey::root(ctx, target_root_id),
            LockKey::leaf(ctx, request.source_leaf_id),
            LockKey::leaf(ctx, target_leaf_id),
        ];
        let amount = request.required_amount;

        let outcome = self.retry.run("transfer", || {
            self.locks.with_locks(&keys, || {
                let mut source = self.storage.require_leaf(ctx, request.source_leaf_id)?;
                let mut target = match self.storage.leaf(ctx, target_leaf_id)? {
                    Some(target) if target.balance >= amount => target,
                    // Target drained or deleted since it was offered
                    _ => return Ok(TransferOutcome::Aborted(AbortReason::TargetNotEligible)),
                };

                let transfer_id = TransferId::new();
                let now = Utc::now().timestamp_millis();
                let debit = LedgerEntry {
                    id: EntryId::new(),
                    root_id: target.root_id,
                    leaf_id: target.id,
                    category_id: None,
                    description: format!("Transfer to {}: {}", source.name, request.description),
                    magnitude: amount,
                    direction: Direction::Debit,
                    timestamp_millis: now,
                    transfer_id: Some(transfer_id),
                };
                let credit = LedgerEntry {
                    id: EntryId::new(),
                    root_id: source.root_id,
                    leaf_id: source.id,
                    category_id: None,
                    description: format!("Transfer from {}: {}", target.name, request.description),
                    magnitude: amount,
                    direction: Direction::Credit,
                    timestamp_millis: now,
                    transfer_id: Some(transfer_id),
                };

                target.balance -= amount;
                source.balance += amount;

                let mut batch = self.storage.batch(ctx);
                batch.put_entry(&debit);
                batch.put_entry(&credit);
                batch.put_leaf(&target);
                batch.put_leaf(&source);

                let cross_root = target.root_id != source.root_id;
                if cross_root {
                    // Same-root transfers cancel out inside the root
                    let mut target_root = self.storage.require_root(ctx, target.root_id)?;
                    let mut source_root = self.storage.require_root(ctx, source.root_id)?;
                    target_root.balance -= amount;
                    source_root.balance += amount;
                    batch.put_root(&target_root);
                    batch.put_root(&source_root);
                }
                batch.commit()?;

                tracing::info!(
                    ctx = %ctx,
                    transfer_id = %transfer_id,
                    from_leaf = %target.id,
                    to_leaf = %source.id,
                    amount = %amount,
                    cross_root,
                    "Compensating transfer committed"
                );
                Ok(TransferOutcome::Committed(TransferReceipt {
                    transfer_id,
                    debit_entry_id: debit.id,
                    credit_entry_id: credit.id,
                    target_leaf_id: target.id,
                    cross_root,
                }))
            })
        })?;

        match outcome {
            TransferOutcome::Committed(_) => {
                self.metrics.record_transfer();
                Ok(outcome)
            }
            TransferOutcome::Aborted(reason) => Ok(self.abort(ctx, request, reason)),
        }
    }

    fn abort(&self, ctx: StorageContext, request: &TransferRequest, reason: AbortReason) -> TransferOutcome {
        self.metrics.record_transfer_aborted();
        tracing::info!(
            ctx = %ctx,
            source_leaf = %request.source_leaf_id,
            amount = %request.required_amount,
            reason = ?reason,
            "Transfer resolution aborted"
        );
        TransferOutcome::Aborted(reason)
    }

    /// Replace an entry's amount, direction and description
    ///
    /// An edit that would overdraw the leaf writes nothing and returns
    /// [`EditOutcome::InsufficientFunds`]; the same transfer path applies.
    pub fn edit_entry(
        &self,
        ctx: StorageContext,
        entry_id: EntryId,
        edit: &EntryEdit,
    ) -> Result<EditOutcome> {
        validate_magnitude(edit.magnitude)?;

        let existing = self.storage.require_entry(ctx, entry_id)?;
        let keys = [
            LockKey::root(ctx, existing.root_id),
            LockKey::leaf(ctx, existing.leaf_id),
        ];

        self.retry.run("edit_entry", || {
            self.locks.with_locks(&keys, || {
                let mut entry = self.storage.require_entry(ctx, entry_id)?;
                let mut leaf = self.storage.require_leaf(ctx, entry.leaf_id)?;
                let mut root = self.storage.require_root(ctx, leaf.root_id)?;

                let direction = edit.direction.unwrap_or(entry.direction);
                let delta = direction.signed(edit.magnitude) - entry.signed_amount();

                if delta < Decimal::ZERO && leaf.balance + delta < Decimal::ZERO {
                    let shortfall = -(leaf.balance + delta);
                    self.metrics.record_insufficient_funds();
                    tracing::info!(
                        ctx = %ctx,
                        entry_id = %entry_id,
                        leaf_id = %leaf.id,
                        shortfall = %shortfall,
                        "Edit rejected: insufficient funds"
                    );
                    return Ok(EditOutcome::InsufficientFunds { shortfall });
                }

                entry.magnitude = edit.magnitude;
                entry.direction = direction;
                entry.description = edit.description.clone();
                apply_delta(&mut leaf, &mut root, delta);

                let mut batch = self.storage.batch(ctx);
                batch.put_entry(&entry);
                batch.put_leaf(&leaf);
                batch.put_root(&root);
                batch.commit()?;

                tracing::debug!(ctx = %ctx, entry_id = %entry_id, delta = %delta, "Entry edited");
                Ok(EditOutcome::Applied)
            })
        })
    }

    /// Remove an entry and reverse its effect on leaf and root
    pub fn delete_entry(&self, ctx: StorageContext, entry_id: EntryId) -> Result<()> {
        let existing = self.storage.require_entry(ctx, entry_id)?;
        let keys = [
            LockKey::root(ctx, existing.root_id),
            LockKey::leaf(ctx, existing.leaf_id),
        ];

        self.retry.run("delete_entry", || {
            self.locks.with_locks(&keys, || {
                let entry = self.storage.require_entry(ctx, entry_id)?;
                let mut leaf = self.storage.require_leaf(ctx, entry.leaf_id)?;
                let mut root = self.storage.require_root(ctx, leaf.root_id)?;

                apply_delta(&mut leaf, &mut root, -entry.signed_amount());

                let mut batch = self.storage.batch(ctx);
                batch.delete_entry(&entry);
                batch.put_leaf(&leaf);
                batch.put_root(&root);
                batch.commit()?;

                tracing::debug!(
                    ctx = %ctx,
                    entry_id = %entry_id,
                    leaf_balance = %leaf.balance,
                    "Entry deleted"
                );
                Ok(())
            })
        })
    }
}
