//! Main ledger orchestration layer
//!
//! This module ties together storage, the worker pool and the three services
//! into one async API. Mutations run on the worker pool; reads run on the
//! caller's thread straight against the store.
//!
//! # Example
//!
//! ```no_run
//! use pocket_ledger::{Config, Ledger, NewEntry, PostOutcome, StorageContext};
//! use rust_decimal::Decimal;
//!
//! #[tokio::main]
//! async fn main() -> pocket_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default()).await?;
//!     let ctx = StorageContext::Visible;
//!
//!     let home = ledger.create_root(ctx, "Home", "house").await?;
//!     let cash = ledger.create_leaf(ctx, home, "Cash", "wallet", Decimal::from(100)).await?;
//!
//!     let outcome = ledger
//!         .post_entry(ctx, NewEntry::debit(cash, Decimal::from(30), "Groceries"))
//!         .await?;
//!     assert!(matches!(outcome, PostOutcome::Committed(_)));
//!
//!     ledger.shutdown()
//! }
//! ```

use crate::{
    lifecycle::AccountLifecycle,
    locks::LockTable,
    metrics::Metrics,
    pool::WorkerPool,
    posting::PostingProtocol,
    recompute::{BalanceRecomputer, ReconcileReport},
    storage::{RetryPolicy, Storage},
    types::{
        Account, AccountPatch, AccountRef, Category, CategoryId, EditOutcome, EntryEdit, EntryId,
        LeafAccount, LeafId, LedgerEntry, NewEntry, PostOutcome, RootAccount, RootId,
        StorageContext, TargetSelector, TransferOutcome, TransferRequest,
    },
    Config, Error, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;

/// Main ledger interface
#[derive(Debug)]
pub struct Ledger {
    /// Direct storage access (for reads)
    storage: Arc<Storage>,

    /// Runs every mutating unit of work
    pool: WorkerPool,

    recomputer: BalanceRecomputer,
    lifecycle: AccountLifecycle,
    posting: PostingProtocol,

    metrics: Metrics,

    /// Configuration
    config: Config,
}

impl Ledger {
    /// Open the ledger
    ///
    /// With `reconcile.on_open` set, a full reconciliation pass runs before the
    /// ledger is returned; failures are reported in the log, not as an error.
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        let storage = Arc::new(Storage::open(&config)?);
        let locks = Arc::new(LockTable::new());
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;
        let retry = RetryPolicy::new(
            config.store.max_commit_retries,
            Duration::from_millis(config.store.retry_backoff_ms),
            metrics.clone(),
        );
        let pool = WorkerPool::new(config.workers.pool_size, config.workers.queue_capacity)?;

        let ledger = Self {
            recomputer: BalanceRecomputer::new(
                Arc::clone(&storage),
                Arc::clone(&locks),
                retry.clone(),
                metrics.clone(),
            ),
            lifecycle: AccountLifecycle::new(Arc::clone(&storage), Arc::clone(&locks), retry.clone()),
            posting: PostingProtocol::new(Arc::clone(&storage), locks, retry, metrics.clone()),
            storage,
            pool,
            metrics,
            config,
        };

        tracing::info!(
            service = %ledger.config.service_name,
            workers = ledger.pool.size(),
            "Ledger opened"
        );

        if ledger.config.reconcile.on_open {
            let report = ledger.reconcile().await?;
            if !report.drifts.is_empty() {
                tracing::warn!(drifts = report.drifts.len(), "Balances repaired on open");
            }
        }

        Ok(ledger)
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prometheus counters
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    // Account lifecycle

    /// Create a root account
    pub async fn create_root(
        &self,
        ctx: StorageContext,
        name: impl Into<String>,
        icon_ref: impl Into<String>,
    ) -> Result<RootId> {
        let lifecycle = self.lifecycle.clone();
        let (name, icon_ref) = (name.into(), icon_ref.into());
        self.pool
            .submit(move || lifecycle.create_root(ctx, &name, &icon_ref))
            .await
    }

    /// Create a leaf account, optionally with an opening balance
    pub async fn create_leaf(
        &self,
        ctx: StorageContext,
        root_id: RootId,
        name: impl Into<String>,
        icon_ref: impl Into<String>,
        initial_balance: Decimal,
    ) -> Result<LeafId> {
        let lifecycle = self.lifecycle.clone();
        let (name, icon_ref) = (name.into(), icon_ref.into());
        self.pool
            .submit(move || lifecycle.create_leaf(ctx, root_id, &name, &icon_ref, initial_balance))
            .await
    }

    /// Rename or re-icon a root
    pub async fn update_root(
        &self,
        ctx: StorageContext,
        root_id: RootId,
        patch: AccountPatch,
    ) -> Result<RootAccount> {
        let lifecycle = self.lifecycle.clone();
        self.pool
            .submit(move || lifecycle.update_root(ctx, root_id, &patch))
            .await
    }

    /// Rename or re-icon a leaf
    pub async fn update_leaf(
        &self,
        ctx: StorageContext,
        leaf_id: LeafId,
        patch: AccountPatch,
    ) -> Result<LeafAccount> {
        let lifecycle = self.lifecycle.clone();
        self.pool
            .submit(move || lifecycle.update_leaf(ctx, leaf_id, &patch))
            .await
    }

    /// Delete a leaf with its entries
    pub async fn delete_leaf(&self, ctx: StorageContext, leaf_id: LeafId) -> Result<()> {
        let lifecycle = self.lifecycle.clone();
        self.pool
            .submit(move || lifecycle.delete_leaf(ctx, leaf_id))
            .await
    }

    /// Delete a root with all its leaves and entries
    pub async fn delete_root(&self, ctx: StorageContext, root_id: RootId) -> Result<()> {
        let lifecycle = self.lifecycle.clone();
        self.pool
            .submit(move || lifecycle.delete_root(ctx, root_id))
            .await
    }

    /// Patch either account kind
    pub async fn update_account(
        &self,
        ctx: StorageContext,
        account: AccountRef,
        patch: AccountPatch,
    ) -> Result<Account> {
        let lifecycle = self.lifecycle.clone();
        self.pool
            .submit(move || lifecycle.update_account(ctx, account, &patch))
            .await
    }

    /// Delete either account kind with its cascade
    pub async fn delete_account(&self, ctx: StorageContext, account: AccountRef) -> Result<()> {
        let lifecycle = self.lifecycle.clone();
        self.pool
            .submit(move || lifecycle.delete_account(ctx, account))
            .await
    }

    /// Create a category
    pub async fn create_category(
        &self,
        ctx: StorageContext,
        label: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<CategoryId> {
        let lifecycle = self.lifecycle.clone();
        let (label, description) = (label.into(), description.into());
        self.pool
            .submit(move || lifecycle.create_category(ctx, &label, &description))
            .await
    }

    // Posting

    /// Post an entry; debits the leaf cannot cover come back as
    /// [`PostOutcome::InsufficientFunds`]
    pub async fn post_entry(&self, ctx: StorageContext, request: NewEntry) -> Result<PostOutcome> {
        let posting = self.posting.clone();
        self.pool
            .submit(move || posting.post_entry(ctx, &request))
            .await
    }

    /// Cover a shortfall by moving funds from the leaf `selector` picks
    pub async fn resolve_insufficient_funds(
        &self,
        ctx: StorageContext,
        request: TransferRequest,
        selector: TargetSelector,
    ) -> Result<TransferOutcome> {
        let posting = self.posting.clone();
        self.pool
            .submit(move || posting.resolve_insufficient_funds(ctx, &request, selector))
            .await
    }

    /// Edit an entry's amount, direction or description
    pub async fn edit_entry(
        &self,
        ctx: StorageContext,
        entry_id: EntryId,
        edit: EntryEdit,
    ) -> Result<EditOutcome> {
        let posting = self.posting.clone();
        self.pool
            .submit(move || posting.edit_entry(ctx, entry_id, &edit))
            .await
    }

    /// Delete an entry, reversing its effect
    pub async fn delete_entry(&self, ctx: StorageContext, entry_id: EntryId) -> Result<()> {
        let posting = self.posting.clone();
        self.pool
            .submit(move || posting.delete_entry(ctx, entry_id))
            .await
    }

    /// Leaves able to cover `required_amount` for `source_leaf_id`
    pub fn transfer_candidates(
        &self,
        ctx: StorageContext,
        source_leaf_id: LeafId,
        required_amount: Decimal,
    ) -> Result<Vec<LeafAccount>> {
        self.posting
            .transfer_candidates(ctx, source_leaf_id, required_amount)
    }

    // Recomputation

    /// Recompute one leaf from its entries
    pub async fn recompute_leaf(&self, ctx: StorageContext, leaf_id: LeafId) -> Result<Decimal> {
        let recomputer = self.recomputer.clone();
        self.pool
            .submit(move || recomputer.recompute_leaf(ctx, leaf_id))
            .await
    }

    /// Recompute one root from its leaves
    pub async fn recompute_root(&self, ctx: StorageContext, root_id: RootId) -> Result<Decimal> {
        let recomputer = self.recomputer.clone();
        self.pool
            .submit(move || recomputer.recompute_root(ctx, root_id))
            .await
    }

    /// Full reconciliation pass over both contexts
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let recomputer = self.recomputer.clone();
        self.pool
            .submit(move || Ok(recomputer.recompute_all()))
            .await
    }

    /// Root total summed directly from entries (diagnostic)
    pub fn audit_root_from_entries(&self, ctx: StorageContext, root_id: RootId) -> Result<Decimal> {
        self.recomputer.audit_root_from_entries(ctx, root_id)
    }

    // Reads

    /// Get root by ID
    pub fn root(&self, ctx: StorageContext, root_id: RootId) -> Result<RootAccount> {
        self.storage.require_root(ctx, root_id)
    }

    /// Get leaf by ID
    pub fn leaf(&self, ctx: StorageContext, leaf_id: LeafId) -> Result<LeafAccount> {
        self.storage.require_leaf(ctx, leaf_id)
    }

    /// Get either account kind
    pub fn account(&self, ctx: StorageContext, account: AccountRef) -> Result<Account> {
        self.lifecycle.account(ctx, account)
    }

    /// All roots
    pub fn roots(&self, ctx: StorageContext) -> Result<Vec<RootAccount>> {
        self.storage.roots(ctx)
    }

    /// All leaves
    pub fn leaves(&self, ctx: StorageContext) -> Result<Vec<LeafAccount>> {
        self.storage.leaves(ctx)
    }

    /// Leaves of one root
    pub fn leaves_of(&self, ctx: StorageContext, root_id: RootId) -> Result<Vec<LeafAccount>> {
        self.storage.leaves_of(ctx, root_id)
    }

    /// Get entry by ID
    pub fn entry(&self, ctx: StorageContext, entry_id: EntryId) -> Result<LedgerEntry> {
        self.storage.require_entry(ctx, entry_id)
    }

    /// Entries of a leaf, oldest first
    pub fn entries_of_leaf(&self, ctx: StorageContext, leaf_id: LeafId) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_of_leaf(ctx, leaf_id)
    }

    /// Entries with `from_millis <= timestamp <= to_millis`, oldest first
    pub fn entries_between(
        &self,
        ctx: StorageContext,
        from_millis: i64,
        to_millis: i64,
    ) -> Result<Vec<LedgerEntry>> {
        self.storage.entries_between(ctx, from_millis, to_millis)
    }

    /// All categories
    pub fn categories(&self, ctx: StorageContext) -> Result<Vec<Category>> {
        self.storage.categories(ctx)
    }

    /// Sum of every cached leaf balance in the context
    pub fn total_leaf_balance(&self, ctx: StorageContext) -> Result<Decimal> {
        Ok(self.storage.leaves(ctx)?.iter().map(|leaf| leaf.balance).sum())
    }

    /// Drain the worker pool and close the store
    pub fn shutdown(self) -> Result<()> {
        let Ledger {
            storage,
            mut pool,
            recomputer,
            lifecycle,
            posting,
            ..
        } = self;

        pool.shutdown();
        drop((recomputer, lifecycle, posting));

        match Arc::try_unwrap(storage) {
            Ok(storage) => storage.close(),
            Err(_) => Err(Error::Concurrency(
                "Store still referenced at shutdown".to_string(),
            )),
        }
    }
}
