//! Pocket Ledger
//!
//! Balance-consistency engine for a personal finance ledger: root accounts
//! aggregate leaf accounts, leaves hold signed entries, and every cached
//! balance is kept equal to what its entries imply.
//!
//! # Architecture
//!
//! - **Materialized balances**: leaf and root balances are cached and updated
//!   in the same atomic batch as the entry that changes them
//! - **Two universes**: a visible and a hidden (vault) hierarchy share one
//!   engine, selected by [`StorageContext`]
//! - **Worker pool**: mutations run on a bounded pool under per-account locks
//! - **Compensating transfers**: a debit the leaf cannot cover is turned away,
//!   and can be resolved by moving funds from another leaf
//!
//! # Invariants
//!
//! - Leaf balance == sum of the leaf's signed entries
//! - Root balance == sum of its leaves' balances
//! - Every entry's root is its leaf's root
//! - A posted debit never drives a leaf negative on its own
//! - Deleting an account deletes everything under it

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod types;
pub mod storage;
pub mod locks;
pub mod pool;
pub mod recompute;
pub mod lifecycle;
pub mod posting;
pub mod ledger;
pub mod reconciler;
pub mod error;
pub mod config;
pub mod metrics;

// Re-exports
pub use error::{Error, Result};
pub use types::{
    AbortReason, Account, AccountPatch, AccountRef, AccountView, Category, CategoryId, Direction,
    EditOutcome, EntryEdit, EntryId, LeafAccount, LeafId, LedgerEntry, NewEntry, PostOutcome,
    RootAccount, RootId, StorageContext, TargetSelector, TransferId, TransferOutcome,
    TransferReceipt, TransferRequest,
};
pub use ledger::Ledger;
pub use config::Config;
pub use metrics::Metrics;
pub use recompute::{Drift, DriftKind, ReconcileReport};
pub use reconciler::{spawn_reconciler, ReconcilerHandle};
pub use storage::Storage;
