//! Per-account exclusive locks
//!
//! A unit of work names every account it will read-modify-write, locks them
//! all in one global order, runs, and releases. Any leaf mutation also names
//! the leaf's root, so holding a root lock excludes every writer under it.

use crate::types::{LeafId, RootId, StorageContext};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use uuid::Uuid;

/// Lockable account, scoped to its storage context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LockKey {
    ctx: StorageContext,
    account: Uuid,
}

impl LockKey {
    /// Lock key for a root
    pub fn root(ctx: StorageContext, id: RootId) -> Self {
        Self {
            ctx,
            account: id.as_uuid(),
        }
    }

    /// Lock key for a leaf
    pub fn leaf(ctx: StorageContext, id: LeafId) -> Self {
        Self {
            ctx,
            account: id.as_uuid(),
        }
    }
}

/// Table of account mutexes, created on first use
#[derive(Debug, Default)]
pub struct LockTable {
    slots: DashMap<LockKey, Arc<Mutex<()>>>,
}

impl LockTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding every lock in `keys`
    ///
    /// Keys are sorted and deduplicated before locking, so callers may pass
    /// them in any order and overlapping units cannot deadlock.
    pub fn with_locks<T>(&self, keys: &[LockKey], f: impl FnOnce() -> T) -> T {
        let mut keys = keys.to_vec();
        keys.sort_unstable();
        keys.dedup();

        let slots: Vec<Arc<Mutex<()>>> = keys
            .iter()
            .map(|key| Arc::clone(&self.slots.entry(*key).or_default()))
            .collect();
        let _guards: Vec<_> = slots.iter().map(|slot| slot.lock()).collect();

        f()
    }

    /// Drop the slot of a deleted account
    ///
    /// Must be called after the deletion committed, while still holding the
    /// lock: later lockers then find the account gone.
    pub fn forget(&self, key: LockKey) {
        self.slots.remove(&key);
    }

    /// Number of live slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no slot exists
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
