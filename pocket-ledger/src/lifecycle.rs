//! Account lifecycle: create, update, delete roots and leaves
//!
//! Creation and deletion keep the cached balances consistent in the same
//! atomic unit as the structural change:
//!
//! - a leaf created with an opening balance gets an opening Credit entry, and
//!   its root is credited, in one batch
//! - deleting a leaf removes its entries and resets the root to the sum of the
//!   remaining leaves
//! - deleting a root removes every leaf and entry underneath it
//!
//! Name and icon updates re-read the account under its lock, so a concurrent
//! posting's balance is never overwritten from a stale copy.

use crate::{
    locks::{LockKey, LockTable},
    posting::apply_delta,
    storage::{RetryPolicy, Storage},
    types::{
        validate_name, Account, AccountPatch, AccountRef, Category, CategoryId, LeafAccount,
        LeafId, NewEntry, RootAccount, RootId, StorageContext,
    },
    Error, Result,
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Description of the entry carrying a leaf's initial balance
pub const OPENING_BALANCE_DESCRIPTION: &str = "Opening balance";

/// Creates, updates and deletes accounts and categories
#[derive(Debug, Clone)]
pub struct AccountLifecycle {
    storage: Arc<Storage>,
    locks: Arc<LockTable>,
    retry: RetryPolicy,
}

impl AccountLifecycle {
    /// Create the service over an injected store
    pub fn new(storage: Arc<Storage>, locks: Arc<LockTable>, retry: RetryPolicy) -> Self {
        Self {
            storage,
            locks,
            retry,
        }
    }

    /// Create a root account with zero balance
    pub fn create_root(
        &self,
        ctx: StorageContext,
        name: &str,
        icon_ref: &str,
    ) -> Result<RootId> {
        validate_name(name)?;
        let root = RootAccount::new(name.trim(), icon_ref);

        self.retry.run("create_root", || {
            let mut batch = self.storage.batch(ctx);
            batch.put_root(&root);
            batch.commit()
        })?;

        tracing::info!(ctx = %ctx, root_id = %root.id, name = %root.name, "Root account created");
        Ok(root.id)
    }

    /// Create a leaf under `root_id`
    ///
    /// A nonzero `initial_balance` is recorded as an opening Credit entry in
    /// the same unit as the leaf itself.
    pub fn create_leaf(
        &self,
        ctx: StorageContext,
        root_id: RootId,
        name: &str,
        icon_ref: &str,
        initial_balance: Decimal,
    ) -> Result<LeafId> {
        validate_name(name)?;
        if initial_balance < Decimal::ZERO {
            return Err(Error::ValidationFailed(format!(
                "Initial balance must not be negative, got {}",
                initial_balance
            )));
        }

        let leaf_id = LeafId::new();
        let keys = [LockKey::root(ctx, root_id), LockKey::leaf(ctx, leaf_id)];

        self.retry.run("create_leaf", || {
            self.locks.with_locks(&keys, || {
                let mut root = self.storage.require_root(ctx, root_id)?;
                let mut leaf = LeafAccount {
                    id: leaf_id,
                    ..LeafAccount::new(root_id, name.trim(), icon_ref)
                };

                let mut batch = self.storage.batch(ctx);
                if initial_balance > Decimal::ZERO {
                    let opening =
                        NewEntry::credit(leaf_id, initial_balance, OPENING_BALANCE_DESCRIPTION)
                            .into_entry(root_id);
                    apply_delta(&mut leaf, &mut root, opening.signed_amount());
                    batch.put_entry(&opening);
                    batch.put_root(&root);
                }
                batch.put_leaf(&leaf);
                batch.commit()?;

                tracing::info!(
                    ctx = %ctx,
                    root_id = %root_id,
                    leaf_id = %leaf_id,
                    initial_balance = %initial_balance,
                    "Leaf account created"
                );
                Ok(leaf_id)
            })
        })
    }

    /// Change a root's name or icon
    pub fn update_root(
        &self,
        ctx: StorageContext,
        root_id: RootId,
        patch: &AccountPatch,
    ) -> Result<RootAccount> {
        let keys = [LockKey::root(ctx, root_id)];

        self.retry.run("update_root", || {
            self.locks.with_locks(&keys, || {
                let mut root = self.storage.require_root(ctx, root_id)?;
                patch.apply(&mut root.name, &mut root.icon_ref)?;

                let mut batch = self.storage.batch(ctx);
                batch.put_root(&root);
                batch.commit()?;

                tracing::debug!(ctx = %ctx, root_id = %root_id, "Root account updated");
                Ok(root)
            })
        })
    }

    /// Change a leaf's name or icon
    pub fn update_leaf(
        &self,
        ctx: StorageContext,
        leaf_id: LeafId,
        patch: &AccountPatch,
    ) -> Result<LeafAccount> {
        let root_id = self.storage.require_leaf(ctx, leaf_id)?.root_id;
        let keys = [LockKey::root(ctx, root_id), LockKey::leaf(ctx, leaf_id)];

        self.retry.run("update_leaf", || {
            self.locks.with_locks(&keys, || {
                let mut leaf = self.storage.require_leaf(ctx, leaf_id)?;
                patch.apply(&mut leaf.name, &mut leaf.icon_ref)?;

                let mut batch = self.storage.batch(ctx);
                batch.put_leaf(&leaf);
                batch.commit()?;

                tracing::debug!(ctx = %ctx, leaf_id = %leaf_id, "Leaf account updated");
                Ok(leaf)
            })
        })
    }

    /// Delete a leaf and its entries; the root drops the leaf's contribution
    pub fn delete_leaf(&self, ctx: StorageContext, leaf_id: LeafId) -> Result<()> {
        let root_id = self.storage.require_leaf(ctx, leaf_id)?.root_id;
        let root_key = LockKey::root(ctx, root_id);
        let leaf_key = LockKey::leaf(ctx, leaf_id);

        self.retry.run("delete_leaf", || {
            self.locks.with_locks(&[root_key, leaf_key], || {
                let leaf = self.storage.require_leaf(ctx, leaf_id)?;
                let mut root = self.storage.require_root(ctx, root_id)?;
                let entries = self.storage.entries_of_leaf(ctx, leaf_id)?;

                root.balance = self
                    .storage
                    .leaves_of(ctx, root_id)?
                    .iter()
                    .filter(|other| other.id != leaf_id)
                    .map(|other| other.balance)
                    .sum();

                let mut batch = self.storage.batch(ctx);
                for entry in &entries {
                    batch.delete_entry(entry);
                }
                batch.delete_leaf(&leaf);
                batch.put_root(&root);
                batch.commit()?;

                self.locks.forget(leaf_key);
                tracing::info!(
                    ctx = %ctx,
                    leaf_id = %leaf_id,
                    entries = entries.len(),
                    root_balance = %root.balance,
                    "Leaf account deleted"
                );
                Ok(())
            })
        })
    }

    /// Delete a root with every leaf and entry under it
    pub fn delete_root(&self, ctx: StorageContext, root_id: RootId) -> Result<()> {
        let root_key = LockKey::root(ctx, root_id);

        // The root lock excludes every leaf writer underneath
        self.retry.run("delete_root", || {
            self.locks.with_locks(&[root_key], || {
                self.storage.require_root(ctx, root_id)?;
                let leaves = self.storage.leaves_of(ctx, root_id)?;

                let mut batch = self.storage.batch(ctx);
                let mut entry_count = 0;
                for leaf in &leaves {
                    for entry in self.storage.entries_of_leaf(ctx, leaf.id)? {
                        batch.delete_entry(&entry);
                        entry_count += 1;
                    }
                    batch.delete_leaf(leaf);
                }
                batch.delete_root(root_id);
                batch.commit()?;

                for leaf in &leaves {
                    self.locks.forget(LockKey::leaf(ctx, leaf.id));
                }
                self.locks.forget(root_key);
                tracing::info!(
                    ctx = %ctx,
                    root_id = %root_id,
                    leaves = leaves.len(),
                    entries = entry_count,
                    "Root account deleted"
                );
                Ok(())
            })
        })
    }

    /// Load either account kind
    pub fn account(&self, ctx: StorageContext, account: AccountRef) -> Result<Account> {
        match account {
            AccountRef::Root(id) => self.storage.require_root(ctx, id).map(Account::Root),
            AccountRef::Leaf(id) => self.storage.require_leaf(ctx, id).map(Account::Leaf),
        }
    }

    /// Patch either account kind
    pub fn update_account(
        &self,
        ctx: StorageContext,
        account: AccountRef,
        patch: &AccountPatch,
    ) -> Result<Account> {
        match account {
            AccountRef::Root(id) => self.update_root(ctx, id, patch).map(Account::Root),
            AccountRef::Leaf(id) => self.update_leaf(ctx, id, patch).map(Account::Leaf),
        }
    }

    /// Delete either account kind with its cascade
    pub fn delete_account(&self, ctx: StorageContext, account: AccountRef) -> Result<()> {
        match account {
            AccountRef::Root(id) => self.delete_root(ctx, id),
            AccountRef::Leaf(id) => self.delete_leaf(ctx, id),
        }
    }

    /// Create a category entries may reference
    pub fn create_category(
        &self,
        ctx: StorageContext,
        label: &str,
        description: &str,
    ) -> Result<CategoryId> {
        validate_name(label)?;
        let category = Category {
            id: CategoryId::new(),
            label: label.trim().to_string(),
            description: description.to_string(),
        };

        self.retry.run("create_category", || {
            let mut batch = self.storage.batch(ctx);
            batch.put_category(&category);
            batch.commit()
        })?;

        tracing::debug!(ctx = %ctx, category_id = %category.id, label = %category.label, "Category created");
        Ok(category.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use crate::types::AccountView;
    use crate::types::StorageContext::{Hidden, Visible};
    use crate::Config;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        storage: Arc<Storage>,
        locks: Arc<LockTable>,
        lifecycle: AccountLifecycle,
        _temp: TempDir,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp.path().to_path_buf();
        config.rocksdb.sync_writes = false;
        let storage = Arc::new(Storage::open(&config).unwrap());
        let locks = Arc::new(LockTable::new());
        let retry = RetryPolicy::new(0, Duration::from_millis(0), Metrics::new().unwrap());
        let lifecycle = AccountLifecycle::new(Arc::clone(&storage), Arc::clone(&locks), retry);
        Fixture {
            storage,
            locks,
            lifecycle,
            _temp: temp,
        }
    }

    #[test]
    fn test_create_root_starts_at_zero() {
        let f = fixture();
        let root_id = f.lifecycle.create_root(Visible, "  Home ", "house").unwrap();

        let root = f.storage.require_root(Visible, root_id).unwrap();
        assert_eq!(root.name, "Home");
        assert_eq!(root.balance, Decimal::ZERO);
    }

    #[test]
    fn test_create_root_rejects_blank_name() {
        let f = fixture();
        let result = f.lifecycle.create_root(Visible, " ", "house");
        assert!(matches!(result, Err(Error::ValidationFailed(_))));
        assert!(f.storage.roots(Visible).unwrap().is_empty());
    }

    #[test]
    fn test_create_leaf_with_opening_balance() {
        let f = fixture();
        let root_id = f.lifecycle.create_root(Visible, "Home", "house").unwrap();
        let leaf_id = f
            .lifecycle
            .create_leaf(Visible, root_id, "Cash", "wallet", Decimal::from(100))
            .unwrap();

        let leaf = f.storage.require_leaf(Visible, leaf_id).unwrap();
        assert_eq!(leaf.balance, Decimal::from(100));
        assert_eq!(f.storage.require_root(Visible, root_id).unwrap().balance, Decimal::from(100));

        let entries = f.storage.entries_of_leaf(Visible, leaf_id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].description, OPENING_BALANCE_DESCRIPTION);
        assert_eq!(entries[0].signed_amount(), Decimal::from(100));
        assert_eq!(entries[0].root_id, root_id);
    }

    #[test]
    fn test_create_leaf_zero_balance_has_no_entries() {
        let f = fixture();
        let root_id = f.lifecycle.create_root(Visible, "Home", "house").unwrap();
        let leaf_id = f
            .lifecycle
            .create_leaf(Visible, root_id, "Cash", "wallet", Decimal::ZERO)
            .unwrap();
        assert!(f.storage.entries_of_leaf(Visible, leaf_id).unwrap().is_empty());
    }

    #[test]
    fn test_create_leaf_validation() {
        let f = fixture();
        let root_id = f.lifecycle.create_root(Visible, "Home", "house").unwrap();

        let negative = f
            .lifecycle
            .create_leaf(Visible, root_id, "Cash", "wallet", Decimal::from(-1));
        assert!(matches!(negative, Err(Error::ValidationFailed(_))));

        let orphan = f
            .lifecycle
            .create_leaf(Visible, RootId::new(), "Cash", "wallet", Decimal::ZERO);
        assert!(matches!(orphan, Err(Error::AccountNotFound(_))));

        // Parent lives in the other context
        let hidden = f
            .lifecycle
            .create_leaf(Hidden, root_id, "Cash", "wallet", Decimal::ZERO);
        assert!(matches!(hidden, Err(Error::AccountNotFound(_))));
    }

    #[test]
    fn test_update_never_touches_balance() {
        let f = fixture();
        let root_id = f.lifecycle.create_root(Visible, "Home", "house").unwrap();
        let leaf_id = f
            .lifecycle
            .create_leaf(Visible, root_id, "Cash", "wallet", Decimal::from(25))
            .unwrap();

        let patch = AccountPatch {
            name: Some("Pocket cash".to_string()),
            icon_ref: Some("coins".to_string()),
        };
        let leaf = f.lifecycle.update_leaf(Visible, leaf_id, &patch).unwrap();
        assert_eq!(leaf.name, "Pocket cash");
        assert_eq!(leaf.icon_ref, "coins");
        assert_eq!(leaf.balance, Decimal::from(25));

        let root = f
            .lifecycle
            .update_account(Visible, AccountRef::Root(root_id), &AccountPatch::rename("House"))
            .unwrap();
        assert_eq!(root.name(), "House");
        assert_eq!(root.balance(), Decimal::from(25));
    }

    #[test]
    fn test_delete_leaf_cascades_entries_and_root() {
        let f = fixture();
        let root_id = f.lifecycle.create_root(Visible, "Home", "house").unwrap();
        let cash = f
            .lifecycle
            .create_leaf(Visible, root_id, "Cash", "wallet", Decimal::from(100))
            .unwrap();
        f.lifecycle
            .create_leaf(Visible, root_id, "Bank", "bank", Decimal::from(50))
            .unwrap();

        f.lifecycle.delete_leaf(Visible, cash).unwrap();

        assert!(f.storage.leaf(Visible, cash).unwrap().is_none());
        assert!(f.storage.entries_of_leaf(Visible, cash).unwrap().is_empty());
        assert!(f.storage.entries(Visible).unwrap().iter().all(|e| e.leaf_id != cash));
        assert_eq!(f.storage.require_root(Visible, root_id).unwrap().balance, Decimal::from(50));
        // Root and Bank slots remain
        assert_eq!(f.locks.len(), 2);
    }

    #[test]
    fn test_delete_root_cascades_everything() {
        let f = fixture();
        let home = f.lifecycle.create_root(Visible, "Home", "house").unwrap();
        let work = f.lifecycle.create_root(Visible, "Work", "briefcase").unwrap();
        f.lifecycle
            .create_leaf(Visible, home, "Cash", "wallet", Decimal::from(10))
            .unwrap();
        f.lifecycle
            .create_leaf(Visible, home, "Bank", "bank", Decimal::from(20))
            .unwrap();
        let payroll = f
            .lifecycle
            .create_leaf(Visible, work, "Payroll", "bank", Decimal::from(5))
            .unwrap();

        f.lifecycle.delete_account(Visible, AccountRef::Root(home)).unwrap();

        assert!(f.storage.root(Visible, home).unwrap().is_none());
        let leaves = f.storage.leaves(Visible).unwrap();
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].id, payroll);
        let entries = f.storage.entries(Visible).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].leaf_id, payroll);
    }

    #[test]
    fn test_delete_missing_account_is_not_found() {
        let f = fixture();
        assert!(f.lifecycle.delete_leaf(Visible, LeafId::new()).unwrap_err().is_not_found());
        assert!(f.lifecycle.delete_root(Visible, RootId::new()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_account_lookup_by_ref() {
        let f = fixture();
        let root_id = f.lifecycle.create_root(Hidden, "Vault", "lock").unwrap();
        let account = f.lifecycle.account(Hidden, AccountRef::Root(root_id)).unwrap();
        assert_eq!(account.account_ref(), AccountRef::Root(root_id));
        assert!(f.lifecycle.account(Visible, AccountRef::Root(root_id)).is_err());
    }

    #[test]
    fn test_create_category() {
        let f = fixture();
        let id = f.lifecycle.create_category(Visible, "Food", "Groceries and eating out").unwrap();
        let category = f.storage.require_category(Visible, id).unwrap();
        assert_eq!(category.label, "Food");
        assert!(f.lifecycle.create_category(Visible, "", "none").is_err());
    }
}
