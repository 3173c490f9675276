//! Storage layer using RocksDB
//!
//! Every table exists once per [`StorageContext`]; the hidden vault uses the
//! same layout under `vault_`-prefixed column families, so both universes share
//! one engine and never see each other's records.
//!
//! # Column Families
//!
//! - `roots` - Root accounts (key: root_id)
//! - `leaves` - Leaf accounts (key: leaf_id)
//! - `entries` - Ledger entries (key: entry_id)
//! - `root_leaves` - Index (key: root_id || leaf_id)
//! - `leaf_entries` - Index (key: leaf_id || timestamp || entry_id)
//! - `timeline` - Index (key: timestamp || entry_id)
//! - `categories` - Category tags (key: category_id)

use crate::{
    error::{Error, Result},
    metrics::Metrics,
    types::{
        Category, CategoryId, EntryId, LeafAccount, LeafId, LedgerEntry, RootAccount, RootId,
        StorageContext,
    },
    Config,
};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    WriteOptions, DB,
};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// Logical tables, each materialized once per storage context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Roots,
    Leaves,
    Entries,
    RootLeaves,
    LeafEntries,
    Timeline,
    Categories,
}

impl Table {
    const ALL: [Table; 7] = [
        Table::Roots,
        Table::Leaves,
        Table::Entries,
        Table::RootLeaves,
        Table::LeafEntries,
        Table::Timeline,
        Table::Categories,
    ];

    fn cf_name(self, ctx: StorageContext) -> &'static str {
        match (ctx, self) {
            (StorageContext::Visible, Table::Roots) => "roots",
            (StorageContext::Visible, Table::Leaves) => "leaves",
            (StorageContext::Visible, Table::Entries) => "entries",
            (StorageContext::Visible, Table::RootLeaves) => "root_leaves",
            (StorageContext::Visible, Table::LeafEntries) => "leaf_entries",
            (StorageContext::Visible, Table::Timeline) => "timeline",
            (StorageContext::Visible, Table::Categories) => "categories",
            (StorageContext::Hidden, Table::Roots) => "vault_roots",
            (StorageContext::Hidden, Table::Leaves) => "vault_leaves",
            (StorageContext::Hidden, Table::Entries) => "vault_entries",
            (StorageContext::Hidden, Table::RootLeaves) => "vault_root_leaves",
            (StorageContext::Hidden, Table::LeafEntries) => "vault_leaf_entries",
            (StorageContext::Hidden, Table::Timeline) => "vault_timeline",
            (StorageContext::Hidden, Table::Categories) => "vault_categories",
        }
    }

    fn options(self) -> Options {
        let mut opts = Options::default();
        match self {
            Table::RootLeaves | Table::LeafEntries | Table::Timeline => {
                // Index scans are prefix/range seeks
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
            _ => {}
        }
        opts
    }
}

/// Storage wrapper for RocksDB
pub struct Storage {
    db: DB,
    sync_writes: bool,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("path", &self.db.path())
            .finish()
    }
}

impl Storage {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);
        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = StorageContext::ALL
            .into_iter()
            .flat_map(|ctx| {
                Table::ALL
                    .into_iter()
                    .map(move |table| ColumnFamilyDescriptor::new(table.cf_name(ctx), table.options()))
            })
            .collect();
        let cf_count = cf_descriptors.len();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = ?path,
            column_families = cf_count,
            "Opened RocksDB ledger store"
        );

        Ok(Self {
            db,
            sync_writes: config.rocksdb.sync_writes,
        })
    }

    fn cf(&self, ctx: StorageContext, table: Table) -> Result<&ColumnFamily> {
        let name = table.cf_name(ctx);
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Corruption(format!("Column family {} not found", name)))
    }

    fn get<T: DeserializeOwned>(
        &self,
        ctx: StorageContext,
        table: Table,
        key: &[u8],
    ) -> Result<Option<T>> {
        let cf = self.cf(ctx, table)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Keys of `table` starting at `from` for as long as `keep` accepts them
    fn scan_keys(
        &self,
        ctx: StorageContext,
        table: Table,
        from: &[u8],
        keep: impl Fn(&[u8]) -> bool,
    ) -> Result<Vec<Box<[u8]>>> {
        let cf = self.cf(ctx, table)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::From(from, Direction::Forward)) {
            let (key, _) = item?;
            if !keep(&key[..]) {
                break;
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn scan_values<T: DeserializeOwned>(&self, ctx: StorageContext, table: Table) -> Result<Vec<T>> {
        let cf = self.cf(ctx, table)?;
        let mut values = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            values.push(bincode::deserialize(&value)?);
        }
        Ok(values)
    }

    // Root operations

    /// Get root by ID
    pub fn root(&self, ctx: StorageContext, id: RootId) -> Result<Option<RootAccount>> {
        self.get(ctx, Table::Roots, id.as_bytes())
    }

    /// Get root by ID, failing with `AccountNotFound`
    pub fn require_root(&self, ctx: StorageContext, id: RootId) -> Result<RootAccount> {
        self.root(ctx, id)?
            .ok_or_else(|| Error::AccountNotFound(format!("root {} ({})", id, ctx)))
    }

    /// All roots in the context
    pub fn roots(&self, ctx: StorageContext) -> Result<Vec<RootAccount>> {
        self.scan_values(ctx, Table::Roots)
    }

    // Leaf operations

    /// Get leaf by ID
    pub fn leaf(&self, ctx: StorageContext, id: LeafId) -> Result<Option<LeafAccount>> {
        self.get(ctx, Table::Leaves, id.as_bytes())
    }

    /// Get leaf by ID, failing with `AccountNotFound`
    pub fn require_leaf(&self, ctx: StorageContext, id: LeafId) -> Result<LeafAccount> {
        self.leaf(ctx, id)?
            .ok_or_else(|| Error::AccountNotFound(format!("leaf {} ({})", id, ctx)))
    }

    /// All leaves in the context
    pub fn leaves(&self, ctx: StorageContext) -> Result<Vec<LeafAccount>> {
        self.scan_values(ctx, Table::Leaves)
    }

    /// Leaves owned by a root (via index)
    pub fn leaves_of(&self, ctx: StorageContext, root_id: RootId) -> Result<Vec<LeafAccount>> {
        let prefix = root_id.as_bytes();
        let keys = self.scan_keys(ctx, Table::RootLeaves, prefix, |k| k.starts_with(prefix))?;

        let mut leaves = Vec::with_capacity(keys.len());
        for key in keys {
            let leaf_id = LeafId::from_uuid(uuid_at(&key, 16)?);
            // Index and record are written in one batch; a miss means corruption
            let leaf = self.leaf(ctx, leaf_id)?.ok_or_else(|| {
                Error::Corruption(format!("Index references missing leaf {}", leaf_id))
            })?;
            leaves.push(leaf);
        }
        Ok(leaves)
    }

    // Entry operations

    /// Get entry by ID
    pub fn entry(&self, ctx: StorageContext, id: EntryId) -> Result<Option<LedgerEntry>> {
        self.get(ctx, Table::Entries, id.as_bytes())
    }

    /// Get entry by ID, failing with `EntryNotFound`
    pub fn require_entry(&self, ctx: StorageContext, id: EntryId) -> Result<LedgerEntry> {
        self.entry(ctx, id)?
            .ok_or_else(|| Error::EntryNotFound(format!("{} ({})", id, ctx)))
    }

    /// Entries of a leaf in time order (via index)
    pub fn entries_of_leaf(&self, ctx: StorageContext, leaf_id: LeafId) -> Result<Vec<LedgerEntry>> {
        let prefix = leaf_id.as_bytes();
        let keys = self.scan_keys(ctx, Table::LeafEntries, prefix, |k| k.starts_with(prefix))?;
        self.load_entries(ctx, keys, 24)
    }

    /// Entries with `from_millis <= timestamp <= to_millis`, in time order
    pub fn entries_between(
        &self,
        ctx: StorageContext,
        from_millis: i64,
        to_millis: i64,
    ) -> Result<Vec<LedgerEntry>> {
        if from_millis > to_millis {
            return Ok(Vec::new());
        }
        let start = time_key(from_millis);
        let end = time_key(to_millis);
        let keys = self.scan_keys(ctx, Table::Timeline, &start, |k| {
            k.get(..8).map_or(false, |ts| ts <= &end[..])
        })?;
        self.load_entries(ctx, keys, 8)
    }

    /// Every entry in the context (unordered)
    pub fn entries(&self, ctx: StorageContext) -> Result<Vec<LedgerEntry>> {
        self.scan_values(ctx, Table::Entries)
    }

    fn load_entries(
        &self,
        ctx: StorageContext,
        keys: Vec<Box<[u8]>>,
        id_offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let entry_id = EntryId::from_uuid(uuid_at(&key, id_offset)?);
            let entry = self.entry(ctx, entry_id)?.ok_or_else(|| {
                Error::Corruption(format!("Index references missing entry {}", entry_id))
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    // Category operations

    /// Get category by ID
    pub fn category(&self, ctx: StorageContext, id: CategoryId) -> Result<Option<Category>> {
        self.get(ctx, Table::Categories, id.as_bytes())
    }

    /// Get category by ID, failing with `CategoryNotFound`
    pub fn require_category(&self, ctx: StorageContext, id: CategoryId) -> Result<Category> {
        self.category(ctx, id)?
            .ok_or_else(|| Error::CategoryNotFound(format!("{} ({})", id, ctx)))
    }

    /// All categories in the context
    pub fn categories(&self, ctx: StorageContext) -> Result<Vec<Category>> {
        self.scan_values(ctx, Table::Categories)
    }

    // Batch operations (atomic)

    /// Start an atomic unit of work against one context
    pub fn batch(&self, ctx: StorageContext) -> StoreBatch<'_> {
        StoreBatch {
            storage: self,
            ctx,
            batch: WriteBatch::default(),
            error: None,
        }
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        self.db.flush()?;
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

/// Staged writes that commit together or not at all
pub struct StoreBatch<'a> {
    storage: &'a Storage,
    ctx: StorageContext,
    batch: WriteBatch,
    error: Option<Error>,
}

impl<'a> StoreBatch<'a> {
    fn put<T: Serialize>(&mut self, table: Table, key: &[u8], value: &T) {
        if self.error.is_some() {
            return;
        }
        let staged = self
            .storage
            .cf(self.ctx, table)
            .and_then(|cf| Ok((cf, bincode::serialize(value)?)));
        match staged {
            Ok((cf, bytes)) => self.batch.put_cf(cf, key, bytes),
            Err(e) => self.error = Some(e),
        }
    }

    fn put_marker(&mut self, table: Table, key: &[u8]) {
        if self.error.is_some() {
            return;
        }
        match self.storage.cf(self.ctx, table) {
            Ok(cf) => self.batch.put_cf(cf, key, b""),
            Err(e) => self.error = Some(e),
        }
    }

    fn delete(&mut self, table: Table, key: &[u8]) {
        if self.error.is_some() {
            return;
        }
        match self.storage.cf(self.ctx, table) {
            Ok(cf) => self.batch.delete_cf(cf, key),
            Err(e) => self.error = Some(e),
        }
    }

    /// Stage root record
    pub fn put_root(&mut self, root: &RootAccount) {
        self.put(Table::Roots, root.id.as_bytes(), root);
    }

    /// Stage root removal
    pub fn delete_root(&mut self, root_id: RootId) {
        self.delete(Table::Roots, root_id.as_bytes());
    }

    /// Stage leaf record and its root index
    pub fn put_leaf(&mut self, leaf: &LeafAccount) {
        self.put(Table::Leaves, leaf.id.as_bytes(), leaf);
        self.put_marker(Table::RootLeaves, &pair_key(leaf.root_id.as_bytes(), leaf.id.as_bytes()));
    }

    /// Stage leaf removal and its root index
    pub fn delete_leaf(&mut self, leaf: &LeafAccount) {
        self.delete(Table::Leaves, leaf.id.as_bytes());
        self.delete(Table::RootLeaves, &pair_key(leaf.root_id.as_bytes(), leaf.id.as_bytes()));
    }

    /// Stage entry record and its indices
    pub fn put_entry(&mut self, entry: &LedgerEntry) {
        self.put(Table::Entries, entry.id.as_bytes(), entry);
        self.put_marker(Table::LeafEntries, &leaf_entry_key(entry));
        self.put_marker(
            Table::Timeline,
            &pair_key(&time_key(entry.timestamp_millis), entry.id.as_bytes()),
        );
    }

    /// Stage entry removal and its indices
    pub fn delete_entry(&mut self, entry: &LedgerEntry) {
        self.delete(Table::Entries, entry.id.as_bytes());
        self.delete(Table::LeafEntries, &leaf_entry_key(entry));
        self.delete(
            Table::Timeline,
            &pair_key(&time_key(entry.timestamp_millis), entry.id.as_bytes()),
        );
    }

    /// Stage category record
    pub fn put_category(&mut self, category: &Category) {
        self.put(Table::Categories, category.id.as_bytes(), category);
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    /// Whether nothing has been staged
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// Atomic commit
    pub fn commit(self) -> Result<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let ops = self.batch.len();
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.storage.sync_writes);
        self.storage.db.write_opt(self.batch, &write_opts)?;
        tracing::trace!(ctx = %self.ctx, ops, "Batch committed");
        Ok(())
    }
}

/// Re-runs a unit of work whose commit failed
///
/// A failed `WriteBatch` leaves nothing behind, and every unit re-reads its
/// inputs under lock, so re-running it is safe.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
    metrics: Metrics,
}

impl RetryPolicy {
    /// Create a policy
    pub fn new(max_retries: u32, backoff: Duration, metrics: Metrics) -> Self {
        Self {
            max_retries,
            backoff,
            metrics,
        }
    }

    /// Run `unit`, retrying while it fails with a retryable error
    pub fn run<T>(&self, operation: &str, mut unit: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 0u32;
        loop {
            match unit() {
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    self.metrics.record_store_retry();
                    tracing::warn!(operation, attempt, error = %e, "Commit failed, retrying");
                    std::thread::sleep(self.backoff * attempt);
                }
                Err(e) if e.is_retryable() => {
                    tracing::error!(operation, attempts = attempt + 1, error = %e, "Commit failed, giving up");
                    return Err(e);
                }
                other => return other,
            }
        }
    }
}

// Key helpers

/// Order-preserving encoding of a signed timestamp
fn time_key(timestamp_millis: i64) -> [u8; 8] {
    ((timestamp_millis as u64) ^ (1u64 << 63)).to_be_bytes()
}

fn pair_key(first: &[u8], second: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(first.len() + second.len());
    key.extend_from_slice(first);
    key.extend_from_slice(second);
    key
}

fn leaf_entry_key(entry: &LedgerEntry) -> Vec<u8> {
    let mut key = pair_key(entry.leaf_id.as_bytes(), &time_key(entry.timestamp_millis));
    key.extend_from_slice(entry.id.as_bytes());
    key
}

fn uuid_at(key: &[u8], offset: usize) -> Result<uuid::Uuid> {
    let bytes: [u8; 16] = key
        .get(offset..offset + 16)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| Error::Corruption(format!("Malformed index key of {} bytes", key.len())))?;
    Ok(uuid::Uuid::from_bytes(bytes))
}
