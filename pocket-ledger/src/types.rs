//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for money)
//! - One engine over two isolated account universes ([`StorageContext`])

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new time-ordered identifier
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Wrap an existing UUID
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Underlying UUID
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }

            /// Key bytes used by the store
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Root account identifier
    RootId
);
id_type!(
    /// Leaf account identifier
    LeafId
);
id_type!(
    /// Ledger entry identifier
    EntryId
);
id_type!(
    /// Category identifier
    CategoryId
);
id_type!(
    /// Links the two legs of a compensating transfer
    TransferId
);

/// Which account universe an operation addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StorageContext {
    /// The everyday account hierarchy
    Visible,
    /// The privacy-gated vault hierarchy
    Hidden,
}

impl StorageContext {
    /// Both contexts, in reconciliation order
    pub const ALL: [StorageContext; 2] = [StorageContext::Visible, StorageContext::Hidden];

    /// Short name for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageContext::Visible => "visible",
            StorageContext::Hidden => "hidden",
        }
    }
}

impl fmt::Display for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Money in
    Credit,
    /// Money out
    Debit,
}

impl Direction {
    /// Apply the direction's sign to a magnitude
    pub fn signed(&self, magnitude: Decimal) -> Decimal {
        match self {
            Direction::Credit => magnitude,
            Direction::Debit => -magnitude,
        }
    }
}

/// Classification tag; no balance effect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    /// Category ID
    pub id: CategoryId,
    /// Short label
    pub label: String,
    /// Longer description
    pub description: String,
}

/// Top-level aggregate account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootAccount {
    /// Root ID
    pub id: RootId,
    /// Display name
    pub name: String,
    /// Icon reference, resolved by the presentation layer
    pub icon_ref: String,
    /// Cached sum of the leaves' balances
    pub balance: Decimal,
}

impl RootAccount {
    /// New root with zero balance
    pub fn new(name: impl Into<String>, icon_ref: impl Into<String>) -> Self {
        Self {
            id: RootId::new(),
            name: name.into(),
            icon_ref: icon_ref.into(),
            balance: Decimal::ZERO,
        }
    }
}

/// Child account holding its own entries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafAccount {
    /// Leaf ID
    pub id: LeafId,
    /// Owning root (never changes)
    pub root_id: RootId,
    /// Display name
    pub name: String,
    /// Icon reference, resolved by the presentation layer
    pub icon_ref: String,
    /// Cached sum of the leaf's signed entries
    pub balance: Decimal,
}

impl LeafAccount {
    /// New leaf with zero balance
    pub fn new(root_id: RootId, name: impl Into<String>, icon_ref: impl Into<String>) -> Self {
        Self {
            id: LeafId::new(),
            root_id,
            name: name.into(),
            icon_ref: icon_ref.into(),
            balance: Decimal::ZERO,
        }
    }
}

/// A single signed monetary record attached to one leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Entry ID
    pub id: EntryId,
    /// Owning root, always equal to the leaf's root
    pub root_id: RootId,
    /// Owning leaf
    pub leaf_id: LeafId,
    /// Optional classification
    pub category_id: Option<CategoryId>,
    /// Free text
    pub description: String,
    /// Strictly positive amount
    pub magnitude: Decimal,
    /// Credit or debit
    pub direction: Direction,
    /// Milliseconds since Unix epoch
    pub timestamp_millis: i64,
    /// Set on both legs of a compensating transfer
    pub transfer_id: Option<TransferId>,
}

impl LedgerEntry {
    /// Signed contribution to the leaf balance
    pub fn signed_amount(&self) -> Decimal {
        self.direction.signed(self.magnitude)
    }
}

/// Request to post an entry against a leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    /// Target leaf
    pub leaf_id: LeafId,
    /// Strictly positive amount
    pub magnitude: Decimal,
    /// Credit or debit
    pub direction: Direction,
    /// Free text
    pub description: String,
    /// Optional classification
    pub category_id: Option<CategoryId>,
    /// Occurrence time; defaults to now
    pub occurred_at_millis: Option<i64>,
}

impl NewEntry {
    /// Credit request timestamped now
    pub fn credit(leaf_id: LeafId, magnitude: Decimal, description: impl Into<String>) -> Self {
        Self::with_direction(leaf_id, magnitude, Direction::Credit, description)
    }

    /// Debit request timestamped now
    pub fn debit(leaf_id: LeafId, magnitude: Decimal, description: impl Into<String>) -> Self {
        Self::with_direction(leaf_id, magnitude, Direction::Debit, description)
    }

    fn with_direction(
        leaf_id: LeafId,
        magnitude: Decimal,
        direction: Direction,
        description: impl Into<String>,
    ) -> Self {
        Self {
            leaf_id,
            magnitude,
            direction,
            description: description.into(),
            category_id: None,
            occurred_at_millis: None,
        }
    }

    /// Attach a category
    pub fn with_category(mut self, category_id: CategoryId) -> Self {
        self.category_id = Some(category_id);
        self
    }

    /// Set the occurrence time
    pub fn at(mut self, timestamp_millis: i64) -> Self {
        self.occurred_at_millis = Some(timestamp_millis);
        self
    }

    /// Materialize the entry for a leaf
    pub(crate) fn into_entry(self, root_id: RootId) -> LedgerEntry {
        LedgerEntry {
            id: EntryId::new(),
            root_id,
            leaf_id: self.leaf_id,
            category_id: self.category_id,
            description: self.description,
            magnitude: self.magnitude,
            direction: self.direction,
            timestamp_millis: self
                .occurred_at_millis
                .unwrap_or_else(|| Utc::now().timestamp_millis()),
            transfer_id: None,
        }
    }
}

/// Replacement values for an existing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryEdit {
    /// New strictly positive amount
    pub magnitude: Decimal,
    /// New direction; `None` keeps the current one
    pub direction: Option<Direction>,
    /// New description
    pub description: String,
}

/// Outcome of a posting attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// The entry was inserted and balances updated
    Committed(EntryId),
    /// Nothing was written; the leaf lacks `shortfall`
    InsufficientFunds {
        /// Amount the leaf is short by
        shortfall: Decimal,
    },
}

impl PostOutcome {
    /// Entry ID when committed
    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            PostOutcome::Committed(id) => Some(*id),
            PostOutcome::InsufficientFunds { .. } => None,
        }
    }
}

/// Outcome of an entry edit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// Entry, leaf and root were updated
    Applied,
    /// Nothing was written; the edit would overdraw the leaf by `shortfall`
    InsufficientFunds {
        /// Amount the leaf is short by
        shortfall: Decimal,
    },
}

/// Request to cover a shortfall on `source_leaf_id` from another leaf
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    /// Leaf receiving the funds
    pub source_leaf_id: LeafId,
    /// Amount to move
    pub required_amount: Decimal,
    /// Free text, annotated on both legs
    pub description: String,
}

/// Both legs of a committed compensating transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    /// Shared link between the legs
    pub transfer_id: TransferId,
    /// Debit entry on the target leaf
    pub debit_entry_id: EntryId,
    /// Credit entry on the source leaf
    pub credit_entry_id: EntryId,
    /// Leaf the funds were taken from
    pub target_leaf_id: LeafId,
    /// Whether the legs live under different roots
    pub cross_root: bool,
}

/// Why a transfer resolution did not commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// No other leaf holds the required amount
    NoCandidates,
    /// The selector declined every candidate
    Declined,
    /// The chosen target cannot cover the amount (or is the source itself)
    TargetNotEligible,
}

/// Outcome of a transfer resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Both legs committed
    Committed(TransferReceipt),
    /// Nothing was written
    Aborted(AbortReason),
}

/// Picks the target leaf among transfer candidates
pub enum TargetSelector {
    /// The caller already chose a leaf (usually after showing the candidates);
    /// a leaf that cannot cover the amount aborts as not eligible
    Leaf(LeafId),
    /// Take the candidate with the highest balance
    HighestBalance,
    /// Arbitrary policy; returning `None` declines
    Custom(Box<dyn FnOnce(&[LeafAccount]) -> Option<LeafId> + Send>),
}

impl TargetSelector {
    /// Choose among candidates
    pub fn select(self, candidates: &[LeafAccount]) -> Option<LeafId> {
        match self {
            // Eligibility is checked under lock when the transfer commits
            TargetSelector::Leaf(id) => Some(id),
            TargetSelector::HighestBalance => candidates
                .iter()
                .max_by(|a, b| a.balance.cmp(&b.balance))
                .map(|c| c.id),
            TargetSelector::Custom(select) => select(candidates),
        }
    }
}

impl fmt::Debug for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::Leaf(id) => f.debug_tuple("Leaf").field(id).finish(),
            TargetSelector::HighestBalance => f.write_str("HighestBalance"),
            TargetSelector::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Capabilities shared by both account kinds
pub trait AccountView {
    /// Raw identifier
    fn uuid(&self) -> Uuid;
    /// Display name
    fn name(&self) -> &str;
    /// Icon reference
    fn icon_ref(&self) -> &str;
    /// Cached balance
    fn balance(&self) -> Decimal;

    /// Name must be non-empty
    fn validate(&self) -> crate::Result<()> {
        validate_name(self.name())
    }
}

impl AccountView for RootAccount {
    fn uuid(&self) -> Uuid {
        self.id.as_uuid()
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn icon_ref(&self) -> &str {
        &self.icon_ref
    }
    fn balance(&self) -> Decimal {
        self.balance
    }
}

impl AccountView for LeafAccount {
    fn uuid(&self) -> Uuid {
        self.id.as_uuid()
    }
    fn name(&self) -> &str {
        &self.name
    }
    fn icon_ref(&self) -> &str {
        &self.icon_ref
    }
    fn balance(&self) -> Decimal {
        self.balance
    }
}

/// Either account kind, for flows that edit or delete "an account"
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Account {
    /// A root account
    Root(RootAccount),
    /// A leaf account
    Leaf(LeafAccount),
}

impl Account {
    /// Reference used by lifecycle operations
    pub fn account_ref(&self) -> AccountRef {
        match self {
            Account::Root(root) => AccountRef::Root(root.id),
            Account::Leaf(leaf) => AccountRef::Leaf(leaf.id),
        }
    }

    fn view(&self) -> &dyn AccountView {
        match self {
            Account::Root(root) => root,
            Account::Leaf(leaf) => leaf,
        }
    }
}

impl AccountView for Account {
    fn uuid(&self) -> Uuid {
        self.view().uuid()
    }
    fn name(&self) -> &str {
        self.view().name()
    }
    fn icon_ref(&self) -> &str {
        self.view().icon_ref()
    }
    fn balance(&self) -> Decimal {
        self.view().balance()
    }
}

/// Typed reference to either account kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccountRef {
    /// A root account
    Root(RootId),
    /// A leaf account
    Leaf(LeafId),
}

/// Name/icon changes; balances are never patched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountPatch {
    /// New name
    pub name: Option<String>,
    /// New icon reference
    pub icon_ref: Option<String>,
}

impl AccountPatch {
    /// Rename only
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            icon_ref: None,
        }
    }

    /// Apply to any account kind, validating the resulting name
    pub(crate) fn apply(&self, name: &mut String, icon_ref: &mut String) -> crate::Result<()> {
        if let Some(new_name) = &self.name {
            validate_name(new_name)?;
            *name = new_name.trim().to_string();
        }
        if let Some(new_icon) = &self.icon_ref {
            *icon_ref = new_icon.clone();
        }
        Ok(())
    }
}

/// Reject empty or whitespace-only names
pub fn validate_name(name: &str) -> crate::Result<()> {
    if name.trim().is_empty() {
        return Err(crate::Error::ValidationFailed(
            "Name must not be empty".to_string(),
        ));
    }
    Ok(())
}

/// Reject zero and negative amounts
pub fn validate_magnitude(magnitude: Decimal) -> crate::Result<()> {
    if magnitude <= Decimal::ZERO {
        return Err(crate::Error::ValidationFailed(format!(
            "Amount must be positive, got {}",
            magnitude
        )));
    }
    Ok(())
}
