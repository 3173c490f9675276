//! Property-based tests for ledger invariants
//!
//! These tests use proptest to drive random operation sequences and verify:
//! - Leaf balances equal the sum of their entries
//! - Root balances equal the sum of their leaves
//! - Reconciliation is idempotent
//! - Transfers conserve the total across leaves
//! - Posting alone never drives a leaf negative
//! - Deleting a leaf leaves no trace of it

use pocket_ledger::{
    Config, Direction, EditOutcome, EntryEdit, EntryId, LeafId, Ledger, NewEntry, PostOutcome,
    RootId, StorageContext, TargetSelector, TransferOutcome, TransferRequest,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use rust_decimal::Decimal;
use tempfile::TempDir;

const CTX: StorageContext = StorageContext::Visible;

/// Strategy for generating valid amounts (positive, two decimals)
fn amount_strategy() -> impl Strategy<Value = Decimal> {
    (1i64..20_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn direction_strategy() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Credit), Just(Direction::Debit)]
}

#[derive(Debug, Clone)]
enum Op {
    Post {
        leaf: usize,
        amount: Decimal,
        direction: Direction,
    },
    Edit {
        entry: usize,
        amount: Decimal,
        direction: Direction,
    },
    DeleteEntry {
        entry: usize,
    },
    Transfer {
        source: usize,
        amount: Decimal,
    },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..4, amount_strategy(), direction_strategy())
            .prop_map(|(leaf, amount, direction)| Op::Post { leaf, amount, direction }),
        2 => (any::<usize>(), amount_strategy(), direction_strategy())
            .prop_map(|(entry, amount, direction)| Op::Edit { entry, amount, direction }),
        1 => any::<usize>().prop_map(|entry| Op::DeleteEntry { entry }),
        2 => (0usize..4, amount_strategy()).prop_map(|(source, amount)| Op::Transfer { source, amount }),
    ]
}

/// Two roots with two leaves each; leaves 0,1 under the first root
struct World {
    ledger: Ledger,
    roots: [RootId; 2],
    leaves: [LeafId; 4],
    entries: Vec<EntryId>,
    _dir: TempDir,
}

async fn create_world(opening: [u32; 4]) -> World {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.data_dir = dir.path().to_path_buf();
    config.rocksdb.sync_writes = false;
    config.reconcile.on_open = false;
    let ledger = Ledger::open(config).await.unwrap();

    let home = ledger.create_root(CTX, "Home", "house").await.unwrap();
    let work = ledger.create_root(CTX, "Work", "briefcase").await.unwrap();
    let mut leaves = [LeafId::new(); 4];
    for (i, leaf) in leaves.iter_mut().enumerate() {
        let root = if i < 2 { home } else { work };
        *leaf = ledger
            .create_leaf(CTX, root, format!("Leaf {}", i), "wallet", Decimal::from(opening[i]))
            .await
            .unwrap();
    }

    World {
        ledger,
        roots: [home, work],
        leaves,
        entries: Vec::new(),
        _dir: dir,
    }
}

async fn apply(world: &mut World, op: Op) -> Result<(), TestCaseError> {
    let ledger = &world.ledger;
    match op {
        Op::Post {
            leaf,
            amount,
            direction,
        } => {
            let leaf_id = world.leaves[leaf];
            let before = ledger.leaf(CTX, leaf_id).unwrap().balance;
            let request = NewEntry {
                direction,
                ..NewEntry::credit(leaf_id, amount, "random")
            };
            match ledger.post_entry(CTX, request).await.unwrap() {
                PostOutcome::Committed(id) => {
                    world.entries.push(id);
                    let after = ledger.leaf(CTX, leaf_id).unwrap().balance;
                    prop_assert_eq!(after, before + direction.signed(amount));
                    if direction == Direction::Debit {
                        prop_assert!(after >= Decimal::ZERO);
                    }
                }
                PostOutcome::InsufficientFunds { shortfall } => {
                    prop_assert_eq!(direction, Direction::Debit);
                    prop_assert_eq!(shortfall, amount - before);
                    prop_assert_eq!(ledger.leaf(CTX, leaf_id).unwrap().balance, before);
                }
            }
        }
        Op::Edit {
            entry,
            amount,
            direction,
        } => {
            if world.entries.is_empty() {
                return Ok(());
            }
            let entry_id = world.entries[entry % world.entries.len()];
            let edit = EntryEdit {
                magnitude: amount,
                direction: Some(direction),
                description: "edited".to_string(),
            };
            let leaf_id = ledger.entry(CTX, entry_id).unwrap().leaf_id;
            let before = ledger.leaf(CTX, leaf_id).unwrap().balance;
            match ledger.edit_entry(CTX, entry_id, edit).await.unwrap() {
                EditOutcome::Applied => {}
                EditOutcome::InsufficientFunds { shortfall } => {
                    prop_assert!(shortfall > Decimal::ZERO);
                    prop_assert_eq!(ledger.leaf(CTX, leaf_id).unwrap().balance, before);
                }
            }
        }
        Op::DeleteEntry { entry } => {
            if world.entries.is_empty() {
                return Ok(());
            }
            let entry_id = world.entries.remove(entry % world.entries.len());
            ledger.delete_entry(CTX, entry_id).await.unwrap();
        }
        Op::Transfer { source, amount } => {
            let total_before = ledger.total_leaf_balance(CTX).unwrap();
            let roots_before: Decimal = world
                .roots
                .iter()
                .map(|id| ledger.root(CTX, *id).unwrap().balance)
                .sum();

            let request = TransferRequest {
                source_leaf_id: world.leaves[source],
                required_amount: amount,
                description: "cover".to_string(),
            };
            let outcome = ledger
                .resolve_insufficient_funds(CTX, request, TargetSelector::HighestBalance)
                .await
                .unwrap();
            if let TransferOutcome::Committed(receipt) = outcome {
                world.entries.push(receipt.debit_entry_id);
                world.entries.push(receipt.credit_entry_id);
            }

            prop_assert_eq!(ledger.total_leaf_balance(CTX).unwrap(), total_before);
            let roots_after: Decimal = world
                .roots
                .iter()
                .map(|id| ledger.root(CTX, *id).unwrap().balance)
                .sum();
            prop_assert_eq!(roots_after, roots_before);
        }
    }
    Ok(())
}

fn check_consistency(world: &World) -> Result<(), TestCaseError> {
    for leaf_id in world.leaves {
        let leaf = world.ledger.leaf(CTX, leaf_id).unwrap();
        let summed: Decimal = world
            .ledger
            .entries_of_leaf(CTX, leaf_id)
            .unwrap()
            .iter()
            .map(|e| e.signed_amount())
            .sum();
        prop_assert_eq!(leaf.balance, summed);
    }
    for root_id in world.roots {
        let root = world.ledger.root(CTX, root_id).unwrap();
        let summed: Decimal = world
            .ledger
            .leaves_of(CTX, root_id)
            .unwrap()
            .iter()
            .map(|l| l.balance)
            .sum();
        prop_assert_eq!(root.balance, summed);
        prop_assert_eq!(
            world.ledger.audit_root_from_entries(CTX, root_id).unwrap(),
            root.balance
        );
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Property: cached balances always match entries and leaves
    #[test]
    fn prop_balances_stay_consistent(
        opening in prop::array::uniform4(0u32..200),
        ops in prop::collection::vec(op_strategy(), 1..30),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut world = create_world(opening).await;
            for op in ops {
                apply(&mut world, op).await?;
            }
            check_consistency(&world)?;

            // Recomputation finds nothing to repair and agrees with the cache
            for leaf_id in world.leaves {
                let cached = world.ledger.leaf(CTX, leaf_id).unwrap().balance;
                prop_assert_eq!(world.ledger.recompute_leaf(CTX, leaf_id).await.unwrap(), cached);
            }
            for root_id in world.roots {
                let cached = world.ledger.root(CTX, root_id).unwrap().balance;
                prop_assert_eq!(world.ledger.recompute_root(CTX, root_id).await.unwrap(), cached);
            }

            let World { ledger, _dir, .. } = world;
            ledger.shutdown().unwrap();
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Property: reconciliation is idempotent
    #[test]
    fn prop_reconcile_twice_is_stable(
        opening in prop::array::uniform4(0u32..200),
        ops in prop::collection::vec(op_strategy(), 1..20),
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut world = create_world(opening).await;
            for op in ops {
                apply(&mut world, op).await?;
            }

            let first = world.ledger.reconcile().await.unwrap();
            let balances: Vec<Decimal> = world
                .ledger
                .leaves(CTX)
                .unwrap()
                .iter()
                .map(|l| l.balance)
                .collect();
            let second = world.ledger.reconcile().await.unwrap();
            let again: Vec<Decimal> = world
                .ledger
                .leaves(CTX)
                .unwrap()
                .iter()
                .map(|l| l.balance)
                .collect();

            prop_assert!(first.is_success());
            prop_assert!(first.drifts.is_empty());
            prop_assert!(second.drifts.is_empty());
            prop_assert_eq!(first.leaves_checked, 4);
            prop_assert_eq!(first.roots_checked, 2);
            prop_assert_eq!(balances, again);

            let World { ledger, _dir, .. } = world;
            ledger.shutdown().unwrap();
            Ok::<(), TestCaseError>(())
        })?;
    }

    /// Property: deleting a leaf removes its entries and its share of the root
    #[test]
    fn prop_delete_leaf_leaves_no_trace(
        opening in prop::array::uniform4(0u32..200),
        ops in prop::collection::vec(op_strategy(), 0..15),
        victim in 0usize..4,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let mut world = create_world(opening).await;
            for op in ops {
                apply(&mut world, op).await?;
            }

            let leaf_id = world.leaves[victim];
            let root_id = world.roots[victim / 2];
            world.ledger.delete_leaf(CTX, leaf_id).await.unwrap();

            prop_assert!(world.ledger.leaf(CTX, leaf_id).unwrap_err().is_not_found());
            prop_assert!(world.ledger.entries_of_leaf(CTX, leaf_id).unwrap().is_empty());
            let all = world.ledger.entries_between(CTX, i64::MIN, i64::MAX).unwrap();
            prop_assert!(all.iter().all(|e| e.leaf_id != leaf_id));

            let remaining: Decimal = world
                .ledger
                .leaves_of(CTX, root_id)
                .unwrap()
                .iter()
                .map(|l| l.balance)
                .sum();
            prop_assert_eq!(world.ledger.root(CTX, root_id).unwrap().balance, remaining);

            let World { ledger, _dir, .. } = world;
            ledger.shutdown().unwrap();
            Ok::<(), TestCaseError>(())
        })?;
    }
}
