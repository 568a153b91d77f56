use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::{normalizer::NormalizedTransaction, BlockHeight, TransactionWindow};

/// First block of a trailing window of `size` blocks ending at `height`, never below 1.
pub fn window_floor(height: BlockHeight, size: BlockHeight) -> BlockHeight {
    height.saturating_sub(size.saturating_sub(1)).max(1)
}

#[test]
fn test_window_floor() {
    assert_eq!(window_floor(250, 100), 151);
    assert_eq!(window_floor(100, 100), 1);
    assert_eq!(window_floor(42, 100), 1);
    assert_eq!(window_floor(0, 100), 1);
    assert_eq!(window_floor(0, 0), 1);
    assert_eq!(window_floor(7, 0), 7);
    assert_eq!(window_floor(7, 1), 7);
    assert_eq!(window_floor(BlockHeight::MAX, BlockHeight::MAX), 1);
    for height in 0..300 {
        for size in 0..300 {
            assert!(window_floor(height, size) >= 1);
        }
    }
}

/// Aggregates over one transaction window, recomputed from scratch for every window.
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct WindowStats {
    pub transaction_count: usize,
    /// Lowest and highest block that actually carried a transaction.
    pub block_range: Option<(BlockHeight, BlockHeight)>,
    /// Number of transactions per `extrinsic.name`.
    pub extrinsic_types: BTreeMap<String, usize>,
    /// Distinct senders. Transactions without a known sender don't count as an account.
    pub active_accounts: usize,
    /// `extrinsic.name` -> sender -> number of transactions.
    pub active_accounts_by_type: BTreeMap<String, BTreeMap<String, usize>>,
}

impl WindowStats {
    pub fn from_transactions(transactions: &[NormalizedTransaction]) -> Self {
        let mut extrinsic_types = BTreeMap::<String, usize>::new();
        let mut accounts = BTreeSet::<&str>::new();
        let mut active_accounts_by_type = BTreeMap::<String, BTreeMap<String, usize>>::new();
        for transaction in transactions {
            *extrinsic_types
                .entry(transaction.extrinsic.name.clone())
                .or_default() += 1;
            if let Some(sender) = &transaction.sender {
                accounts.insert(sender);
                *active_accounts_by_type
                    .entry(transaction.extrinsic.name.clone())
                    .or_default()
                    .entry(sender.clone())
                    .or_default() += 1;
            }
        }
        let block_range = transactions
            .iter()
            .map(|transaction| transaction.block)
            .min()
            .zip(transactions.iter().map(|transaction| transaction.block).max());
        Self {
            transaction_count: transactions.len(),
            block_range,
            extrinsic_types,
            active_accounts: accounts.len(),
            active_accounts_by_type,
        }
    }

    pub fn from_window(window: &TransactionWindow) -> Self {
        Self::from_transactions(&window.transactions)
    }

    pub fn extrinsic_type_count(&self) -> usize {
        self.extrinsic_types.len()
    }
}

#[cfg(test)]
fn transaction(block: BlockHeight, name: &str, sender: Option<&str>) -> NormalizedTransaction {
    use crate::normalizer::{Extrinsic, ExtrinsicValue};

    NormalizedTransaction {
        block,
        hash: format!("{name}-{block}"),
        sender: sender.map(str::to_string),
        extrinsic: Extrinsic {
            name: name.to_string(),
            value: ExtrinsicValue::Empty {},
        },
    }
}

#[test]
fn test_window_stats() {
    let transactions = vec![
        transaction(12, "MsgCall", Some("g1alice")),
        transaction(12, "MsgCall", Some("g1bob")),
        transaction(11, "BankMsgSend", Some("g1alice")),
        transaction(10, "MsgCall", Some("g1alice")),
        transaction(9, "MsgStake", None),
    ];
    let stats = WindowStats::from_transactions(&transactions);
    assert_eq!(stats.transaction_count, 5);
    assert_eq!(stats.block_range, Some((9, 12)));
    assert_eq!(stats.extrinsic_type_count(), 3);
    assert_eq!(stats.extrinsic_types["MsgCall"], 3);
    assert_eq!(stats.extrinsic_types["BankMsgSend"], 1);
    assert_eq!(stats.extrinsic_types["MsgStake"], 1);
    assert_eq!(
        stats.extrinsic_types.values().sum::<usize>(),
        stats.transaction_count
    );
    assert_eq!(stats.active_accounts, 2);
    assert_eq!(stats.active_accounts_by_type["MsgCall"]["g1alice"], 2);
    assert_eq!(stats.active_accounts_by_type["MsgCall"]["g1bob"], 1);
    assert_eq!(stats.active_accounts_by_type["BankMsgSend"]["g1alice"], 1);
    assert!(!stats.active_accounts_by_type.contains_key("MsgStake"));
}

#[test]
fn test_histogram_sums_to_window_length() {
    let names = ["BankMsgSend", "MsgAddPackage", "MsgCall", "MsgRun", "MsgOther"];
    for distinct in 1..=names.len() {
        let transactions = (0..40)
            .map(|i| transaction(i, names[i as usize % distinct], Some("g1someone")))
            .collect::<Vec<_>>();
        let stats = WindowStats::from_transactions(&transactions);
        assert_eq!(stats.extrinsic_types.len(), distinct);
        assert_eq!(stats.extrinsic_types.values().sum::<usize>(), 40);
    }
}

#[test]
fn test_empty_window_stats() {
    let stats = WindowStats::from_transactions(&[]);
    assert_eq!(stats, WindowStats::default());
    assert_eq!(stats.block_range, None);
}
