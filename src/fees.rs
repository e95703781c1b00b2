//! Deterministic fee model shared by validators and the contract scheduler.
//!
//! Every confidant must derive identical fees from identical inputs, so the
//! model is a pure function of transaction bytes and reported execution cost.

use crate::types::{Pool, Transaction};

/// Flat component charged for any transaction.
pub const BASE_FEE: u64 = 10;
/// Charged per serialized byte.
pub const FEE_PER_BYTE: u64 = 1;
/// Conversion from executor-reported cost units.
pub const FEE_PER_COST_UNIT: u64 = 2;

pub fn counted_fee(transaction: &Transaction) -> u64 {
    BASE_FEE.saturating_add((transaction.signing_bytes().len() as u64).saturating_mul(FEE_PER_BYTE))
}

/// Recomputes the counted fee of every transaction still marked valid.
pub fn set_transactions_fees(transactions: &mut [Transaction], mask: &[u8]) {
    for (index, transaction) in transactions.iter_mut().enumerate() {
        if mask.get(index).copied().unwrap_or(0) != 0 {
            transaction.counted_fee = counted_fee(transaction);
        }
    }
}

/// Fee a running contract accrues for one block while it occupies the queue:
/// the sum of counted fees in that block.
pub fn round_fee(block: &Pool) -> u64 {
    block
        .transactions()
        .iter()
        .fold(0u64, |acc, tx| acc.saturating_add(tx.counted_fee))
}

pub fn execution_fee(cost_units: u64) -> u64 {
    cost_units.saturating_mul(FEE_PER_COST_UNIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Address, PoolHash};

    #[test]
    fn counted_fee_is_deterministic_and_size_bound() {
        let small = Transaction::new(1, Address::Id(1), Address::Id(2), 1, 10, 100);
        let mut large = small.clone();
        large.add_user_field(5, crate::types::UserFieldValue::Bytes(vec![0u8; 128]));
        assert_eq!(counted_fee(&small), counted_fee(&small));
        assert!(counted_fee(&large) > counted_fee(&small));
    }

    #[test]
    fn masked_out_transactions_keep_their_fee() {
        let mut txs = vec![
            Transaction::new(1, Address::Id(1), Address::Id(2), 1, 10, 100),
            Transaction::new(2, Address::Id(1), Address::Id(2), 1, 10, 100),
        ];
        set_transactions_fees(&mut txs, &[1, 0]);
        assert_eq!(txs[0].counted_fee, counted_fee(&txs[0]));
        assert_eq!(txs[1].counted_fee, 0);
    }

    #[test]
    fn round_fee_sums_counted_fees() {
        let mut pool = Pool::new(1, PoolHash::EMPTY);
        let mut a = Transaction::new(1, Address::Id(1), Address::Id(2), 1, 10, 100);
        a.counted_fee = 7;
        let mut b = Transaction::new(2, Address::Id(1), Address::Id(2), 1, 10, 100);
        b.counted_fee = 5;
        pool.add_transaction(a);
        pool.add_transaction(b);
        assert_eq!(round_fee(&pool), 12);
    }
}
