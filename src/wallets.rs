use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::warn;

use crate::crypto::PublicKeyBytes;
use crate::types::{Address, Pool, Transaction, TransactionId, WalletId};

/// Last-known state of a wallet derived from committed blocks.
#[derive(Clone, Debug, Default)]
pub struct WalletData {
    pub id: Option<WalletId>,
    pub balance: u128,
    /// Tail of the wallet's transaction history (source or target side).
    pub last_transaction: Option<TransactionId>,
    /// Highest inner id this wallet has used as a source.
    pub last_inner_id: u64,
}

#[derive(Default)]
struct CacheState {
    wallets: HashMap<PublicKeyBytes, WalletData>,
    by_id: HashMap<WalletId, PublicKeyBytes>,
    next_id: WalletId,
}

/// Mapping address → wallet tail. Updated exclusively from the block
/// read/store path; everyone else reads.
#[derive(Default)]
pub struct WalletsCache {
    state: RwLock<CacheState>,
}

impl WalletsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves an address to its public-key (absolute) form.
    pub fn resolve(&self, address: &Address) -> Option<PublicKeyBytes> {
        match address {
            Address::Key(key) => Some(*key),
            Address::Id(id) => self.state.read().by_id.get(id).copied(),
        }
    }

    pub fn wallet_id(&self, address: &Address) -> Option<WalletId> {
        match address {
            Address::Id(id) => Some(*id),
            Address::Key(key) => self
                .state
                .read()
                .wallets
                .get(key)
                .and_then(|wallet| wallet.id),
        }
    }

    pub fn data(&self, address: &Address) -> Option<WalletData> {
        let key = self.resolve(address)?;
        self.state.read().wallets.get(&key).cloned()
    }

    pub fn balance(&self, address: &Address) -> Option<u128> {
        self.data(address).map(|wallet| wallet.balance)
    }

    /// Next unused inner id for transactions originated by this wallet.
    pub fn next_inner_id(&self, address: &Address) -> u64 {
        self.data(address)
            .map(|wallet| wallet.last_inner_id + 1)
            .unwrap_or(1)
    }

    /// Balance snapshot used by the validator to replay a candidate round.
    pub fn balances_snapshot(&self) -> HashMap<PublicKeyBytes, u128> {
        self.state
            .read()
            .wallets
            .iter()
            .map(|(key, wallet)| (*key, wallet.balance))
            .collect()
    }

    /// Applies every transaction of a committed block, advancing balances and
    /// tails. Returns, per transaction, the previous tail ids of the source
    /// and target wallets (the reverse-index payload).
    pub fn apply_block(&self, pool: &Pool) -> Vec<(Option<TransactionId>, Option<TransactionId>)> {
        let pool_hash = pool.hash();
        let mut state = self.state.write();
        pool.transactions()
            .iter()
            .enumerate()
            .map(|(index, transaction)| {
                let id = TransactionId::new(pool_hash, index as u32);
                apply_transaction(&mut state, transaction, id)
            })
            .collect()
    }
}

fn apply_transaction(
    state: &mut CacheState,
    transaction: &Transaction,
    id: TransactionId,
) -> (Option<TransactionId>, Option<TransactionId>) {
    let source_key = resolve_or_register(state, &transaction.source);
    let target_key = resolve_or_register(state, &transaction.target);

    let debit = transaction
        .amount
        .saturating_add(transaction.counted_fee as u128);

    let previous_source = source_key.map(|key| {
        let wallet = state.wallets.entry(key).or_default();
        let previous = wallet.last_transaction.replace(id);
        wallet.balance = wallet.balance.saturating_sub(debit);
        wallet.last_inner_id = wallet.last_inner_id.max(transaction.inner_id);
        previous
    });
    let previous_target = target_key.map(|key| {
        let wallet = state.wallets.entry(key).or_default();
        let previous = wallet.last_transaction.replace(id);
        wallet.balance = wallet.balance.saturating_add(transaction.amount);
        previous
    });

    (previous_source.flatten(), previous_target.flatten())
}

fn resolve_or_register(state: &mut CacheState, address: &Address) -> Option<PublicKeyBytes> {
    match address {
        Address::Key(key) => {
            let wallet = state.wallets.entry(*key).or_default();
            if wallet.id.is_none() {
                let id = state.next_id;
                state.next_id += 1;
                wallet.id = Some(id);
                state.by_id.insert(id, *key);
            }
            Some(*key)
        }
        Address::Id(id) => {
            let resolved = state.by_id.get(id).copied();
            if resolved.is_none() {
                warn!(wallet_id = id, "transaction references unknown wallet id");
            }
            resolved
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PoolHash;

    fn block_with(transactions: Vec<Transaction>) -> Pool {
        let mut pool = Pool::new(0, PoolHash::EMPTY);
        for tx in transactions {
            pool.add_transaction(tx);
        }
        pool.compose();
        pool
    }

    #[test]
    fn balances_and_tails_advance_per_transaction() {
        let cache = WalletsCache::new();
        let alice = Address::Key([1u8; 32]);
        let bob = Address::Key([2u8; 32]);

        let mut fund = Transaction::new(1, Address::Key([9u8; 32]), alice, 1, 1_000, 10);
        fund.counted_fee = 5;
        let mut spend = Transaction::new(1, alice, bob, 1, 300, 10);
        spend.counted_fee = 5;
        let pool = block_with(vec![fund, spend]);
        let previous = cache.apply_block(&pool);

        assert_eq!(previous.len(), 2);
        // alice was credited by tx 0 before spending in tx 1
        assert_eq!(
            previous[1].0,
            Some(TransactionId::new(pool.hash(), 0))
        );
        assert_eq!(cache.balance(&alice), Some(1_000 - 300 - 5));
        assert_eq!(cache.balance(&bob), Some(300));
        assert_eq!(cache.next_inner_id(&alice), 2);
    }

    #[test]
    fn wallet_ids_are_assigned_and_resolvable() {
        let cache = WalletsCache::new();
        let key = [7u8; 32];
        let pool = block_with(vec![Transaction::new(
            1,
            Address::Key(key),
            Address::Key([8u8; 32]),
            1,
            0,
            10,
        )]);
        cache.apply_block(&pool);

        let id = cache.wallet_id(&Address::Key(key)).expect("id assigned");
        assert_eq!(cache.resolve(&Address::Id(id)), Some(key));
        assert_eq!(cache.resolve(&Address::Id(id + 100)), None);
    }
}
