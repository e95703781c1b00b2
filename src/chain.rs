use std::path::Path;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::crypto::PublicKeyBytes;
use crate::errors::ChainResult;
use crate::storage::{OpenCallback, Storage};
use crate::types::{Address, Pool, PoolHash, TransactionId};
use crate::wallets::{WalletData, WalletsCache};

/// Block lifecycle notifications fanned out to subsystems that inspect every
/// block (the contract scheduler foremost). `StoreBlock` fires for blocks
/// committed while running, `ReadBlock` while replaying the chain on startup.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    StoreBlock(Pool),
    ReadBlock(Pool),
}

/// The chain facade: persistent pool storage plus the wallet cache and the
/// transaction reverse index derived from it.
pub struct BlockChain {
    storage: Storage,
    wallets: WalletsCache,
    last_sequence: RwLock<u64>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChainEvent>>>,
}

impl BlockChain {
    pub fn open(path: &Path, on_progress: Option<&mut OpenCallback<'_>>) -> ChainResult<Self> {
        let storage = Storage::open(path, on_progress)?;
        let last_sequence = match storage.load_meta(&storage.last_hash()) {
            Ok(Some((meta, _))) => meta.sequence(),
            _ => 0,
        };
        info!(
            count = storage.count(),
            last_sequence, "blockchain storage opened"
        );
        Ok(Self {
            storage,
            wallets: WalletsCache::new(),
            last_sequence: RwLock::new(last_sequence),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Registers a block event subscriber. Call before feeding any blocks.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ChainEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sink| sink.send(event.clone()).is_ok());
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn wallets(&self) -> &WalletsCache {
        &self.wallets
    }

    pub fn last_sequence(&self) -> u64 {
        *self.last_sequence.read()
    }

    pub fn last_hash(&self) -> PoolHash {
        self.storage.last_hash()
    }

    /// Commits a block: persists it, applies it to the wallet cache, indexes
    /// its transactions and notifies subscribers.
    pub fn store_block(&self, mut pool: Pool) -> ChainResult<PoolHash> {
        let hash = pool.compose();
        self.storage.save(pool.clone())?;
        self.index_and_apply(&pool)?;
        {
            let mut last = self.last_sequence.write();
            *last = (*last).max(pool.sequence());
        }
        debug!(sequence = pool.sequence(), %hash, "block stored");
        self.emit(ChainEvent::StoreBlock(pool));
        Ok(hash)
    }

    /// Replays all persisted blocks in sequence order, rebuilding the wallet
    /// cache and letting subscribers recover their state.
    pub fn replay_committed(&self) -> ChainResult<u64> {
        let mut sequence = 0u64;
        let mut replayed = 0u64;
        let mut previous = PoolHash::EMPTY;
        while let Some(pool) = self.storage.load_by_sequence(sequence)? {
            if pool.previous_hash() != previous {
                return Err(crate::errors::ChainError::ChainIntegrity(format!(
                    "block {sequence} does not link to its predecessor"
                )));
            }
            previous = pool.hash();
            self.index_and_apply(&pool)?;
            {
                let mut last = self.last_sequence.write();
                *last = (*last).max(pool.sequence());
            }
            self.emit(ChainEvent::ReadBlock(pool));
            replayed += 1;
            sequence += 1;
        }
        if replayed > 0 {
            info!(blocks = replayed, "chain replay complete");
        }
        Ok(replayed)
    }

    fn index_and_apply(&self, pool: &Pool) -> ChainResult<()> {
        let pool_hash = pool.hash();
        let previous_ids = self.wallets.apply_block(pool);
        for (index, (source_prev, target_prev)) in previous_ids.into_iter().enumerate() {
            let id = TransactionId::new(pool_hash, index as u32);
            self.storage
                .set_previous_transaction_ids(&id, source_prev, target_prev)?;
        }
        Ok(())
    }

    pub fn load_block(&self, sequence: u64) -> ChainResult<Option<Pool>> {
        self.storage.load_by_sequence(sequence)
    }

    pub fn load_block_by_hash(&self, hash: &PoolHash) -> ChainResult<Option<Pool>> {
        self.storage.load(hash)
    }

    pub fn find_wallet_data(&self, address: &Address) -> Option<WalletData> {
        self.wallets.data(address)
    }

    /// Resolves any address form to the wallet's public key.
    pub fn public_key_of(&self, address: &Address) -> Option<PublicKeyBytes> {
        self.wallets.resolve(address)
    }

    pub fn next_inner_id(&self, address: &Address) -> u64 {
        self.wallets.next_inner_id(address)
    }

    /// Walks one step back in a wallet's history: the ids of the transactions
    /// preceding `id` on its source and target wallets.
    pub fn previous_transaction_ids(
        &self,
        id: &TransactionId,
    ) -> ChainResult<Option<(Option<TransactionId>, Option<TransactionId>)>> {
        self.storage.previous_transaction_ids(id)
    }
}
