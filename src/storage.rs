use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};
use rocksdb::{ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded, Options};
use tracing::{debug, warn};

use crate::errors::{ChainError, ChainResult};
use crate::types::{Pool, PoolHash, TransactionId};

pub(crate) const CF_POOLS: &str = "pools";
pub(crate) const CF_SEQUENCES: &str = "sequences";
pub(crate) const CF_TX_INDEX: &str = "tx_index";

#[derive(Clone, Copy, Debug, Default)]
pub struct OpenProgress {
    pub pools_processed: u64,
}

/// Observer invoked during the opening rescan; returning `true` cancels.
pub type OpenCallback<'a> = dyn FnMut(&OpenProgress) -> bool + 'a;

#[derive(Clone, Copy, Default)]
struct ChainIndex {
    last_hash: PoolHash,
    count: u64,
}

struct StorageShared {
    db: DBWithThreadMode<MultiThreaded>,
    /// Guards `last_hash` and the pool count.
    chain: Mutex<ChainIndex>,
    /// Guards the not-yet-persisted pool queue.
    write_queue: Mutex<VecDeque<Pool>>,
    write_signal: Condvar,
    /// Excludes KV reads while the writer is putting a pool.
    bc_lock: Mutex<()>,
    quit: AtomicBool,
    closed: AtomicBool,
}

/// Persistent pool store with a background writer.
///
/// `save` appends to an in-memory queue and returns; a dedicated thread drains
/// the queue into the KV store. Reads consult the queue before concluding a
/// pool is absent, so a saved pool is visible immediately.
pub struct Storage {
    shared: Arc<StorageShared>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage").finish_non_exhaustive()
    }
}

impl Storage {
    /// Opens the store, validates it by rescanning every record, and starts
    /// the writer thread.
    pub fn open(path: &Path, on_progress: Option<&mut OpenCallback<'_>>) -> ChainResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_POOLS, Options::default()),
            ColumnFamilyDescriptor::new(CF_SEQUENCES, Options::default()),
            ColumnFamilyDescriptor::new(CF_TX_INDEX, Options::default()),
        ];
        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)?;

        let shared = Arc::new(StorageShared {
            db,
            chain: Mutex::new(ChainIndex::default()),
            write_queue: Mutex::new(VecDeque::new()),
            write_signal: Condvar::new(),
            bc_lock: Mutex::new(()),
            quit: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let storage = Self {
            shared,
            writer: Mutex::new(None),
        };
        storage.rescan(on_progress)?;

        let worker_shared = storage.shared.clone();
        let handle = std::thread::Builder::new()
            .name("pool-writer".into())
            .spawn(move || write_routine(worker_shared))?;
        *storage.writer.lock() = Some(handle);
        Ok(storage)
    }

    /// Stops the writer thread after it drains pending work and closes reads.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.quit.store(true, Ordering::SeqCst);
        self.shared.write_signal.notify_one();
        if let Some(handle) = self.writer.lock().take() {
            if handle.join().is_err() {
                warn!("pool writer thread panicked");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> ChainResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ChainError::NotOpen)
        }
    }

    pub fn last_hash(&self) -> PoolHash {
        self.shared.chain.lock().last_hash
    }

    pub fn count(&self) -> u64 {
        self.shared.chain.lock().count
    }

    /// Catch-up override used by the node while syncing from peers.
    pub fn set_last_hash(&self, hash: PoolHash) {
        self.shared.chain.lock().last_hash = hash;
    }

    pub fn set_count(&self, count: u64) {
        self.shared.chain.lock().count = count;
    }

    /// Queues a sealed or still-mutable pool for persistence.
    ///
    /// Refuses duplicates and structurally invalid pools. Extends the
    /// in-memory chain tip when the pool links onto it.
    pub fn save(&self, pool: Pool) -> ChainResult<()> {
        self.ensure_open()?;
        if !pool.is_valid() {
            return Err(ChainError::InvalidParameter("invalid pool passed".into()));
        }

        let hash = pool.hash();
        if self.contains(&hash)? {
            return Err(ChainError::InvalidParameter(format!(
                "pool already present [hash: {hash}]"
            )));
        }

        {
            let mut queue = self.shared.write_queue.lock();
            queue.push_back(pool.clone());
        }
        {
            let mut chain = self.shared.chain.lock();
            chain.count += 1;
            if chain.last_hash == pool.previous_hash() {
                chain.last_hash = hash;
            }
        }
        self.shared.write_signal.notify_one();
        Ok(())
    }

    pub fn contains(&self, hash: &PoolHash) -> ChainResult<bool> {
        self.ensure_open()?;
        if self
            .shared
            .db
            .get_cf(&cf(&self.shared.db, CF_POOLS)?, hash.as_bytes())?
            .is_some()
        {
            return Ok(true);
        }
        let queue = self.shared.write_queue.lock();
        Ok(queue.iter().any(|pending| pending.hash() == *hash))
    }

    pub fn load(&self, hash: &PoolHash) -> ChainResult<Option<Pool>> {
        self.load_internal(hash, false)
            .map(|found| found.map(|(pool, _)| pool))
    }

    /// Fast path returning the pool header only, plus its transaction count.
    pub fn load_meta(&self, hash: &PoolHash) -> ChainResult<Option<(Pool, usize)>> {
        self.load_internal(hash, true)
    }

    fn load_internal(&self, hash: &PoolHash, meta_only: bool) -> ChainResult<Option<(Pool, usize)>> {
        self.ensure_open()?;
        if hash.is_empty() {
            return Err(ChainError::InvalidParameter("empty hash passed".into()));
        }

        let _guard = self.shared.bc_lock.lock();
        let pools = cf(&self.shared.db, CF_POOLS)?;
        let data = match self.shared.db.get_cf(&pools, hash.as_bytes())? {
            Some(data) => Some(data),
            None => {
                // The pool may still sit in the write queue, or may have been
                // popped between the miss above and taking the queue lock.
                {
                    let queue = self.shared.write_queue.lock();
                    if let Some(pending) = queue.iter().find(|pending| pending.hash() == *hash) {
                        let count = pending.transactions_count();
                        return Ok(Some((pending.clone(), count)));
                    }
                }
                self.shared.db.get_cf(&pools, hash.as_bytes())?
            }
        };

        let Some(data) = data else {
            return Ok(None);
        };
        let parsed = if meta_only {
            Pool::meta_from_binary(&data)
        } else {
            Pool::from_binary(&data).map(|pool| {
                let count = pool.transactions_count();
                (pool, count)
            })
        };
        parsed.map(Some).map_err(|_| {
            ChainError::DataIntegrity(format!("error decoding pool [hash: {hash}]"))
        })
    }

    pub fn sequence_hash(&self, sequence: u64) -> ChainResult<Option<PoolHash>> {
        self.ensure_open()?;
        {
            let queue = self.shared.write_queue.lock();
            if let Some(pending) = queue.iter().find(|pending| pending.sequence() == sequence) {
                return Ok(Some(pending.hash()));
            }
        }
        let sequences = cf(&self.shared.db, CF_SEQUENCES)?;
        match self.shared.db.get_cf(&sequences, sequence.to_be_bytes())? {
            Some(bytes) => Ok(Some(PoolHash::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load_by_sequence(&self, sequence: u64) -> ChainResult<Option<Pool>> {
        match self.sequence_hash(sequence)? {
            Some(hash) => self.load(&hash),
            None => Ok(None),
        }
    }

    /// Stores the reverse index entry for a committed transaction: the ids of
    /// the previous transactions of its source and target wallets.
    pub fn set_previous_transaction_ids(
        &self,
        id: &TransactionId,
        last_for_source: Option<TransactionId>,
        last_for_target: Option<TransactionId>,
    ) -> ChainResult<()> {
        self.ensure_open()?;
        let index = cf(&self.shared.db, CF_TX_INDEX)?;
        let value = bincode::serialize(&(last_for_source, last_for_target))?;
        self.shared.db.put_cf(&index, id.to_bytes(), value)?;
        Ok(())
    }

    pub fn previous_transaction_ids(
        &self,
        id: &TransactionId,
    ) -> ChainResult<Option<(Option<TransactionId>, Option<TransactionId>)>> {
        self.ensure_open()?;
        let index = cf(&self.shared.db, CF_TX_INDEX)?;
        match self.shared.db.get_cf(&index, id.to_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Validates every stored record and rebuilds the in-memory chain index.
    ///
    /// Records are placed into a sequence-indexed array; the chain tip is the
    /// end of the longest prefix starting at sequence 0 in which every pool
    /// links to its predecessor by hash.
    fn rescan(&self, mut on_progress: Option<&mut OpenCallback<'_>>) -> ChainResult<()> {
        let pools = cf(&self.shared.db, CF_POOLS)?;
        let mut links: Vec<Option<(PoolHash, PoolHash)>> = Vec::new();
        let mut progress = OpenProgress::default();

        for entry in self.shared.db.iterator_cf(&pools, IteratorMode::Start) {
            let (key, value) = entry?;
            let pool = Pool::from_binary(&value).map_err(|_| {
                ChainError::DataIntegrity(format!(
                    "corrupted pool for key '{}'",
                    hex::encode(&key)
                ))
            })?;
            let real_hash = pool.hash();
            let key_hash = PoolHash::from_slice(&key)?;
            if key_hash != real_hash {
                return Err(ChainError::DataIntegrity(format!(
                    "key does not match real hash (key: '{key_hash}'; real hash: '{real_hash}')"
                )));
            }

            progress.pools_processed += 1;
            if let Some(callback) = on_progress.as_deref_mut() {
                if callback(&progress) {
                    return Err(ChainError::UserCancelled);
                }
            }

            let sequence = pool.sequence() as usize;
            if sequence >= links.len() {
                links.resize(sequence + 1, None);
            }
            links[sequence] = Some((real_hash, pool.previous_hash()));
        }

        let mut chain = self.shared.chain.lock();
        chain.count = progress.pools_processed;
        chain.last_hash = PoolHash::EMPTY;
        let mut previous_real = None;
        for entry in &links {
            match (entry, previous_real) {
                (Some((real, _)), None) => {
                    chain.last_hash = *real;
                    previous_real = Some(*real);
                }
                (Some((real, prev)), Some(last)) if *prev == last => {
                    chain.last_hash = *real;
                    previous_real = Some(*real);
                }
                _ => break,
            }
        }
        debug!(
            count = chain.count,
            last_hash = %chain.last_hash,
            "storage rescan complete"
        );
        Ok(())
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.close();
    }
}

fn cf<'a>(
    db: &'a DBWithThreadMode<MultiThreaded>,
    name: &str,
) -> ChainResult<Arc<rocksdb::BoundColumnFamily<'a>>> {
    db.cf_handle(name)
        .ok_or_else(|| ChainError::Config(format!("missing column family {name}")))
}

fn write_routine(shared: Arc<StorageShared>) {
    loop {
        let mut pool = {
            let mut queue = shared.write_queue.lock();
            loop {
                if let Some(pool) = queue.pop_front() {
                    break pool;
                }
                if shared.quit.load(Ordering::SeqCst) {
                    return;
                }
                shared.write_signal.wait(&mut queue);
            }
        };

        if !pool.is_sealed() {
            pool.compose();
        }
        let hash = pool.hash();
        let _guard = shared.bc_lock.lock();
        let result = cf(&shared.db, CF_POOLS).and_then(|pools| {
            shared
                .db
                .put_cf(&pools, hash.as_bytes(), pool.to_binary())
                .map_err(ChainError::from)
        });
        let result = result.and_then(|_| {
            cf(&shared.db, CF_SEQUENCES).and_then(|sequences| {
                shared
                    .db
                    .put_cf(&sequences, pool.sequence().to_be_bytes(), hash.as_bytes())
                    .map_err(ChainError::from)
            })
        });
        if let Err(err) = result {
            warn!(%hash, sequence = pool.sequence(), ?err, "failed to persist pool");
        }
    }
}
