mod common;

use tempfile::TempDir;

use conclave_chain::errors::ChainError;
use conclave_chain::storage::Storage;
use conclave_chain::types::{Address, Pool, PoolHash, Transaction, TransactionId};

use common::{empty_block, funding_block, open_chain, public_key};

fn linked_pools(count: u64) -> Vec<Pool> {
    let mut pools = Vec::new();
    let mut previous = PoolHash::EMPTY;
    for sequence in 0..count {
        let mut pool = Pool::new(sequence, previous);
        pool.add_transaction(Transaction::new(
            sequence + 1,
            Address::Key(public_key(1)),
            Address::Key(public_key(2)),
            1,
            10,
            100,
        ));
        previous = pool.compose();
        pools.push(pool);
    }
    pools
}

#[test]
fn empty_store_opens_with_empty_tip() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::open(&dir.path().join("db"), None).expect("open storage");
    assert!(storage.last_hash().is_empty());
    assert_eq!(storage.count(), 0);
}

#[test]
fn saved_pool_is_visible_before_writer_drains() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::open(&dir.path().join("db"), None).expect("open storage");
    let pools = linked_pools(1);
    let hash = pools[0].hash();

    storage.save(pools[0].clone()).expect("save pool");
    let loaded = storage.load(&hash).expect("load pool").expect("pool found");
    assert_eq!(loaded.hash(), hash);
    assert_eq!(loaded.transactions_count(), 1);

    let (meta, count) = storage
        .load_meta(&hash)
        .expect("load meta")
        .expect("meta found");
    assert_eq!(count, 1);
    assert_eq!(meta.sequence(), 0);
}

#[test]
fn duplicate_save_is_refused() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::open(&dir.path().join("db"), None).expect("open storage");
    let pools = linked_pools(1);

    storage.save(pools[0].clone()).expect("first save");
    match storage.save(pools[0].clone()) {
        Err(ChainError::InvalidParameter(message)) => {
            assert!(message.contains("already present"), "got: {message}");
        }
        other => panic!("duplicate save must be refused, got {other:?}"),
    }
    assert_eq!(storage.count(), 1);
}

#[test]
fn chain_tip_follows_linked_saves() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::open(&dir.path().join("db"), None).expect("open storage");
    let pools = linked_pools(3);

    for pool in &pools {
        storage.save(pool.clone()).expect("save pool");
    }
    assert_eq!(storage.last_hash(), pools[2].hash());
    assert_eq!(storage.count(), 3);
}

#[test]
fn save_does_not_extend_tip_past_gap() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::open(&dir.path().join("db"), None).expect("open storage");
    let pools = linked_pools(4);

    storage.save(pools[0].clone()).expect("save pool 0");
    // sequence 1 never arrives
    storage.save(pools[2].clone()).expect("save pool 2");
    assert_eq!(storage.last_hash(), pools[0].hash());
    assert_eq!(storage.count(), 2);
}

#[test]
fn rescan_recovers_tip_and_stops_at_gap() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("db");
    let pools = linked_pools(5);
    {
        let storage = Storage::open(&db_path, None).expect("open storage");
        for sequence in [0usize, 1, 2, 4] {
            storage.save(pools[sequence].clone()).expect("save pool");
        }
        storage.close();
    }

    let storage = Storage::open(&db_path, None).expect("reopen storage");
    assert_eq!(storage.last_hash(), pools[2].hash());
    assert_eq!(storage.count(), 4);

    // rescan idempotence: a second reopen yields the same tip
    drop(storage);
    let storage = Storage::open(&db_path, None).expect("second reopen");
    assert_eq!(storage.last_hash(), pools[2].hash());
    assert_eq!(storage.count(), 4);
}

#[test]
fn restart_preserves_drained_pools() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("db");
    let pools = linked_pools(2);
    {
        let storage = Storage::open(&db_path, None).expect("open storage");
        for pool in &pools {
            storage.save(pool.clone()).expect("save pool");
        }
        // close drains the write queue before the process goes away
        storage.close();
    }

    let storage = Storage::open(&db_path, None).expect("reopen storage");
    for pool in &pools {
        let loaded = storage
            .load(&pool.hash())
            .expect("load after restart")
            .expect("pool persisted");
        assert_eq!(loaded, *pool);
    }
    assert_eq!(storage.load_by_sequence(1).expect("load by seq").map(|p| p.hash()),
        Some(pools[1].hash()));
}

#[test]
fn progress_callback_may_cancel_rescan() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("db");
    {
        let storage = Storage::open(&db_path, None).expect("open storage");
        for pool in linked_pools(3) {
            storage.save(pool).expect("save pool");
        }
        storage.close();
    }

    let mut cancel = |_: &conclave_chain::storage::OpenProgress| true;
    match Storage::open(&db_path, Some(&mut cancel)) {
        Err(ChainError::UserCancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn operations_fail_after_close() {
    let dir = TempDir::new().expect("tempdir");
    let storage = Storage::open(&dir.path().join("db"), None).expect("open storage");
    storage.close();
    let pools = linked_pools(1);
    assert!(matches!(
        storage.save(pools[0].clone()),
        Err(ChainError::NotOpen)
    ));
    assert!(matches!(
        storage.load(&pools[0].hash()),
        Err(ChainError::NotOpen)
    ));
}

#[test]
fn transaction_reverse_index_walks_wallet_history() {
    let (_dir, chain) = open_chain();
    let wallet = public_key(3);
    let other = public_key(4);

    let genesis = funding_block(0, PoolHash::EMPTY, &[(wallet, 1_000)], Vec::new());
    let genesis_hash = genesis.hash();
    chain.store_block(genesis).expect("store genesis");

    let mut second = Pool::new(1, genesis_hash);
    let mut tx = Transaction::new(1, Address::Key(wallet), Address::Key(other), 1, 50, 100);
    tx.counted_fee = 10;
    second.add_transaction(tx);
    second.compose();
    let second_hash = chain.store_block(second).expect("store second block");

    let spend_id = TransactionId::new(second_hash, 0);
    let previous = chain
        .previous_transaction_ids(&spend_id)
        .expect("index lookup")
        .expect("indexed");
    // the wallet's previous appearance was the funding credit in genesis
    assert_eq!(previous.0, Some(TransactionId::new(genesis_hash, 0)));
    assert_eq!(previous.1, None);
}

#[test]
fn replay_rebuilds_wallets_after_restart() {
    let dir = TempDir::new().expect("tempdir");
    let db_path = dir.path().join("db");
    let wallet = public_key(5);
    {
        let chain = conclave_chain::chain::BlockChain::open(&db_path, None).expect("open chain");
        let genesis = funding_block(0, PoolHash::EMPTY, &[(wallet, 700)], Vec::new());
        let hash = chain.store_block(genesis).expect("store genesis");
        chain
            .store_block(empty_block(1, hash))
            .expect("store block 1");
        chain.storage().close();
    }

    let chain = conclave_chain::chain::BlockChain::open(&db_path, None).expect("reopen chain");
    assert_eq!(chain.wallets().balance(&Address::Key(wallet)), None);
    chain.replay_committed().expect("replay");
    assert_eq!(chain.wallets().balance(&Address::Key(wallet)), Some(700));
    assert_eq!(chain.last_sequence(), 1);
}
