mod common;

use conclave_chain::config::ConveyerLimits;
use conclave_chain::conveyer::{Characteristic, Conveyer, PoolMetaInfo, RoundTable};
use conclave_chain::types::{Address, PoolHash, Transaction, TransactionsPacket};

use common::public_key;

fn small_limits() -> ConveyerLimits {
    ConveyerLimits {
        max_packet_transactions: 3,
        max_packets_per_round: 2,
        max_queue_size: 10,
        meta_capacity: 4,
    }
}

fn transaction(inner_id: u64) -> Transaction {
    let mut tx = Transaction::new(
        inner_id,
        Address::Key(public_key(1)),
        Address::Key(public_key(2)),
        1,
        5,
        100,
    );
    tx.counted_fee = 1;
    tx
}

fn packet_of(ids: std::ops::Range<u64>) -> TransactionsPacket {
    let mut packet = TransactionsPacket::new();
    for id in ids {
        packet.add_transaction(transaction(id));
    }
    packet
}

#[test]
fn open_packet_seals_when_full() {
    let conveyer = Conveyer::new(small_limits());
    for id in 1..=7 {
        conveyer.add_transaction(transaction(id)).expect("admit");
    }
    assert_eq!(conveyer.packet_queue_transactions_count(), 7);

    let flushed = conveyer.flush_transactions();
    // two sealed packets of three; the third stays queued (per-round cap)
    assert_eq!(flushed.len(), 2);
    assert_eq!(flushed[0].transactions_count(), 3);
    assert_eq!(flushed[1].transactions_count(), 3);
    assert_eq!(conveyer.packet_queue_transactions_count(), 1);

    let rest = conveyer.flush_transactions();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].transactions_count(), 1);
    assert_eq!(conveyer.packet_queue_transactions_count(), 0);
}

#[test]
fn queue_capacity_is_enforced() {
    let conveyer = Conveyer::new(small_limits());
    for id in 1..=10 {
        conveyer.add_transaction(transaction(id)).expect("admit");
    }
    assert!(conveyer.add_transaction(transaction(11)).is_err());
}

#[test]
fn round_table_marks_missing_hashes_as_needed() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(1);

    let known = packet_of(1..3);
    let missing = packet_of(3..5);
    conveyer.add_transactions_packet(known.clone());

    conveyer.set_table(RoundTable {
        round: 1,
        confidants: vec![public_key(10), public_key(11)],
        hashes: vec![known.hash(), missing.hash()],
    });

    assert!(!conveyer.is_sync_completed(1));
    assert_eq!(conveyer.current_needed_hashes(), vec![missing.hash()]);

    conveyer.add_found_packet(1, missing.clone());
    assert!(conveyer.is_sync_completed(1));
    assert_eq!(
        conveyer.find_packet(&missing.hash(), 1).map(|p| p.hash()),
        Some(missing.hash())
    );
}

#[test]
fn find_packet_searches_neighbour_rounds() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(1);
    let packet = packet_of(1..3);
    conveyer.add_transactions_packet(packet.clone());

    conveyer.set_round(2);
    assert!(conveyer.find_packet(&packet.hash(), 2).is_some());
}

#[test]
fn meta_is_purged_beyond_capacity() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(1);
    let packet = packet_of(1..3);
    conveyer.add_transactions_packet(packet.clone());

    // capacity is 4 rounds; rotating far ahead drops round 1 meta
    conveyer.set_round(10);
    assert!(conveyer.find_packet(&packet.hash(), 1).is_none());
}

#[test]
fn confidant_helpers_reflect_current_table() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(3);
    conveyer.set_table(RoundTable {
        round: 3,
        confidants: vec![public_key(10), public_key(11), public_key(12)],
        hashes: Vec::new(),
    });

    assert_eq!(conveyer.confidants_count(), 3);
    assert!(conveyer.is_confidant_exists(2));
    assert!(!conveyer.is_confidant_exists(3));
    assert_eq!(conveyer.confidant_if_exists(1), Some(public_key(11)));
    assert_eq!(conveyer.needed_notifications_count(), 2);
}

#[test]
fn characteristic_filters_round_into_pool() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(1);

    let first = packet_of(1..4);
    let second = packet_of(4..6);
    conveyer.add_transactions_packet(first.clone());
    conveyer.add_transactions_packet(second.clone());
    conveyer.set_table(RoundTable {
        round: 1,
        confidants: vec![public_key(10)],
        hashes: vec![first.hash(), second.hash()],
    });

    conveyer.set_round(2);
    conveyer.set_characteristic(
        Characteristic {
            mask: vec![1, 0, 1, 1, 0],
        },
        1,
    );

    let info = PoolMetaInfo {
        sequence: 7,
        previous_hash: PoolHash::EMPTY,
        writer: public_key(10),
    };
    let pool = conveyer
        .apply_characteristic(&info)
        .expect("assemble pool from characteristic");
    assert_eq!(pool.sequence(), 7);
    assert_eq!(pool.transactions_count(), 3);
    let inner_ids: Vec<u64> = pool.transactions().iter().map(|tx| tx.inner_id).collect();
    assert_eq!(inner_ids, vec![1, 3, 4]);

    // applying the same characteristic twice yields an identical pool
    let again = conveyer
        .apply_characteristic(&info)
        .expect("assemble pool again");
    assert_eq!(again, pool);

    // rejected transactions are remembered while their round is retained
    assert!(conveyer.is_meta_transaction_invalid(2));
    assert!(conveyer.is_meta_transaction_invalid(5));
    assert!(!conveyer.is_meta_transaction_invalid(1));
}

#[test]
fn characteristic_with_wrong_shape_is_refused() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(1);
    let packet = packet_of(1..4);
    conveyer.add_transactions_packet(packet.clone());
    conveyer.set_table(RoundTable {
        round: 1,
        confidants: vec![public_key(10)],
        hashes: vec![packet.hash()],
    });
    conveyer.set_round(2);
    conveyer.set_characteristic(Characteristic { mask: vec![1, 1] }, 1);

    let info = PoolMetaInfo {
        sequence: 1,
        previous_hash: PoolHash::EMPTY,
        writer: public_key(10),
    };
    assert!(conveyer.apply_characteristic(&info).is_none());
}

#[test]
fn flushed_packets_are_findable_for_the_round() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(4);
    for id in 1..=3 {
        conveyer.add_transaction(transaction(id)).expect("admit");
    }
    let flushed = conveyer.flush_transactions();
    assert_eq!(flushed.len(), 1);
    let hash = flushed[0].hash();
    assert!(conveyer.find_packet(&hash, 4).is_some());
}

#[test]
fn create_packet_collects_queue_and_smart_packets() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(1);
    for id in 1..=2 {
        conveyer.add_transaction(transaction(id)).expect("admit");
    }

    let mut smart = TransactionsPacket::new();
    let mut new_state = transaction(50);
    new_state.target = new_state.source;
    new_state.add_user_field(
        conclave_chain::types::user_fields::VALUE,
        conclave_chain::types::UserFieldValue::Bytes(vec![1]),
    );
    new_state.add_user_field(
        conclave_chain::types::user_fields::REF_START,
        conclave_chain::types::SmartContractRef::new(PoolHash::EMPTY, 0, 0).to_user_field(),
    );
    smart.add_transaction(new_state);
    conveyer.add_separate_packet(smart.clone());

    let (round_packet, smart_packets) = conveyer.create_packet();
    assert_eq!(round_packet.transactions_count(), 2);
    assert_eq!(smart_packets.len(), 1);
    assert_eq!(smart_packets[0].hash(), smart.hash());
}

#[test]
fn notifications_and_characteristic_meta_are_tracked() {
    use conclave_chain::conveyer::{CharacteristicMeta, NotificationState};

    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(2);
    conveyer.set_table(RoundTable {
        round: 2,
        confidants: vec![public_key(10), public_key(11), public_key(12)],
        hashes: Vec::new(),
    });

    conveyer.add_notification(2, vec![1]);
    assert!(!conveyer.is_enough_notifications(NotificationState::GreaterEqual));
    conveyer.add_notification(2, vec![2]);
    assert!(conveyer.is_enough_notifications(NotificationState::Equal));
    assert_eq!(conveyer.notifications(2).len(), 2);

    conveyer.add_characteristic_meta(
        3,
        CharacteristicMeta {
            bytes: vec![1, 0, 1],
            sender: public_key(10),
        },
    );
    // the stored meta is handed out exactly once
    assert!(conveyer.characteristic_meta(3).is_some());
    assert!(conveyer.characteristic_meta(3).is_none());

    conveyer.set_characteristic(Characteristic { mask: vec![1, 0] }, 2);
    assert!(conveyer.characteristic_hash(2).is_some());
}

#[test]
fn update_round_table_rolls_meta_back() {
    let conveyer = Conveyer::new(small_limits());
    conveyer.set_round(5);
    let packet = packet_of(1..3);
    conveyer.add_transactions_packet(packet.clone());

    conveyer.update_round_table(
        5,
        RoundTable {
            round: 6,
            confidants: vec![public_key(10)],
            hashes: Vec::new(),
        },
    );
    assert_eq!(conveyer.current_round(), 6);
    // round-5 meta was discarded before adopting the new table
    assert!(conveyer.find_packet(&packet.hash(), 5).is_none());
}
