use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::ConveyerLimits;
use crate::crypto::{self, PublicKeyBytes};
use crate::errors::{ChainError, ChainResult};
use crate::types::{PacketHash, Pool, PoolHash, Transaction, TransactionsPacket};

/// Round table issued by consensus: the confidants of the round and the
/// packet hashes expected to form its block.
#[derive(Clone, Debug)]
pub struct RoundTable {
    pub round: u64,
    pub confidants: Vec<PublicKeyBytes>,
    pub hashes: Vec<PacketHash>,
}

/// Bitmask over a round's concatenated transaction list; byte per
/// transaction, 1 = keep, 0 = reject.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Characteristic {
    pub mask: Vec<u8>,
}

impl Characteristic {
    pub fn hash(&self) -> [u8; 32] {
        crypto::digest(&self.mask)
    }
}

/// Characteristic received from the network before the local round caught up.
#[derive(Clone, Debug)]
pub struct CharacteristicMeta {
    pub bytes: Vec<u8>,
    pub sender: PublicKeyBytes,
}

/// Header data for the pool assembled out of a round.
#[derive(Clone, Debug)]
pub struct PoolMetaInfo {
    pub sequence: u64,
    pub previous_hash: PoolHash,
    pub writer: PublicKeyBytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationState {
    Equal,
    GreaterEqual,
}

#[derive(Default)]
struct RoundMeta {
    table: Option<RoundTable>,
    packets: HashMap<PacketHash, TransactionsPacket>,
    needed: HashSet<PacketHash>,
    characteristic: Option<Characteristic>,
    characteristic_meta: Option<CharacteristicMeta>,
    notifications: Vec<Vec<u8>>,
    invalid_inner_ids: HashSet<u64>,
}

struct PacketQueue {
    open: TransactionsPacket,
    sealed: VecDeque<TransactionsPacket>,
    transactions: usize,
}

impl PacketQueue {
    fn new() -> Self {
        Self {
            open: TransactionsPacket::new(),
            sealed: VecDeque::new(),
            transactions: 0,
        }
    }
}

struct ConveyerState {
    round: u64,
    meta: BTreeMap<u64, RoundMeta>,
}

/// The transaction conveyer: admits transactions and packets, publishes them
/// at round boundaries and answers packet-by-hash lookups for a bounded
/// window of past rounds.
pub struct Conveyer {
    limits: ConveyerLimits,
    state: RwLock<ConveyerState>,
    queue: Mutex<PacketQueue>,
}

impl Conveyer {
    pub fn new(limits: ConveyerLimits) -> Self {
        let mut meta = BTreeMap::new();
        meta.insert(0, RoundMeta::default());
        Self {
            limits,
            state: RwLock::new(ConveyerState { round: 0, meta }),
            queue: Mutex::new(PacketQueue::new()),
        }
    }

    pub fn current_round(&self) -> u64 {
        self.state.read().round
    }

    pub fn previous_round(&self) -> u64 {
        self.state.read().round.saturating_sub(1)
    }

    /// Admits a single user transaction into the open packet.
    pub fn add_transaction(&self, transaction: Transaction) -> ChainResult<()> {
        if !transaction.is_valid() {
            return Err(ChainError::Transaction(
                "transaction failed structural validation".into(),
            ));
        }
        let mut queue = self.queue.lock();
        if queue.transactions >= self.limits.max_queue_size {
            return Err(ChainError::Transaction("conveyer queue is full".into()));
        }
        queue.open.add_transaction(transaction);
        queue.transactions += 1;
        if queue.open.transactions_count() >= self.limits.max_packet_transactions {
            let sealed = std::mem::take(&mut queue.open);
            queue.sealed.push_back(sealed);
        }
        Ok(())
    }

    /// Inserts a pre-formed packet as a monolith into the current round table.
    pub fn add_separate_packet(&self, packet: TransactionsPacket) {
        let mut state = self.state.write();
        let round = state.round;
        state
            .meta
            .entry(round)
            .or_default()
            .packets
            .insert(packet.hash(), packet);
    }

    /// Inserts a packet received from the network.
    pub fn add_transactions_packet(&self, packet: TransactionsPacket) {
        self.add_separate_packet(packet);
    }

    pub fn packet_queue_transactions_count(&self) -> usize {
        self.queue.lock().transactions
    }

    /// Rotates the conveyer to a new round and purges meta beyond capacity.
    /// Call before [`Conveyer::set_table`].
    pub fn set_round(&self, round: u64) {
        let mut state = self.state.write();
        state.round = round;
        state.meta.entry(round).or_default();
        let oldest_kept = round.saturating_sub(self.limits.meta_capacity);
        state.meta.retain(|kept, _| *kept >= oldest_kept);
    }

    /// Adopts the round table: packets already held and listed by the table
    /// move into the round's table, the rest of the listed hashes become
    /// `needed` and must be synced from peers.
    pub fn set_table(&self, table: RoundTable) {
        let mut state = self.state.write();
        let round = state.round;
        if table.round != round {
            warn!(
                table_round = table.round,
                round, "round table does not match current round"
            );
        }

        // collect already-known packets from retained rounds
        let mut matched: HashMap<PacketHash, TransactionsPacket> = HashMap::new();
        let mut needed = HashSet::new();
        for hash in &table.hashes {
            let found = state
                .meta
                .values_mut()
                .find_map(|meta| meta.packets.remove(hash));
            match found {
                Some(packet) => {
                    matched.insert(*hash, packet);
                }
                None => {
                    needed.insert(*hash);
                }
            }
        }

        let meta = state.meta.entry(round).or_default();
        meta.packets.extend(matched);
        debug!(
            round,
            expected = table.hashes.len(),
            needed = needed.len(),
            "round table adopted"
        );
        meta.needed = needed;
        meta.table = Some(table);
    }

    /// Rolls meta storage back to `cached_round` before adopting a table,
    /// used when consensus restarts from an earlier round.
    pub fn update_round_table(&self, cached_round: u64, table: RoundTable) {
        {
            let mut state = self.state.write();
            state.meta.retain(|round, _| *round < cached_round);
        }
        self.set_round(table.round);
        self.set_table(table);
    }

    pub fn round_table(&self, round: u64) -> Option<RoundTable> {
        self.state
            .read()
            .meta
            .get(&round)
            .and_then(|meta| meta.table.clone())
    }

    pub fn current_round_table(&self) -> Option<RoundTable> {
        let state = self.state.read();
        state.meta.get(&state.round).and_then(|meta| meta.table.clone())
    }

    // confidant helpers

    pub fn confidants(&self) -> Vec<PublicKeyBytes> {
        self.current_round_table()
            .map(|table| table.confidants)
            .unwrap_or_default()
    }

    pub fn confidants_count(&self) -> usize {
        self.confidants().len()
    }

    pub fn is_confidant_exists(&self, index: usize) -> bool {
        index < self.confidants_count()
    }

    pub fn confidant_if_exists(&self, index: usize) -> Option<PublicKeyBytes> {
        self.confidants().get(index).copied()
    }

    // sync bookkeeping

    /// Satisfies a needed hash while syncing a round from peers.
    pub fn add_found_packet(&self, round: u64, packet: TransactionsPacket) {
        let mut state = self.state.write();
        if let Some(meta) = state.meta.get_mut(&round) {
            let hash = packet.hash();
            if meta.needed.remove(&hash) {
                meta.packets.insert(hash, packet);
            } else {
                debug!(round, %hash, "found packet was not needed");
            }
        }
    }

    pub fn needed_hashes(&self, round: u64) -> Option<Vec<PacketHash>> {
        self.state
            .read()
            .meta
            .get(&round)
            .map(|meta| meta.needed.iter().copied().collect())
    }

    pub fn current_needed_hashes(&self) -> Vec<PacketHash> {
        let state = self.state.read();
        state
            .meta
            .get(&state.round)
            .map(|meta| meta.needed.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_sync_completed(&self, round: u64) -> bool {
        self.state
            .read()
            .meta
            .get(&round)
            .map(|meta| meta.needed.is_empty())
            .unwrap_or(true)
    }

    pub fn is_current_sync_completed(&self) -> bool {
        self.is_sync_completed(self.current_round())
    }

    /// Searches the given round's table, then the current one, then every
    /// retained neighbour round.
    pub fn find_packet(&self, hash: &PacketHash, round: u64) -> Option<TransactionsPacket> {
        let state = self.state.read();
        if let Some(packet) = state
            .meta
            .get(&round)
            .and_then(|meta| meta.packets.get(hash))
        {
            return Some(packet.clone());
        }
        if let Some(packet) = state
            .meta
            .get(&state.round)
            .and_then(|meta| meta.packets.get(hash))
        {
            return Some(packet.clone());
        }
        state
            .meta
            .values()
            .find_map(|meta| meta.packets.get(hash).cloned())
    }

    // notifications

    pub fn add_notification(&self, round: u64, bytes: Vec<u8>) {
        let mut state = self.state.write();
        state
            .meta
            .entry(round)
            .or_default()
            .notifications
            .push(bytes);
    }

    pub fn notifications(&self, round: u64) -> Vec<Vec<u8>> {
        self.state
            .read()
            .meta
            .get(&round)
            .map(|meta| meta.notifications.clone())
            .unwrap_or_default()
    }

    pub fn needed_notifications_count(&self) -> usize {
        self.confidants_count() / 2 + 1
    }

    pub fn is_enough_notifications(&self, state: NotificationState) -> bool {
        let current = {
            let guard = self.state.read();
            guard
                .meta
                .get(&guard.round)
                .map(|meta| meta.notifications.len())
                .unwrap_or(0)
        };
        let needed = self.needed_notifications_count();
        match state {
            NotificationState::Equal => current == needed,
            NotificationState::GreaterEqual => current >= needed,
        }
    }

    // characteristics

    pub fn set_characteristic(&self, characteristic: Characteristic, round: u64) {
        let mut state = self.state.write();
        state.meta.entry(round).or_default().characteristic = Some(characteristic);
    }

    pub fn characteristic(&self, round: u64) -> Option<Characteristic> {
        self.state
            .read()
            .meta
            .get(&round)
            .and_then(|meta| meta.characteristic.clone())
    }

    pub fn characteristic_hash(&self, round: u64) -> Option<[u8; 32]> {
        self.characteristic(round)
            .map(|characteristic| characteristic.hash())
    }

    pub fn add_characteristic_meta(&self, round: u64, meta: CharacteristicMeta) {
        let mut state = self.state.write();
        state.meta.entry(round).or_default().characteristic_meta = Some(meta);
    }

    /// Takes an early-received characteristic out of storage, if any.
    pub fn characteristic_meta(&self, round: u64) -> Option<CharacteristicMeta> {
        let mut state = self.state.write();
        state
            .meta
            .get_mut(&round)
            .and_then(|meta| meta.characteristic_meta.take())
    }

    /// True when a recently rejected transaction with this inner id is known;
    /// guards against re-admitting duplicates while their round is retained.
    pub fn is_meta_transaction_invalid(&self, inner_id: u64) -> bool {
        self.state
            .read()
            .meta
            .values()
            .any(|meta| meta.invalid_inner_ids.contains(&inner_id))
    }

    /// Assembles the round's pool by filtering its concatenated transaction
    /// list through the stored characteristic mask. The transaction order is
    /// the round table's hash order.
    pub fn apply_characteristic(&self, info: &PoolMetaInfo) -> Option<Pool> {
        let mut state = self.state.write();
        let round = state.round.saturating_sub(1);
        let meta = state.meta.get_mut(&round)?;
        let table = meta.table.as_ref()?;
        let characteristic = meta.characteristic.as_ref()?;
        let mask = &characteristic.mask;

        let mut pool = Pool::new(info.sequence, info.previous_hash);
        pool.set_confidants(table.confidants.clone());
        let mut rejected_inner_ids = Vec::new();
        let mut index = 0usize;
        for hash in &table.hashes {
            let packet = match meta.packets.get(hash) {
                Some(packet) => packet,
                None => {
                    warn!(round, %hash, "packet missing while applying characteristic");
                    return None;
                }
            };
            for transaction in packet.transactions() {
                match mask.get(index) {
                    Some(1) => pool.add_transaction(transaction.clone()),
                    Some(_) => rejected_inner_ids.push(transaction.inner_id),
                    None => {
                        warn!(round, "characteristic mask shorter than round");
                        return None;
                    }
                }
                index += 1;
            }
        }
        if index != mask.len() {
            warn!(
                round,
                mask = mask.len(),
                transactions = index,
                "characteristic mask does not match round size"
            );
            return None;
        }
        meta.invalid_inner_ids.extend(rejected_inner_ids);
        Some(pool)
    }

    /// Hands over every sealed but unpublished packet, up to the per-round
    /// cap, registering each in the current round table. The caller publishes
    /// them to the network.
    pub fn flush_transactions(&self) -> Vec<TransactionsPacket> {
        let mut flushed = Vec::new();
        {
            let mut queue = self.queue.lock();
            while flushed.len() < self.limits.max_packets_per_round {
                if let Some(packet) = queue.sealed.pop_front() {
                    flushed.push(packet);
                } else if !queue.open.is_empty() {
                    flushed.push(std::mem::take(&mut queue.open));
                } else {
                    break;
                }
            }
            let remaining: usize = queue
                .sealed
                .iter()
                .map(TransactionsPacket::transactions_count)
                .sum::<usize>()
                + queue.open.transactions_count();
            queue.transactions = remaining;
        }

        if !flushed.is_empty() {
            let mut state = self.state.write();
            let round = state.round;
            let meta = state.meta.entry(round).or_default();
            for packet in &flushed {
                meta.packets.insert(packet.hash(), packet.clone());
            }
            debug!(round, packets = flushed.len(), "flushed packets");
        }
        flushed
    }

    /// The round packet assembled from the queue plus the smart-contract
    /// packets already registered for the current round.
    pub fn create_packet(&self) -> (TransactionsPacket, Vec<TransactionsPacket>) {
        let round_packet = {
            let queue = self.queue.lock();
            let mut packet = TransactionsPacket::new();
            for sealed in &queue.sealed {
                for transaction in sealed.transactions() {
                    packet.add_transaction(transaction.clone());
                }
            }
            for transaction in queue.open.transactions() {
                packet.add_transaction(transaction.clone());
            }
            packet
        };
        let smart_packets = {
            let state = self.state.read();
            state
                .meta
                .get(&state.round)
                .map(|meta| {
                    meta.packets
                        .values()
                        .filter(|packet| {
                            packet
                                .transactions()
                                .first()
                                .map(Transaction::is_smart_contract)
                                .unwrap_or(false)
                        })
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };
        (round_packet, smart_packets)
    }
}
