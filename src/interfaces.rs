//! Capability traits for the collaborators the core depends on but does not
//! implement: the wire transport and the stage-voting consensus.

use crate::crypto::PublicKeyBytes;
use crate::types::TransactionsPacket;

/// `(block sequence, transaction index)` of a contract execution, the unit
/// consensus accepts or rejects.
pub type RefExecution = (u64, u32);

/// Packs the identity of a smart-consensus session: the starter's position in
/// the chain plus a per-round counter.
pub fn smart_consensus_id(sequence: u64, transaction: u16, counter: u8) -> u64 {
    (sequence << 24) | ((transaction as u64) << 8) | counter as u64
}

/// The network node capability consumed by the scheduler and conveyer.
pub trait NodeGateway: Send + Sync {
    fn send_packet(&self, packet: &TransactionsPacket);
    /// Confidants trusted for contract consensus started at this sequence.
    fn smart_confidants(&self, sequence: u64) -> Vec<PublicKeyBytes>;
    /// Forces execution of every contract regardless of trust (single-node
    /// and test deployments).
    fn always_execute_contracts(&self) -> bool;
}

/// The stage-voting consensus capability.
pub trait ConsensusGateway: Send + Sync {
    /// Starts a smart-consensus session over the packet; returns false when
    /// the session cannot be started and the caller must drop the item.
    fn start_smart_consensus(&self, packet: &TransactionsPacket, id: u64) -> bool;
    /// Lets partners proceed without this node: fake stage-1 and stage-2
    /// votes sent on behalf of `own_index`.
    fn send_fake_stages(&self, confidants: &[PublicKeyBytes], own_index: u8, id: u64);
}

/// Gateway that drops packets on the floor; stands in while the transport is
/// not wired up and in tests.
#[derive(Default)]
pub struct NullGateway;

impl NodeGateway for NullGateway {
    fn send_packet(&self, _packet: &TransactionsPacket) {}

    fn smart_confidants(&self, _sequence: u64) -> Vec<PublicKeyBytes> {
        Vec::new()
    }

    fn always_execute_contracts(&self) -> bool {
        false
    }
}

impl ConsensusGateway for NullGateway {
    fn start_smart_consensus(&self, _packet: &TransactionsPacket, _id: u64) -> bool {
        false
    }

    fn send_fake_stages(&self, _confidants: &[PublicKeyBytes], _own_index: u8, _id: u64) {}
}
