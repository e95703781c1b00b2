use std::fmt;

use crate::crypto::{self, PublicKeyBytes, SignatureBytes};

use super::transaction::Transaction;

/// Content hash of a transactions packet: the digest of the concatenated
/// transaction hashes, independent of signatures attached later.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PacketHash([u8; 32]);

impl PacketHash {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for PacketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PacketHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for PacketHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// A batch of transactions moving between the conveyer, the network and the
/// smart-contract consensus. Confidants co-sign the packet hash.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionsPacket {
    transactions: Vec<Transaction>,
    signatures: Vec<(u8, SignatureBytes)>,
}

impl TransactionsPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactions(transactions: Vec<Transaction>) -> Self {
        Self {
            transactions,
            signatures: Vec::new(),
        }
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn transactions_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    pub fn signatures(&self) -> &[(u8, SignatureBytes)] {
        &self.signatures
    }

    pub fn add_signature(&mut self, confidant_index: u8, signature: SignatureBytes) {
        self.signatures.push((confidant_index, signature));
    }

    pub fn clear(&mut self) {
        self.transactions.clear();
        self.signatures.clear();
    }

    pub fn hash(&self) -> PacketHash {
        let mut hasher = blake3::Hasher::new();
        for transaction in &self.transactions {
            hasher.update(&transaction.hash());
        }
        PacketHash(*hasher.finalize().as_bytes())
    }

    /// Counts signatures that verify over the packet hash under the confidant
    /// key their index points at; out-of-range indices are ignored.
    pub fn count_valid_signatures(&self, confidants: &[PublicKeyBytes]) -> usize {
        let hash = self.hash();
        self.signatures
            .iter()
            .filter(|(index, signature)| {
                confidants
                    .get(*index as usize)
                    .map(|key| crypto::signature_is_valid(key, hash.as_bytes(), signature))
                    .unwrap_or(false)
            })
            .count()
    }

    /// A packet is accepted when more than half of the confidant set signed it.
    pub fn has_quorum(&self, confidants: &[PublicKeyBytes]) -> bool {
        !confidants.is_empty()
            && self.count_valid_signatures(confidants) >= confidants.len() / 2 + 1
    }
}
