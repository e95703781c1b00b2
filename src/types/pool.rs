use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, PublicKeyBytes, SignatureBytes};
use crate::errors::{ChainError, ChainResult};

use super::codec::{ByteReader, ByteWriter};
use super::transaction::{decode_user_fields, encode_user_fields, Transaction, UserFieldValue};

pub const POOL_HASH_LEN: usize = 32;

/// Digest identifying a pool. The all-zero value is the "no pool" sentinel
/// used as the previous hash of the genesis pool.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolHash([u8; POOL_HASH_LEN]);

impl Default for PoolHash {
    fn default() -> Self {
        PoolHash::EMPTY
    }
}

impl PoolHash {
    pub const EMPTY: PoolHash = PoolHash([0u8; POOL_HASH_LEN]);

    pub fn from_bytes(bytes: [u8; POOL_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(data: &[u8]) -> ChainResult<Self> {
        let bytes: [u8; POOL_HASH_LEN] = data
            .try_into()
            .map_err(|_| ChainError::Codec(format!("pool hash must be {POOL_HASH_LEN} bytes")))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; POOL_HASH_LEN] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

impl fmt::Debug for PoolHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolHash({})", hex::encode(self.0))
    }
}

impl fmt::Display for PoolHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// A block of the chain: an ordered run of transactions sealed by the round's
/// confidants. Mutable while being assembled; [`Pool::compose`] freezes it and
/// fixes its hash.
///
/// Binary layout: `sequence | previous_hash | user fields | transaction count |
/// length-prefixed transactions | confidant keys | signatures`. The hash covers
/// everything up to and including the confidant section; signatures sign the
/// hash and are excluded from it.
#[derive(Clone, Debug, PartialEq)]
pub struct Pool {
    sequence: u64,
    previous_hash: PoolHash,
    user_fields: BTreeMap<i32, UserFieldValue>,
    transactions: Vec<Transaction>,
    confidants: Vec<PublicKeyBytes>,
    signatures: Vec<(u8, SignatureBytes)>,
    hash: Option<PoolHash>,
}

impl Pool {
    pub fn new(sequence: u64, previous_hash: PoolHash) -> Self {
        Self {
            sequence,
            previous_hash,
            user_fields: BTreeMap::new(),
            transactions: Vec::new(),
            confidants: Vec::new(),
            signatures: Vec::new(),
            hash: None,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn previous_hash(&self) -> PoolHash {
        self.previous_hash
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn transactions_count(&self) -> usize {
        self.transactions.len()
    }

    pub fn transaction(&self, index: usize) -> Option<&Transaction> {
        self.transactions.get(index)
    }

    pub fn confidants(&self) -> &[PublicKeyBytes] {
        &self.confidants
    }

    pub fn signatures(&self) -> &[(u8, SignatureBytes)] {
        &self.signatures
    }

    pub fn user_field(&self, key: i32) -> Option<&UserFieldValue> {
        self.user_fields.get(&key)
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        debug_assert!(!self.is_sealed(), "pool is sealed");
        self.transactions.push(transaction);
    }

    pub fn add_user_field(&mut self, key: i32, value: UserFieldValue) {
        debug_assert!(!self.is_sealed(), "pool is sealed");
        self.user_fields.insert(key, value);
    }

    pub fn set_confidants(&mut self, confidants: Vec<PublicKeyBytes>) {
        debug_assert!(!self.is_sealed(), "pool is sealed");
        self.confidants = confidants;
    }

    pub fn add_signature(&mut self, confidant_index: u8, signature: SignatureBytes) {
        self.signatures.push((confidant_index, signature));
    }

    pub fn is_sealed(&self) -> bool {
        self.hash.is_some()
    }

    /// Seals the pool: computes and caches the hash. Idempotent.
    pub fn compose(&mut self) -> PoolHash {
        match self.hash {
            Some(hash) => hash,
            None => {
                let hash = self.compute_hash();
                self.hash = Some(hash);
                hash
            }
        }
    }

    /// The pool hash; computed on the fly for not-yet-sealed pools.
    pub fn hash(&self) -> PoolHash {
        self.hash.unwrap_or_else(|| self.compute_hash())
    }

    pub fn is_valid(&self) -> bool {
        let confidants = self.confidants.len();
        self.signatures
            .iter()
            .all(|(index, _)| (*index as usize) < confidants.max(1))
            && self.transactions.len() < u32::MAX as usize
    }

    fn compute_hash(&self) -> PoolHash {
        let mut writer = ByteWriter::new();
        self.encode_prefix(&mut writer);
        PoolHash(crypto::digest(writer.as_slice()))
    }

    fn encode_prefix(&self, writer: &mut ByteWriter) {
        writer.put_u64(self.sequence);
        writer.put_raw(self.previous_hash.as_bytes());
        encode_user_fields(&self.user_fields, writer);
        writer.put_u32(self.transactions.len() as u32);
        for transaction in &self.transactions {
            writer.put_bytes(&transaction.to_bytes());
        }
        writer.put_u8(self.confidants.len() as u8);
        for confidant in &self.confidants {
            writer.put_raw(confidant);
        }
    }

    pub fn to_binary(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.encode_prefix(&mut writer);
        writer.put_u8(self.signatures.len() as u8);
        for (index, signature) in &self.signatures {
            writer.put_u8(*index);
            writer.put_raw(signature);
        }
        writer.into_bytes()
    }

    pub fn from_binary(data: &[u8]) -> ChainResult<Self> {
        Self::decode(data, false).map(|(pool, _)| pool)
    }

    /// Header-only parse: transaction bodies are skipped, the returned pool
    /// carries no transactions. The second value is the transaction count.
    pub fn meta_from_binary(data: &[u8]) -> ChainResult<(Self, usize)> {
        Self::decode(data, true)
    }

    fn decode(data: &[u8], meta_only: bool) -> ChainResult<(Self, usize)> {
        let mut reader = ByteReader::new(data);
        let sequence = reader.get_u64()?;
        let previous_hash = PoolHash(reader.get_array()?);
        let user_fields = decode_user_fields(&mut reader)?;
        let tx_count = reader.get_u32()? as usize;
        let mut transactions = Vec::new();
        if meta_only {
            for _ in 0..tx_count {
                let len = reader.get_u32()? as usize;
                reader.skip(len)?;
            }
        } else {
            transactions.reserve(tx_count);
            for _ in 0..tx_count {
                let bytes = reader.get_bytes()?;
                transactions.push(Transaction::from_bytes(&bytes)?);
            }
        }
        let confidant_count = reader.get_u8()?;
        let mut confidants = Vec::with_capacity(confidant_count as usize);
        for _ in 0..confidant_count {
            confidants.push(reader.get_array()?);
        }
        let prefix_end = reader.position();
        let signature_count = reader.get_u8()?;
        let mut signatures = Vec::with_capacity(signature_count as usize);
        for _ in 0..signature_count {
            let index = reader.get_u8()?;
            signatures.push((index, reader.get_array()?));
        }
        if !reader.is_exhausted() {
            return Err(ChainError::Codec("trailing bytes after pool".into()));
        }
        let hash = PoolHash(crypto::digest(&data[..prefix_end]));
        Ok((
            Self {
                sequence,
                previous_hash,
                user_fields,
                transactions,
                confidants,
                signatures,
                hash: Some(hash),
            },
            tx_count,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    fn sample_pool() -> Pool {
        let mut pool = Pool::new(3, PoolHash::from_bytes([7u8; 32]));
        let mut tx = Transaction::new(1, Address::Id(4), Address::Key([2u8; 32]), 1, 100, 10);
        tx.add_user_field(9, UserFieldValue::Integer(-5));
        pool.add_transaction(tx);
        pool.add_transaction(Transaction::new(2, Address::Id(4), Address::Id(5), 1, 7, 3));
        pool.add_user_field(1, UserFieldValue::Bytes(vec![0xAB, 0xCD]));
        pool.set_confidants(vec![[1u8; 32], [2u8; 32], [3u8; 32]]);
        pool.add_signature(0, [8u8; 64]);
        pool.add_signature(2, [9u8; 64]);
        pool
    }

    #[test]
    fn binary_roundtrip_preserves_pool() {
        let mut pool = sample_pool();
        let sealed = pool.compose();
        let bytes = pool.to_binary();
        let decoded = Pool::from_binary(&bytes).expect("decode pool");
        assert_eq!(decoded, pool);
        assert_eq!(decoded.hash(), sealed);
    }

    #[test]
    fn hash_excludes_signatures() {
        let mut pool = sample_pool();
        let hash = pool.compose();
        let mut more_signed = pool.clone();
        more_signed.add_signature(1, [5u8; 64]);
        let decoded =
            Pool::from_binary(&more_signed.to_binary()).expect("decode pool with extra signature");
        assert_eq!(decoded.hash(), hash);
    }

    #[test]
    fn meta_parse_skips_transactions() {
        let mut pool = sample_pool();
        let hash = pool.compose();
        let bytes = pool.to_binary();
        let (meta, count) = Pool::meta_from_binary(&bytes).expect("decode meta");
        assert_eq!(count, 2);
        assert_eq!(meta.transactions_count(), 0);
        assert_eq!(meta.sequence(), pool.sequence());
        assert_eq!(meta.previous_hash(), pool.previous_hash());
        assert_eq!(meta.hash(), hash);
    }

    #[test]
    fn corrupted_bytes_fail_decoding() {
        let mut pool = sample_pool();
        pool.compose();
        let mut bytes = pool.to_binary();
        bytes.truncate(bytes.len() - 20);
        assert!(Pool::from_binary(&bytes).is_err());
    }
}
