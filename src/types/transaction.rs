use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::{self, PublicKeyBytes, SignatureBytes, SIGNATURE_LEN};
use crate::errors::{ChainError, ChainResult};

use super::codec::{ByteReader, ByteWriter};
use super::pool::PoolHash;
use super::Address;

/// Well-known user field keys. The numbering is part of the disk format.
pub mod user_fields {
    /// Deploy bytecode or start invocation (encoded [`ContractInvocation`]).
    pub const CODE: i32 = 0;
    /// Reference to the starter transaction of a contract execution.
    pub const REF_START: i32 = 1;
    /// New contract state bytes; empty on failed execution.
    pub const VALUE: i32 = 2;
    /// Total fee consumed by the execution.
    pub const FEE: i32 = 3;
    /// Encoded return value of the executed method.
    pub const RET_VAL: i32 = 4;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserFieldValue {
    Integer(i64),
    Bytes(Vec<u8>),
    Amount(u64),
}

const FIELD_TAG_INTEGER: u8 = 1;
const FIELD_TAG_BYTES: u8 = 2;
const FIELD_TAG_AMOUNT: u8 = 3;

impl UserFieldValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            UserFieldValue::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            UserFieldValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_amount(&self) -> Option<u64> {
        match self {
            UserFieldValue::Amount(value) => Some(*value),
            _ => None,
        }
    }

    fn encode(&self, writer: &mut ByteWriter) {
        match self {
            UserFieldValue::Integer(value) => {
                writer.put_u8(FIELD_TAG_INTEGER);
                writer.put_i64(*value);
            }
            UserFieldValue::Bytes(bytes) => {
                writer.put_u8(FIELD_TAG_BYTES);
                writer.put_bytes(bytes);
            }
            UserFieldValue::Amount(value) => {
                writer.put_u8(FIELD_TAG_AMOUNT);
                writer.put_u64(*value);
            }
        }
    }

    fn decode(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        match reader.get_u8()? {
            FIELD_TAG_INTEGER => Ok(UserFieldValue::Integer(reader.get_i64()?)),
            FIELD_TAG_BYTES => Ok(UserFieldValue::Bytes(reader.get_bytes()?)),
            FIELD_TAG_AMOUNT => Ok(UserFieldValue::Amount(reader.get_u64()?)),
            tag => Err(ChainError::Codec(format!("unknown user field tag {tag}"))),
        }
    }
}

pub(crate) fn encode_user_fields(
    fields: &BTreeMap<i32, UserFieldValue>,
    writer: &mut ByteWriter,
) {
    writer.put_u8(fields.len() as u8);
    for (key, value) in fields {
        writer.put_i32(*key);
        value.encode(writer);
    }
}

pub(crate) fn decode_user_fields(
    reader: &mut ByteReader<'_>,
) -> ChainResult<BTreeMap<i32, UserFieldValue>> {
    let count = reader.get_u8()?;
    let mut fields = BTreeMap::new();
    for _ in 0..count {
        let key = reader.get_i32()?;
        fields.insert(key, UserFieldValue::decode(reader)?);
    }
    Ok(fields)
}

/// Position of a committed transaction: the pool it belongs to and its index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId {
    pub pool_hash: PoolHash,
    pub index: u32,
}

impl TransactionId {
    pub fn new(pool_hash: PoolHash, index: u32) -> Self {
        Self { pool_hash, index }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::with_capacity(36);
        writer.put_raw(self.pool_hash.as_bytes());
        writer.put_u32(self.index);
        writer.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        let hash = PoolHash::from_bytes(reader.get_array()?);
        let index = reader.get_u32()?;
        Ok(Self::new(hash, index))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.pool_hash, self.index)
    }
}

/// Reference to the transaction that started a contract execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SmartContractRef {
    pub pool_hash: PoolHash,
    pub sequence: u64,
    pub transaction: u32,
}

impl SmartContractRef {
    pub fn new(pool_hash: PoolHash, sequence: u64, transaction: u32) -> Self {
        Self {
            pool_hash,
            sequence,
            transaction,
        }
    }

    pub fn to_user_field(&self) -> UserFieldValue {
        let mut writer = ByteWriter::with_capacity(44);
        writer.put_raw(self.pool_hash.as_bytes());
        writer.put_u64(self.sequence);
        writer.put_u32(self.transaction);
        UserFieldValue::Bytes(writer.into_bytes())
    }

    pub fn from_user_field(field: &UserFieldValue) -> ChainResult<Self> {
        let bytes = field
            .as_bytes()
            .ok_or_else(|| ChainError::Codec("contract ref field is not bytes".into()))?;
        let mut reader = ByteReader::new(bytes);
        let hash = PoolHash::from_bytes(reader.get_array()?);
        let sequence = reader.get_u64()?;
        let transaction = reader.get_u32()?;
        if !reader.is_exhausted() {
            return Err(ChainError::Codec("trailing bytes in contract ref".into()));
        }
        Ok(Self::new(hash, sequence, transaction))
    }
}

impl fmt::Display for SmartContractRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}.{}}}", self.sequence, self.transaction)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub inner_id: u64,
    pub source: Address,
    pub target: Address,
    pub currency: u32,
    pub amount: u128,
    pub max_fee: u64,
    pub counted_fee: u64,
    pub signature: SignatureBytes,
    pub user_fields: BTreeMap<i32, UserFieldValue>,
}

impl Transaction {
    pub fn new(
        inner_id: u64,
        source: Address,
        target: Address,
        currency: u32,
        amount: u128,
        max_fee: u64,
    ) -> Self {
        Self {
            inner_id,
            source,
            target,
            currency,
            amount,
            max_fee,
            counted_fee: 0,
            signature: [0u8; SIGNATURE_LEN],
            user_fields: BTreeMap::new(),
        }
    }

    pub fn add_user_field(&mut self, key: i32, value: UserFieldValue) {
        self.user_fields.insert(key, value);
    }

    pub fn user_field(&self, key: i32) -> Option<&UserFieldValue> {
        self.user_fields.get(&key)
    }

    pub fn user_field_bytes(&self, key: i32) -> Option<&[u8]> {
        self.user_field(key).and_then(UserFieldValue::as_bytes)
    }

    /// A new_state transaction carries the post-execution contract state plus
    /// a reference to its starter. Both fields are required; the ref filters
    /// out transactions of unrelated shape that happen to carry a state blob.
    pub fn is_new_state(&self) -> bool {
        matches!(
            self.user_field(user_fields::VALUE),
            Some(UserFieldValue::Bytes(_))
        ) && matches!(
            self.user_field(user_fields::REF_START),
            Some(UserFieldValue::Bytes(_))
        )
    }

    /// True for transactions carrying contract code or a method invocation.
    pub fn has_contract_code(&self) -> bool {
        matches!(
            self.user_field(user_fields::CODE),
            Some(UserFieldValue::Bytes(_))
        )
    }

    pub fn is_smart_contract(&self) -> bool {
        self.has_contract_code() || self.is_new_state()
    }

    pub(crate) fn encode(&self, writer: &mut ByteWriter) {
        writer.put_u64(self.inner_id);
        self.source.encode(writer);
        self.target.encode(writer);
        writer.put_u32(self.currency);
        writer.put_u128(self.amount);
        writer.put_u64(self.max_fee);
        writer.put_u64(self.counted_fee);
        writer.put_raw(&self.signature);
        encode_user_fields(&self.user_fields, writer);
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        Ok(Self {
            inner_id: reader.get_u64()?,
            source: Address::decode(reader)?,
            target: Address::decode(reader)?,
            currency: reader.get_u32()?,
            amount: reader.get_u128()?,
            max_fee: reader.get_u64()?,
            counted_fee: reader.get_u64()?,
            signature: reader.get_array()?,
            user_fields: decode_user_fields(reader)?,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        self.encode(&mut writer);
        writer.into_bytes()
    }

    pub fn from_bytes(data: &[u8]) -> ChainResult<Self> {
        let mut reader = ByteReader::new(data);
        let tx = Self::decode(&mut reader)?;
        if !reader.is_exhausted() {
            return Err(ChainError::Codec("trailing bytes after transaction".into()));
        }
        Ok(tx)
    }

    pub fn hash(&self) -> [u8; 32] {
        crypto::digest(&self.to_bytes())
    }

    /// Bytes covered by the sender signature: the transaction with the
    /// validator-assigned counted fee and the signature itself zeroed.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.counted_fee = 0;
        unsigned.signature = [0u8; SIGNATURE_LEN];
        unsigned.to_bytes()
    }

    pub fn verify_signature(&self, public_key: &PublicKeyBytes) -> bool {
        crypto::signature_is_valid(public_key, &self.signing_bytes(), &self.signature)
    }

    /// Rough structural validity; full validation is the validator's job.
    pub fn is_valid(&self) -> bool {
        self.source != self.target || self.is_new_state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn proptest_config() -> ProptestConfig {
        let cases = std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(64);
        ProptestConfig {
            cases,
            ..ProptestConfig::default()
        }
    }

    fn arb_address() -> impl Strategy<Value = Address> {
        prop_oneof![
            prop::array::uniform32(any::<u8>()).prop_map(Address::Key),
            any::<u32>().prop_map(Address::Id),
        ]
    }

    fn arb_user_field() -> impl Strategy<Value = UserFieldValue> {
        prop_oneof![
            any::<i64>().prop_map(UserFieldValue::Integer),
            prop::collection::vec(any::<u8>(), 0..64).prop_map(UserFieldValue::Bytes),
            any::<u64>().prop_map(UserFieldValue::Amount),
        ]
    }

    prop_compose! {
        fn arb_transaction()(inner_id in any::<u64>(),
                             source in arb_address(),
                             target in arb_address(),
                             currency in 0u32..4,
                             amount in any::<u128>(),
                             max_fee in any::<u64>(),
                             counted_fee in any::<u64>(),
                             sig in prop::collection::vec(any::<u8>(), 64),
                             fields in prop::collection::btree_map(-4i32..8, arb_user_field(), 0..4))
            -> Transaction
        {
            let mut tx = Transaction::new(inner_id, source, target, currency, amount, max_fee);
            tx.counted_fee = counted_fee;
            tx.signature = sig.as_slice().try_into().unwrap();
            tx.user_fields = fields;
            tx
        }
    }

    proptest! {
        #![proptest_config(proptest_config())]
        fn transaction_binary_roundtrip(tx in arb_transaction()) {
            let bytes = tx.to_bytes();
            let decoded = Transaction::from_bytes(&bytes).expect("decode transaction");
            prop_assert_eq!(decoded, tx);
        }
    }

    #[test]
    fn contract_ref_user_field_roundtrip() {
        let reference = SmartContractRef::new(PoolHash::from_bytes([9u8; 32]), 17, 3);
        let field = reference.to_user_field();
        let decoded = SmartContractRef::from_user_field(&field).expect("decode ref");
        assert_eq!(decoded, reference);
    }

    #[test]
    fn new_state_requires_both_fields() {
        let mut tx = Transaction::new(1, Address::Id(1), Address::Id(1), 1, 0, 10);
        assert!(!tx.is_new_state());
        tx.add_user_field(user_fields::VALUE, UserFieldValue::Bytes(vec![1, 2]));
        assert!(!tx.is_new_state());
        tx.add_user_field(
            user_fields::REF_START,
            SmartContractRef::new(PoolHash::EMPTY, 0, 0).to_user_field(),
        );
        assert!(tx.is_new_state());
    }

    #[test]
    fn signing_bytes_ignore_counted_fee() {
        let mut tx = Transaction::new(1, Address::Id(1), Address::Id(2), 1, 50, 10);
        let before = tx.signing_bytes();
        tx.counted_fee = 7;
        assert_eq!(before, tx.signing_bytes());
    }
}
