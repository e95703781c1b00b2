use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crypto::PublicKeyBytes;
use crate::errors::ChainResult;

pub mod codec;
pub mod packet;
pub mod pool;
pub mod transaction;

pub use packet::{PacketHash, TransactionsPacket};
pub use pool::{Pool, PoolHash};
pub use transaction::{
    user_fields, SmartContractRef, Transaction, TransactionId, UserFieldValue,
};

use codec::{ByteReader, ByteWriter};

pub type WalletId = u32;

const ADDRESS_TAG_KEY: u8 = 0;
const ADDRESS_TAG_ID: u8 = 1;

/// A wallet address: either the full public key (absolute form) or a compact
/// numeric id assigned by the wallet cache once the key is known on chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Address {
    Key(PublicKeyBytes),
    Id(WalletId),
}

impl Address {
    pub fn is_key(&self) -> bool {
        matches!(self, Address::Key(_))
    }

    pub fn is_wallet_id(&self) -> bool {
        matches!(self, Address::Id(_))
    }

    pub fn key(&self) -> Option<&PublicKeyBytes> {
        match self {
            Address::Key(key) => Some(key),
            Address::Id(_) => None,
        }
    }

    pub fn wallet_id(&self) -> Option<WalletId> {
        match self {
            Address::Key(_) => None,
            Address::Id(id) => Some(*id),
        }
    }

    pub(crate) fn encode(&self, writer: &mut ByteWriter) {
        match self {
            Address::Key(key) => {
                writer.put_u8(ADDRESS_TAG_KEY);
                writer.put_raw(key);
            }
            Address::Id(id) => {
                writer.put_u8(ADDRESS_TAG_ID);
                writer.put_u32(*id);
            }
        }
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> ChainResult<Self> {
        match reader.get_u8()? {
            ADDRESS_TAG_KEY => Ok(Address::Key(reader.get_array()?)),
            ADDRESS_TAG_ID => Ok(Address::Id(reader.get_u32()?)),
            tag => Err(crate::errors::ChainError::Codec(format!(
                "unknown address tag {tag}"
            ))),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Key(key) => write!(f, "Key({})", hex::encode(key)),
            Address::Id(id) => write!(f, "Id({id})"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Key(key) => f.write_str(&hex::encode(key)),
            Address::Id(id) => write!(f, "wallet#{id}"),
        }
    }
}
