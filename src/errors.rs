use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("storage is not open")]
    NotOpen,
    #[error("chain integrity error: {0}")]
    ChainIntegrity(String),
    #[error("data integrity error: {0}")]
    DataIntegrity(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("operation cancelled by user")]
    UserCancelled,
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("malformed encoding: {0}")]
    Codec(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("transaction rejected: {0}")]
    Transaction(String),
    #[error("contract error: {0}")]
    Contract(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;
