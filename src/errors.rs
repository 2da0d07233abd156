use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("chain gap: expected block {expected}, received {received}")]
    ChainGap { expected: u64, received: u64 },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("cryptography error: {0}")]
    Crypto(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("committee desync: {0}")]
    CommitteeDesync(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;
