use crate::block::BlockId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    // buffer pool errors
    #[error("out of memory allocating {0} slots")]
    OutOfMemory(usize),
    #[error("block {0} not found in memory")]
    BlockNotFoundInMemory(BlockId),
    // persistence backend errors
    #[error("block {0} not found in persistent storage")]
    BlockNotFoundInPersistentStorage(BlockId),
    #[error("corrupt persistent storage: {0}")]
    CorruptPersistentStorage(String),
    #[error("unable to open file {0}")]
    UnableToOpenFile(String),
    #[error("error reading file {0}")]
    FileReadError(String),
    #[error("error writing file {0}")]
    FileWriteError(String),
    // block content errors, raised by the block instance and
    // propagated through the manager unchanged.
    #[error("tuple of {tuple_bytes} bytes too large for block of {block_bytes} bytes")]
    TupleTooLargeForBlock {
        tuple_bytes: usize,
        block_bytes: usize,
    },
    // configuration errors
    #[error("block domain {0} out of range [1, 65535]")]
    InvalidBlockDomain(u32),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
