use std::time::Duration;

use thiserror::Error;

use crate::common::types::BlockId;
use crate::storage::disk::FileError;
use crate::storage::page::PageError;
use crate::transaction::wal::LogManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Timed out after {waited:?} waiting for a free frame for {block}")]
    Timeout { block: BlockId, waited: Duration },
    #[error("Page {0} not found in buffer pool")]
    PageNotFound(BlockId),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("File error: {0}")]
    FileError(#[from] FileError),
    #[error("Page error: {0}")]
    PageError(#[from] PageError),
    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),
}

pub type Result<T> = std::result::Result<T, BufferPoolError>;
