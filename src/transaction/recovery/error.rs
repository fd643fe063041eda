use thiserror::Error;

use crate::storage::buffer::BufferPoolError;
use crate::storage::disk::FileError;
use crate::storage::page::PageError;
use crate::transaction::wal::{LogManagerError, LogRecordError};

/// Error type for rollback, crash recovery and checkpoints
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),

    #[error("Log record error: {0}")]
    LogRecordError(#[from] LogRecordError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Page error: {0}")]
    PageError(#[from] PageError),

    #[error("File error: {0}")]
    FileError(#[from] FileError),

    /// A page or file does not hold what the log says it should
    #[error("Recovery invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Corrupt log: {0}")]
    CorruptLog(String),
}

/// Result type for recovery operations
pub type Result<T> = std::result::Result<T, RecoveryError>;
