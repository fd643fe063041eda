// Transaction Management Module

pub mod concurrency;
pub mod recovery;
pub mod wal;

// Public exports
pub use concurrency::{IsolationLevel, Transaction, TransactionError, TransactionManager, TransactionState};
pub use recovery::{CheckpointConfig, CheckpointManager, CrashRecovery, RecoveryError};
pub use wal::log_manager::LogManager;
pub use wal::log_record::{LogRecord, LogRecordType};
