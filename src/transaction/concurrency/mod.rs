// Transaction concurrency module exports

pub mod lock_table;
pub mod transaction;
pub mod transaction_manager;

// Public exports
pub use lock_table::{LockError, LockMode, LockTable};
pub use transaction::{IsolationLevel, Transaction, TransactionError, TransactionState};
pub use transaction_manager::TransactionManager;
