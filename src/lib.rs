// walstore storage engine

pub mod common;
pub mod database;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use database::{Database, DatabaseConfig, DatabaseError};
pub use storage::buffer::{BufferGuard, BufferPoolError, BufferPoolManager};
pub use storage::page::{Page, PageError, TablePage};
pub use transaction::{IsolationLevel, Transaction, TransactionError, TransactionManager};
