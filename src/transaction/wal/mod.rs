// Write-Ahead Logging Module

pub mod iterator;
pub mod log_buffer;
pub mod log_manager;
pub mod log_record;
pub mod master;

pub use iterator::{LogIterator, LogRecordIterator};
pub use log_manager::{LogManager, LogManagerConfig, LogManagerError, LogStats, Result};
pub use log_record::{LogRecord, LogRecordBody, LogRecordError, LogRecordType};
