use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::info;
use thiserror::Error;

use crate::common::types::{LogPosition, PAGE_DATA_OFFSET, PAGE_SIZE};
use crate::storage::buffer::{BufferPoolConfig, BufferPoolError, BufferPoolManager};
use crate::storage::disk::{FileError, FileManager};
use crate::transaction::concurrency::{IsolationLevel, LockTable, Transaction, TransactionError, TransactionManager};
use crate::transaction::recovery::{CheckpointConfig, CheckpointManager, CrashRecovery, RecoveryError, RecoveryStats};
use crate::transaction::wal::{LogManager, LogManagerConfig, LogManagerError};

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("File error: {0}")]
    FileError(#[from] FileError),

    #[error("Log manager error: {0}")]
    LogManagerError(#[from] LogManagerError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Recovery error: {0}")]
    RecoveryError(#[from] RecoveryError),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Configuration for a database directory
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Directory holding the data files and the log
    pub db_dir: PathBuf,

    /// Size of data blocks and log blocks
    pub block_size: usize,

    /// Number of buffer pool frames
    pub pool_size: usize,

    /// How long a pin waits for a free frame
    pub pin_timeout: Duration,

    /// How long a lock request waits before failing
    pub lock_timeout: Duration,

    /// Name of the log file inside `db_dir`
    pub log_file_name: String,

    /// Sync the log on every flush
    pub force_sync: bool,

    /// Write dirty pages back as soon as they are unpinned
    pub flush_on_unpin: bool,

    /// Write a transaction's pages before its COMMIT record
    pub force_pages_on_commit: bool,

    pub checkpoint: CheckpointConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("walstore_data"),
            block_size: PAGE_SIZE,
            pool_size: 64,
            pin_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(10),
            log_file_name: "walstore.log".to_string(),
            force_sync: true,
            flush_on_unpin: true,
            force_pages_on_commit: false,
            checkpoint: CheckpointConfig::default(),
        }
    }
}

impl DatabaseConfig {
    pub fn new(db_dir: impl AsRef<Path>) -> Self {
        Self {
            db_dir: db_dir.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    pub fn log_path(&self) -> PathBuf {
        self.db_dir.join(&self.log_file_name)
    }

    fn validate(&self) -> Result<()> {
        // Room for the page LSN, a table page header and one slot
        if self.block_size < PAGE_DATA_OFFSET + 64 {
            return Err(DatabaseError::InvalidConfig(format!(
                "block size {} is too small",
                self.block_size
            )));
        }
        if self.pool_size == 0 {
            return Err(DatabaseError::InvalidConfig("pool size must be positive".to_string()));
        }
        if self.log_file_name.is_empty() {
            return Err(DatabaseError::InvalidConfig("log file name is empty".to_string()));
        }
        Ok(())
    }
}

/// One open database: file manager, log, buffer pool, lock table and
/// transaction manager. Opening runs crash recovery before any
/// transaction can start.
pub struct Database {
    config: DatabaseConfig,
    file_manager: Arc<FileManager>,
    log_manager: Arc<LogManager>,
    buffer_pool: Arc<BufferPoolManager>,
    txn_manager: Arc<TransactionManager>,
    checkpoint_manager: CheckpointManager,
    recovery_stats: RecoveryStats,
}

impl Database {
    pub fn open(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.db_dir)?;

        let file_manager = Arc::new(FileManager::new(&config.db_dir, config.block_size)?);
        let log_manager = Arc::new(LogManager::new(LogManagerConfig {
            log_path: config.log_path(),
            block_size: config.block_size,
            force_sync: config.force_sync,
        })?);
        let buffer_pool = Arc::new(BufferPoolManager::new(
            BufferPoolConfig {
                pool_size: config.pool_size,
                pin_timeout: config.pin_timeout,
                flush_on_unpin: config.flush_on_unpin,
            },
            Arc::clone(&file_manager),
            Arc::clone(&log_manager),
        )?);

        let recovery_stats = CrashRecovery::new(Arc::clone(&log_manager), Arc::clone(&buffer_pool)).recover()?;

        let lock_table = Arc::new(LockTable::new(config.lock_timeout));
        let txn_manager = Arc::new(TransactionManager::new(
            Arc::clone(&log_manager),
            Arc::clone(&buffer_pool),
            lock_table,
            recovery_stats.max_txn_id + 1,
            config.force_pages_on_commit,
        ));
        let checkpoint_manager = CheckpointManager::new(
            config.checkpoint.clone(),
            Arc::clone(&log_manager),
            Arc::clone(&buffer_pool),
            Arc::clone(&txn_manager),
        );

        info!(
            "Opened database in {:?} (next transaction id {})",
            config.db_dir,
            txn_manager.next_txn_id()
        );

        Ok(Self {
            config,
            file_manager,
            log_manager,
            buffer_pool,
            txn_manager,
            checkpoint_manager,
            recovery_stats,
        })
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Result<Transaction> {
        Ok(self.txn_manager.begin(isolation_level)?)
    }

    pub fn commit(&self, txn: Transaction) -> Result<()> {
        Ok(self.txn_manager.commit(txn)?)
    }

    pub fn abort(&self, txn: Transaction) -> Result<()> {
        Ok(self.txn_manager.abort(txn)?)
    }

    /// Take a checkpoint now
    pub fn checkpoint(&self) -> Result<LogPosition> {
        Ok(self.checkpoint_manager.checkpoint()?)
    }

    /// Take a checkpoint if the configured interval has passed
    pub fn maybe_checkpoint(&self) -> Result<Option<LogPosition>> {
        if self.checkpoint_manager.checkpoint_needed() {
            return self.checkpoint().map(Some);
        }
        Ok(None)
    }

    /// Checkpoint and write everything out. Transactions still running
    /// are rolled back by the next open.
    pub fn close(self) -> Result<()> {
        self.checkpoint()?;
        self.buffer_pool.flush_all()?;
        self.log_manager.flush_all()?;
        info!("Closed database in {:?}", self.config.db_dir);
        Ok(())
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPoolManager> {
        &self.buffer_pool
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.txn_manager
    }

    /// What crash recovery did when this database was opened
    pub fn recovery_stats(&self) -> &RecoveryStats {
        &self.recovery_stats
    }
}
