use std::sync::Arc;
use std::time::{Duration, Instant};

use log::info;
use parking_lot::Mutex;

use crate::common::types::LogPosition;
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::concurrency::TransactionManager;
use crate::transaction::recovery::error::Result;
use crate::transaction::wal::log_record::CheckpointContent;
use crate::transaction::wal::{LogManager, LogRecord};

/// Configuration for checkpointing
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// Interval between checkpoints
    pub checkpoint_interval: Duration,

    /// Whether dirty pages stay in memory during a checkpoint. When false
    /// every dirty page is written before CHECKPOINTEND.
    pub fuzzy_checkpoint: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(300),
            fuzzy_checkpoint: true,
        }
    }
}

/// Writes CHECKPOINTBEGIN/CHECKPOINTEND pairs and keeps the master record
/// pointing at the latest one
pub struct CheckpointManager {
    config: CheckpointConfig,
    log_manager: Arc<LogManager>,
    buffer_pool: Arc<BufferPoolManager>,
    txn_manager: Arc<TransactionManager>,
    last_checkpoint: Mutex<Instant>,
}

impl CheckpointManager {
    pub fn new(
        config: CheckpointConfig,
        log_manager: Arc<LogManager>,
        buffer_pool: Arc<BufferPoolManager>,
        txn_manager: Arc<TransactionManager>,
    ) -> Self {
        Self {
            config,
            log_manager,
            buffer_pool,
            txn_manager,
            last_checkpoint: Mutex::new(Instant::now()),
        }
    }

    /// Take a checkpoint; returns the position of its CHECKPOINTEND
    pub fn checkpoint(&self) -> Result<LogPosition> {
        let begin = {
            // No logged operation may be half done when BEGIN is written
            let _quiesced = self.txn_manager.checkpoint_latch().write();
            self.log_manager.append(&mut LogRecord::new_checkpoint_begin())?
        };

        if !self.config.fuzzy_checkpoint {
            self.buffer_pool.flush_all()?;
        }

        let content = CheckpointContent {
            begin_offset: begin.offset,
            next_txn_id: self.txn_manager.next_txn_id(),
            transaction_table: self.txn_manager.active_transaction_table(),
            dirty_page_table: self.buffer_pool.dirty_page_table(),
        };
        let (txns, pages) = (content.transaction_table.len(), content.dirty_page_table.len());

        let end = self.log_manager.append(&mut LogRecord::new_checkpoint_end(content))?;
        self.log_manager.flush(end.lsn)?;
        self.log_manager.write_master(end.offset)?;
        *self.last_checkpoint.lock() = Instant::now();

        info!(
            "Checkpoint at LSN {}: {} active transactions, {} dirty pages",
            end.lsn, txns, pages
        );
        Ok(end)
    }

    /// Whether the configured interval has passed since the last checkpoint
    pub fn checkpoint_needed(&self) -> bool {
        self.last_checkpoint.lock().elapsed() >= self.config.checkpoint_interval
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }
}
