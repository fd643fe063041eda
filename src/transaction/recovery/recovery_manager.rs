use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};

use crate::common::types::{BlockId, LogPosition, Lsn, Rid, TxnId, INVALID_LSN};
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::recovery::apply;
use crate::transaction::recovery::error::{RecoveryError, Result};
use crate::transaction::wal::log_record::{LogRecordBody, TransactionTableEntry, TxnStatus};
use crate::transaction::wal::{LogManager, LogRecord};

/// Progress of one live transaction, shared with the transaction manager
/// so checkpoints can snapshot it without touching the transaction.
#[derive(Debug, Default)]
pub struct TxnProgress {
    last_lsn: AtomicU64,
    first_offset: AtomicU64,
    committed: AtomicBool,
}

impl TxnProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn.load(Ordering::SeqCst)
    }

    /// Log offset of the BEGIN record
    pub fn first_offset(&self) -> u64 {
        self.first_offset.load(Ordering::SeqCst)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Transaction table row, `None` until BEGIN has been written
    pub fn entry(&self, txn_id: TxnId) -> Option<TransactionTableEntry> {
        let last_lsn = self.last_lsn();
        if last_lsn == INVALID_LSN {
            return None;
        }
        Some(TransactionTableEntry {
            txn_id,
            last_lsn,
            status: if self.is_committed() {
                TxnStatus::Committed
            } else {
                TxnStatus::Undergoing
            },
            first_offset: self.first_offset(),
        })
    }
}

/// Writes the log records of a single transaction and rolls it back.
///
/// Records are chained through `prev_lsn`; the LSN to offset index lets
/// rollback read them back without scanning the log.
pub struct RecoveryManager {
    txn_id: TxnId,
    log: Arc<LogManager>,
    pool: Arc<BufferPoolManager>,
    progress: Arc<TxnProgress>,
    last_lsn: Lsn,
    earliest_lsn: Lsn,
    offsets: HashMap<Lsn, u64>,
}

impl RecoveryManager {
    pub fn new(txn_id: TxnId, log: Arc<LogManager>, pool: Arc<BufferPoolManager>, progress: Arc<TxnProgress>) -> Self {
        Self {
            txn_id,
            log,
            pool,
            progress,
            last_lsn: INVALID_LSN,
            earliest_lsn: INVALID_LSN,
            offsets: HashMap::new(),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// LSN of the latest record written for this transaction
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    /// LSN of the first record written for this transaction
    pub fn earliest_lsn(&self) -> Lsn {
        self.earliest_lsn
    }

    pub fn progress(&self) -> &Arc<TxnProgress> {
        &self.progress
    }

    fn append(&mut self, body: LogRecordBody) -> Result<LogPosition> {
        let mut record = LogRecord::new(self.txn_id, self.last_lsn, body);
        let position = self.log.append(&mut record)?;
        self.track(position);
        Ok(position)
    }

    fn track(&mut self, position: LogPosition) {
        self.last_lsn = position.lsn;
        if self.earliest_lsn == INVALID_LSN {
            self.earliest_lsn = position.lsn;
        }
        self.offsets.insert(position.lsn, position.offset);
        self.progress.last_lsn.store(position.lsn, Ordering::SeqCst);
    }

    pub fn log_begin(&mut self) -> Result<LogPosition> {
        let position = self.append(LogRecordBody::Begin)?;
        self.progress.first_offset.store(position.offset, Ordering::SeqCst);
        Ok(position)
    }

    pub fn log_set_int(&mut self, block: &BlockId, offset: u32, old_value: i32, new_value: i32) -> Result<LogPosition> {
        let record = LogRecord::new_set_int(self.txn_id, self.last_lsn, block.clone(), offset, old_value, new_value);
        self.append(record.body)
    }

    pub fn log_set_string(
        &mut self,
        block: &BlockId,
        offset: u32,
        old_value: &str,
        new_value: &str,
    ) -> Result<LogPosition> {
        let record = LogRecord::new_set_string(
            self.txn_id,
            self.last_lsn,
            block.clone(),
            offset,
            old_value.to_string(),
            new_value.to_string(),
        );
        self.append(record.body)
    }

    pub fn log_insert(&mut self, file_name: &str, rid: Rid, tuple: &[u8]) -> Result<LogPosition> {
        let record = LogRecord::new_insert(self.txn_id, self.last_lsn, file_name, rid, tuple.to_vec());
        self.append(record.body)
    }

    pub fn log_delete(&mut self, file_name: &str, rid: Rid, tuple: &[u8]) -> Result<LogPosition> {
        let record = LogRecord::new_delete(self.txn_id, self.last_lsn, file_name, rid, tuple.to_vec());
        self.append(record.body)
    }

    pub fn log_update(&mut self, file_name: &str, rid: Rid, old_tuple: &[u8], new_tuple: &[u8]) -> Result<LogPosition> {
        let record = LogRecord::new_update(
            self.txn_id,
            self.last_lsn,
            file_name,
            rid,
            old_tuple.to_vec(),
            new_tuple.to_vec(),
        );
        self.append(record.body)
    }

    /// Write INITPAGE and force it. The file grows right after, and a
    /// longer file on disk must always be explained by a durable record.
    pub fn log_init_page(&mut self, file_name: &str, block_number: u32) -> Result<LogPosition> {
        let record = LogRecord::new_init_page(self.txn_id, self.last_lsn, file_name, block_number);
        let position = self.append(record.body)?;
        self.log.flush(position.lsn)?;
        Ok(position)
    }

    /// Write COMMIT and force the log through it
    pub fn commit(&mut self) -> Result<LogPosition> {
        let position = self.append(LogRecordBody::Commit)?;
        self.log.flush(position.lsn)?;
        self.progress.committed.store(true, Ordering::SeqCst);
        debug!("Transaction {} committed at LSN {}", self.txn_id, position.lsn);
        Ok(position)
    }

    /// Write TXNEND without forcing it
    pub fn log_txn_end(&mut self) -> Result<LogPosition> {
        self.append(LogRecordBody::TxnEnd)
    }

    /// Undo every change of this transaction, newest first, then write
    /// TXNEND and flush.
    pub fn rollback(&mut self) -> Result<()> {
        let mut cursor = self.last_lsn;
        self.append(LogRecordBody::Abort)?;

        let mut undone = 0;
        while cursor != INVALID_LSN {
            let offset = *self.offsets.get(&cursor).ok_or_else(|| {
                RecoveryError::CorruptLog(format!(
                    "transaction {} has no record at LSN {}",
                    self.txn_id, cursor
                ))
            })?;
            let record = self.log.read_record_at(offset)?;
            if record.txn_id != self.txn_id || record.lsn != cursor {
                return Err(RecoveryError::CorruptLog(format!(
                    "offset {} holds {}, expected LSN {} of transaction {}",
                    offset, record, cursor, self.txn_id
                )));
            }

            cursor = if record.is_clr {
                record.undo_next_lsn
            } else if matches!(record.body, LogRecordBody::Begin) {
                INVALID_LSN
            } else if record.is_undoable() {
                let position = apply::undo(&self.pool, &self.log, &record, self.last_lsn)?;
                self.track(position);
                undone += 1;
                record.prev_lsn
            } else {
                record.prev_lsn
            };
        }

        let end = self.log_txn_end()?;
        self.log.flush(end.lsn)?;
        info!("Rolled back transaction {} ({} records undone)", self.txn_id, undone);
        Ok(())
    }
}
