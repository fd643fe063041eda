use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use log::{debug, error, info};

use crate::common::types::{BlockId, LogPosition, Lsn, TxnId, INVALID_LSN};
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::recovery::apply;
use crate::transaction::recovery::error::{RecoveryError, Result};
use crate::transaction::wal::log_record::{
    CheckpointContent, DirtyPageEntry, LogRecordBody, TransactionTableEntry, TxnStatus, SYSTEM_TXN_ID,
};
use crate::transaction::wal::{LogManager, LogRecord};

/// Output of the analysis pass
#[derive(Debug, Default)]
pub struct AnalysisResult {
    /// Offset of the CHECKPOINTBEGIN analysis started from (0 without a checkpoint)
    pub begin_offset: u64,
    pub transaction_table: HashMap<TxnId, TransactionTableEntry>,
    pub dirty_page_table: HashMap<BlockId, DirtyPageEntry>,
    /// Offset of every record seen, for undo
    pub offsets: HashMap<Lsn, u64>,
    pub max_txn_id: TxnId,
    pub records_scanned: usize,
}

impl AnalysisResult {
    /// Where redo has to start reading
    pub fn redo_start(&self) -> u64 {
        self.dirty_page_table
            .values()
            .map(|entry| entry.rec_offset)
            .fold(self.begin_offset, u64::min)
    }

    pub fn undergoing(&self) -> impl Iterator<Item = &TransactionTableEntry> {
        self.transaction_table
            .values()
            .filter(|entry| entry.status == TxnStatus::Undergoing)
    }
}

/// Summary of a completed restart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    pub records_scanned: usize,
    pub pages_redone: usize,
    pub records_undone: usize,
    /// Transactions rolled back
    pub transactions_undone: usize,
    /// Committed transactions that only needed their TXNEND
    pub transactions_ended: usize,
    /// Largest transaction id found in the log
    pub max_txn_id: TxnId,
}

/// ARIES restart: analysis, redo, undo.
///
/// Runs before any transaction is admitted; it assumes exclusive use of
/// the log and the buffer pool.
pub struct CrashRecovery {
    log: Arc<LogManager>,
    pool: Arc<BufferPoolManager>,
}

impl CrashRecovery {
    pub fn new(log: Arc<LogManager>, pool: Arc<BufferPoolManager>) -> Self {
        Self { log, pool }
    }

    /// Bring the database back to a state holding exactly the committed
    /// transactions, then flush log and pages.
    pub fn recover(&self) -> Result<RecoveryStats> {
        info!("Starting crash recovery");
        let mut analysis = self.analysis()?;
        info!(
            "Analysis done: {} records, {} transactions, {} dirty pages",
            analysis.records_scanned,
            analysis.transaction_table.len(),
            analysis.dirty_page_table.len()
        );

        let pages_redone = self.redo(&analysis)?;
        info!("Redo done: {} records re-applied", pages_redone);

        let (records_undone, transactions_undone, transactions_ended) = self.undo(&mut analysis)?;
        info!(
            "Undo done: {} records undone across {} transactions",
            records_undone, transactions_undone
        );

        self.log.flush_all()?;
        self.pool.flush_all()?;

        Ok(RecoveryStats {
            records_scanned: analysis.records_scanned,
            pages_redone,
            records_undone,
            transactions_undone,
            transactions_ended,
            max_txn_id: analysis.max_txn_id,
        })
    }

    fn latest_checkpoint(&self) -> Result<Option<CheckpointContent>> {
        let offset = match self.log.read_master()? {
            Some(offset) => offset,
            None => return Ok(None),
        };
        let record = self.log.read_record_at(offset)?;
        match record.body {
            LogRecordBody::CheckpointEnd(content) => Ok(Some(content)),
            _ => {
                error!("Master record points at {} instead of a CHECKPOINTEND", record);
                Err(RecoveryError::CorruptLog(format!(
                    "master record points at {:?} record at offset {}",
                    record.record_type(),
                    offset
                )))
            }
        }
    }

    /// Rebuild the transaction and dirty page tables as of the crash
    pub fn analysis(&self) -> Result<AnalysisResult> {
        let mut result = AnalysisResult::default();

        if let Some(checkpoint) = self.latest_checkpoint()? {
            debug!(
                "Seeding analysis from checkpoint at offset {}",
                checkpoint.begin_offset
            );
            result.begin_offset = checkpoint.begin_offset;
            result.max_txn_id = checkpoint.next_txn_id.saturating_sub(1);
            for entry in checkpoint.transaction_table {
                result.max_txn_id = result.max_txn_id.max(entry.txn_id);
                result.transaction_table.insert(entry.txn_id, entry);
            }
            for entry in checkpoint.dirty_page_table {
                result.dirty_page_table.insert(entry.block.clone(), entry);
            }
        }

        // Records of checkpointed transactions may precede the checkpoint;
        // index them too so undo can find them.
        let scan_start = result
            .transaction_table
            .values()
            .map(|entry| entry.first_offset)
            .fold(result.redo_start(), u64::min);

        for item in self.log.iter_records_from(scan_start)? {
            let (offset, record) = item?;
            result.offsets.insert(record.lsn, offset);
            if offset < result.begin_offset {
                continue;
            }
            result.records_scanned += 1;
            Self::analyze_record(&mut result, &record, offset);
        }
        Ok(result)
    }

    fn analyze_record(result: &mut AnalysisResult, record: &LogRecord, offset: u64) {
        if record.txn_id == SYSTEM_TXN_ID {
            return;
        }
        result.max_txn_id = result.max_txn_id.max(record.txn_id);

        if let LogRecordBody::TxnEnd = record.body {
            result.transaction_table.remove(&record.txn_id);
            return;
        }

        let entry = result
            .transaction_table
            .entry(record.txn_id)
            .or_insert_with(|| TransactionTableEntry {
                txn_id: record.txn_id,
                last_lsn: INVALID_LSN,
                status: TxnStatus::Undergoing,
                first_offset: offset,
            });
        entry.last_lsn = entry.last_lsn.max(record.lsn);
        if let LogRecordBody::Commit = record.body {
            entry.status = TxnStatus::Committed;
        }

        if let Some(block) = record.target_block() {
            result
                .dirty_page_table
                .entry(block.clone())
                .or_insert(DirtyPageEntry {
                    block,
                    rec_lsn: record.lsn,
                    rec_offset: offset,
                });
        }
    }

    /// Repeat history from the redo start. Returns how many page records
    /// were re-applied. Running it again changes nothing.
    pub fn redo(&self, analysis: &AnalysisResult) -> Result<usize> {
        let start = analysis.redo_start();
        debug!("Redo starts at offset {}", start);

        let mut redone = 0;
        // Last length change seen per file: Some(n) means shrink to n blocks
        let mut shrink_to: HashMap<String, Option<u32>> = HashMap::new();

        for item in self.log.iter_records_from(start)? {
            let (offset, record) = item?;
            match &record.body {
                LogRecordBody::InitPage(c) => {
                    if record.is_clr {
                        shrink_to.insert(c.file_name.clone(), Some(c.block_number));
                    } else {
                        apply::extend_file(&self.pool, &c.file_name, c.block_number)?;
                        shrink_to.insert(c.file_name.clone(), None);
                    }
                }
                _ => {
                    let block = match record.target_block() {
                        Some(block) => block,
                        None => continue,
                    };
                    let needs_redo = analysis
                        .dirty_page_table
                        .get(&block)
                        .map_or(false, |entry| record.lsn >= entry.rec_lsn);
                    if needs_redo
                        && apply::redo_page(&self.pool, &record, LogPosition::new(record.lsn, offset))?
                    {
                        redone += 1;
                    }
                }
            }
        }

        // Shrinks are applied last so that a block re-created after an
        // undone extension is not cut off again.
        for (file_name, blocks) in shrink_to {
            if let Some(blocks) = blocks {
                apply::shrink_file(&self.pool, &file_name, blocks)?;
            }
        }
        Ok(redone)
    }

    /// Roll back every loser, newest record first across all of them.
    /// Returns (records undone, transactions undone, transactions ended).
    pub fn undo(&self, analysis: &mut AnalysisResult) -> Result<(usize, usize, usize)> {
        let mut heap: BinaryHeap<(Lsn, TxnId)> = BinaryHeap::new();
        let mut last_lsns: HashMap<TxnId, Lsn> = HashMap::new();
        let mut ended = 0;

        let mut entries: Vec<TransactionTableEntry> = analysis.transaction_table.values().cloned().collect();
        entries.sort_by_key(|entry| entry.txn_id);
        for entry in entries {
            match entry.status {
                TxnStatus::Committed => {
                    let mut end = LogRecord::new_txn_end(entry.txn_id, entry.last_lsn);
                    self.log.append(&mut end)?;
                    analysis.transaction_table.remove(&entry.txn_id);
                    ended += 1;
                }
                TxnStatus::Undergoing => {
                    heap.push((entry.last_lsn, entry.txn_id));
                    last_lsns.insert(entry.txn_id, entry.last_lsn);
                }
            }
        }

        let mut undone = 0;
        let mut rolled_back = 0;
        while let Some((lsn, txn_id)) = heap.pop() {
            let next = if lsn == INVALID_LSN {
                INVALID_LSN
            } else {
                let offset = *analysis.offsets.get(&lsn).ok_or_else(|| {
                    RecoveryError::CorruptLog(format!("no record with LSN {} for transaction {}", lsn, txn_id))
                })?;
                let record = self.log.read_record_at(offset)?;
                if record.txn_id != txn_id {
                    return Err(RecoveryError::CorruptLog(format!(
                        "LSN {} belongs to transaction {}, not {}",
                        lsn, record.txn_id, txn_id
                    )));
                }

                if record.is_clr {
                    record.undo_next_lsn
                } else if let LogRecordBody::Begin = record.body {
                    INVALID_LSN
                } else if record.is_undoable() {
                    let prev_lsn = last_lsns.get(&txn_id).copied().unwrap_or(INVALID_LSN);
                    let position = apply::undo(&self.pool, &self.log, &record, prev_lsn)?;
                    last_lsns.insert(txn_id, position.lsn);
                    undone += 1;
                    record.prev_lsn
                } else {
                    record.prev_lsn
                }
            };

            if next == INVALID_LSN {
                let prev_lsn = last_lsns.get(&txn_id).copied().unwrap_or(INVALID_LSN);
                self.log.append(&mut LogRecord::new_txn_end(txn_id, prev_lsn))?;
                analysis.transaction_table.remove(&txn_id);
                rolled_back += 1;
                debug!("Transaction {} rolled back", txn_id);
            } else {
                heap.push((next, txn_id));
            }
        }
        Ok((undone, rolled_back, ended))
    }
}
