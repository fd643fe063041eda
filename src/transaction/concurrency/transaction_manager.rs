use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::common::types::TxnId;
use crate::storage::buffer::BufferPoolManager;
use crate::transaction::concurrency::lock_table::LockTable;
use crate::transaction::concurrency::transaction::{IsolationLevel, Result, Transaction};
use crate::transaction::recovery::{RecoveryManager, TxnProgress};
use crate::transaction::wal::log_record::TransactionTableEntry;
use crate::transaction::wal::LogManager;

/// Live transactions and their logging progress
pub(crate) type ActiveTransactions = Mutex<HashMap<TxnId, Arc<TxnProgress>>>;

/// Transaction manager - responsible for creating and tracking transactions
pub struct TransactionManager {
    /// Next transaction ID to assign
    next_txn_id: AtomicU32,
    log_manager: Arc<LogManager>,
    buffer_pool: Arc<BufferPoolManager>,
    lock_table: Arc<LockTable>,
    active: Arc<ActiveTransactions>,
    checkpoint_latch: Arc<RwLock<()>>,
    /// Write a transaction's pages before its COMMIT record
    force_pages_on_commit: bool,
}

impl TransactionManager {
    /// `first_txn_id` must be above every id already present in the log
    pub fn new(
        log_manager: Arc<LogManager>,
        buffer_pool: Arc<BufferPoolManager>,
        lock_table: Arc<LockTable>,
        first_txn_id: TxnId,
        force_pages_on_commit: bool,
    ) -> Self {
        Self {
            next_txn_id: AtomicU32::new(first_txn_id.max(1)),
            log_manager,
            buffer_pool,
            lock_table,
            active: Arc::new(Mutex::new(HashMap::new())),
            checkpoint_latch: Arc::new(RwLock::new(())),
            force_pages_on_commit,
        }
    }

    /// Start a transaction; its BEGIN record is written but not forced
    pub fn begin(&self, isolation_level: IsolationLevel) -> Result<Transaction> {
        let _quiesce = self.checkpoint_latch.read();
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let progress = Arc::new(TxnProgress::new());
        self.active.lock().insert(txn_id, Arc::clone(&progress));

        let mut recovery = RecoveryManager::new(
            txn_id,
            Arc::clone(&self.log_manager),
            Arc::clone(&self.buffer_pool),
            progress,
        );
        if let Err(e) = recovery.log_begin() {
            self.active.lock().remove(&txn_id);
            return Err(e.into());
        }
        debug!("Transaction {} started ({:?})", txn_id, isolation_level);

        Ok(Transaction::new(
            recovery,
            isolation_level,
            Arc::clone(&self.buffer_pool),
            Arc::clone(&self.lock_table),
            Arc::clone(&self.checkpoint_latch),
            Arc::clone(&self.active),
        ))
    }

    /// Make `txn` durable and release its locks
    pub fn commit(&self, mut txn: Transaction) -> Result<()> {
        txn.commit(self.force_pages_on_commit)
    }

    /// Undo `txn` and release its locks
    pub fn abort(&self, mut txn: Transaction) -> Result<()> {
        txn.rollback()
    }

    /// Snapshot of the live transactions for a checkpoint
    pub fn active_transaction_table(&self) -> Vec<TransactionTableEntry> {
        let active = self.active.lock();
        let mut table: Vec<TransactionTableEntry> = active
            .iter()
            .filter_map(|(&txn_id, progress)| progress.entry(txn_id))
            .collect();
        table.sort_by_key(|entry| entry.txn_id);
        table
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<TxnId> = self.active.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn transaction_exists(&self, txn_id: TxnId) -> bool {
        self.active.lock().contains_key(&txn_id)
    }

    /// Id the next `begin` will hand out
    pub fn next_txn_id(&self) -> TxnId {
        self.next_txn_id.load(Ordering::SeqCst)
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.lock_table
    }

    /// Latch that keeps checkpoints from splitting a logged operation
    pub fn checkpoint_latch(&self) -> &Arc<RwLock<()>> {
        &self.checkpoint_latch
    }
}
