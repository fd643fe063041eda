// Represents an active database transaction

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;
use thiserror::Error;

use crate::common::types::{BlockId, LogPosition, Rid, TxnId};
use crate::storage::buffer::{BufferPoolError, BufferPoolManager};
use crate::storage::disk::FileError;
use crate::storage::page::{PageError, TablePage};
use crate::transaction::concurrency::lock_table::{LockError, LockMode, LockTable};
use crate::transaction::concurrency::transaction_manager::ActiveTransactions;
use crate::transaction::recovery::{RecoveryError, RecoveryManager};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Reads take no locks
    ReadUncommitted,
    /// Shared locks are released as soon as the read is done
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Transaction states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Errors that can occur during transaction processing
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("Transaction {0} is already committed or aborted")]
    InvalidState(TxnId),

    #[error("Lock error: {0}")]
    LockError(#[from] LockError),

    #[error("Buffer pool error: {0}")]
    BufferPoolError(#[from] BufferPoolError),

    #[error("Recovery error: {0}")]
    RecoveryError(#[from] RecoveryError),

    #[error("Page error: {0}")]
    PageError(#[from] PageError),

    #[error("File error: {0}")]
    FileError(#[from] FileError),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// A unit of work over pages. Every change is locked, logged and applied
/// through the buffer pool; commit and abort go through the
/// [`TransactionManager`](super::TransactionManager).
pub struct Transaction {
    id: TxnId,
    state: TransactionState,
    isolation_level: IsolationLevel,
    pool: Arc<BufferPoolManager>,
    lock_table: Arc<LockTable>,
    /// Held shared by every logged operation, exclusively while a
    /// checkpoint writes its BEGIN record
    checkpoint_latch: Arc<RwLock<()>>,
    active: Arc<ActiveTransactions>,
    recovery: RecoveryManager,
    locks: HashMap<BlockId, LockMode>,
}

impl Transaction {
    pub(crate) fn new(
        recovery: RecoveryManager,
        isolation_level: IsolationLevel,
        pool: Arc<BufferPoolManager>,
        lock_table: Arc<LockTable>,
        checkpoint_latch: Arc<RwLock<()>>,
        active: Arc<ActiveTransactions>,
    ) -> Self {
        Self {
            id: recovery.txn_id(),
            state: TransactionState::Active,
            isolation_level,
            pool,
            lock_table,
            checkpoint_latch,
            active,
            recovery,
            locks: HashMap::new(),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn recovery(&self) -> &RecoveryManager {
        &self.recovery
    }

    /// Locks this transaction holds for its whole lifetime
    pub fn held_locks(&self) -> &HashMap<BlockId, LockMode> {
        &self.locks
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(TransactionError::InvalidState(self.id));
        }
        Ok(())
    }

    fn slock(&mut self, block: &BlockId) -> Result<()> {
        if self.locks.contains_key(block) {
            return Ok(());
        }
        self.lock_table.lock_shared(self.id, block)?;
        self.locks.insert(block.clone(), LockMode::Shared);
        Ok(())
    }

    fn xlock(&mut self, block: &BlockId) -> Result<()> {
        if self.locks.get(block) == Some(&LockMode::Exclusive) {
            return Ok(());
        }
        self.lock_table.lock_exclusive(self.id, block)?;
        self.locks.insert(block.clone(), LockMode::Exclusive);
        Ok(())
    }

    /// Run a read of `block` under the lock the isolation level asks for
    fn read_locked<T>(&mut self, block: &BlockId, read: impl FnOnce(&BufferPoolManager) -> Result<T>) -> Result<T> {
        self.ensure_active()?;
        let short_lock = match self.isolation_level {
            IsolationLevel::ReadUncommitted => return read(self.pool.as_ref()),
            IsolationLevel::ReadCommitted => !self.locks.contains_key(block),
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable => false,
        };

        if short_lock {
            self.lock_table.lock_shared(self.id, block)?;
            let result = read(self.pool.as_ref());
            self.lock_table.unlock(self.id, block);
            result
        } else {
            self.slock(block)?;
            read(self.pool.as_ref())
        }
    }

    /// Block used to serialize file growth with `block_count`
    fn end_of_file(file_name: &str) -> BlockId {
        BlockId::new(file_name, u32::MAX)
    }

    pub fn get_int(&mut self, block: &BlockId, offset: usize) -> Result<i32> {
        self.read_locked(block, |pool| {
            let guard = pool.pin(block)?;
            let value = guard.page().get_int(offset)?;
            Ok(value)
        })
    }

    pub fn get_string(&mut self, block: &BlockId, offset: usize) -> Result<String> {
        self.read_locked(block, |pool| {
            let guard = pool.pin(block)?;
            let value = guard.page().get_string(offset)?;
            Ok(value)
        })
    }

    /// Write an integer. With `should_log` false the change is not logged
    /// and therefore neither undone nor redone.
    pub fn set_int(&mut self, block: &BlockId, offset: usize, value: i32, should_log: bool) -> Result<()> {
        self.ensure_active()?;
        self.xlock(block)?;

        let guard = self.pool.pin(block)?;
        let _quiesce = self.checkpoint_latch.read();
        let position = {
            let mut page = guard.page_mut();
            let old_value = page.get_int(offset)?;
            let position = if should_log {
                self.recovery.log_set_int(block, offset as u32, old_value, value)?
            } else {
                LogPosition::default()
            };
            page.set_int(offset, value)?;
            if should_log {
                page.set_lsn(position.lsn);
            }
            position
        };
        guard.set_modified(self.id, position)?;
        Ok(())
    }

    pub fn set_string(&mut self, block: &BlockId, offset: usize, value: &str, should_log: bool) -> Result<()> {
        self.ensure_active()?;
        self.xlock(block)?;

        let guard = self.pool.pin(block)?;
        let _quiesce = self.checkpoint_latch.read();
        let position = {
            let mut page = guard.page_mut();
            let mut scratch = page.clone();
            let old_value = scratch.get_string(offset)?;
            scratch.set_string(offset, value)?;
            let position = if should_log {
                let position = self.recovery.log_set_string(block, offset as u32, &old_value, value)?;
                scratch.set_lsn(position.lsn);
                position
            } else {
                LogPosition::default()
            };
            *page = scratch;
            position
        };
        guard.set_modified(self.id, position)?;
        Ok(())
    }

    /// Number of blocks in `file_name`
    pub fn block_count(&mut self, file_name: &str) -> Result<u32> {
        let eof = Self::end_of_file(file_name);
        self.read_locked(&eof, |pool| Ok(pool.file_manager().block_count(file_name)?))
    }

    /// Extend `file_name` by one zeroed block, logged as INITPAGE so that a
    /// rollback shrinks the file again
    pub fn append_block(&mut self, file_name: &str) -> Result<BlockId> {
        self.ensure_active()?;
        self.xlock(&Self::end_of_file(file_name))?;

        let block = {
            let _quiesce = self.checkpoint_latch.read();
            let block_number = self.pool.file_manager().block_count(file_name)?;
            // Forced before the file grows
            self.recovery.log_init_page(file_name, block_number)?;
            self.pool.file_manager().set_file_size(file_name, block_number + 1)?;
            BlockId::new(file_name, block_number)
        };
        self.xlock(&block)?;
        debug!("Transaction {} appended {}", self.id, block);
        Ok(block)
    }

    /// Store a tuple in `block`, returning its RID
    pub fn insert_tuple(&mut self, block: &BlockId, tuple: &[u8]) -> Result<Rid> {
        self.ensure_active()?;
        self.xlock(block)?;

        let guard = self.pool.pin(block)?;
        let _quiesce = self.checkpoint_latch.read();
        let (rid, position) = {
            let mut page = guard.page_mut();
            let mut scratch = page.clone();
            let slot = TablePage::insert(&mut scratch, tuple)?;
            let rid = Rid::new(block.number(), slot);
            let position = self.recovery.log_insert(block.file_name(), rid, tuple)?;
            scratch.set_lsn(position.lsn);
            *page = scratch;
            (rid, position)
        };
        guard.set_modified(self.id, position)?;
        Ok(rid)
    }

    /// Remove the tuple at `rid`, returning it
    pub fn delete_tuple(&mut self, file_name: &str, rid: Rid) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let block = rid.block(file_name);
        self.xlock(&block)?;

        let guard = self.pool.pin(&block)?;
        let _quiesce = self.checkpoint_latch.read();
        let (old, position) = {
            let mut page = guard.page_mut();
            let mut scratch = page.clone();
            let old = TablePage::delete(&mut scratch, rid.slot)?;
            let position = self.recovery.log_delete(file_name, rid, &old)?;
            scratch.set_lsn(position.lsn);
            *page = scratch;
            (old, position)
        };
        guard.set_modified(self.id, position)?;
        Ok(old)
    }

    /// Replace the tuple at `rid`, returning the previous one
    pub fn update_tuple(&mut self, file_name: &str, rid: Rid, tuple: &[u8]) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let block = rid.block(file_name);
        self.xlock(&block)?;

        let guard = self.pool.pin(&block)?;
        let _quiesce = self.checkpoint_latch.read();
        let (old, position) = {
            let mut page = guard.page_mut();
            let mut scratch = page.clone();
            let old = TablePage::update(&mut scratch, rid.slot, tuple)?;
            let position = self.recovery.log_update(file_name, rid, &old, tuple)?;
            scratch.set_lsn(position.lsn);
            *page = scratch;
            (old, position)
        };
        guard.set_modified(self.id, position)?;
        Ok(old)
    }

    pub fn get_tuple(&mut self, file_name: &str, rid: Rid) -> Result<Vec<u8>> {
        let block = rid.block(file_name);
        self.read_locked(&block, |pool| {
            let guard = pool.pin(&block)?;
            let tuple = TablePage::get(&guard.page(), rid.slot)?;
            Ok(tuple)
        })
    }

    /// Live tuples of `block` with their RIDs
    pub fn scan_block(&mut self, block: &BlockId) -> Result<Vec<(Rid, Vec<u8>)>> {
        let number = block.number();
        self.read_locked(block, |pool| {
            let guard = pool.pin(block)?;
            let tuples = TablePage::tuples(&guard.page())?
                .into_iter()
                .map(|(slot, tuple)| (Rid::new(number, slot), tuple))
                .collect();
            Ok(tuples)
        })
    }

    pub(crate) fn commit(&mut self, force_pages: bool) -> Result<()> {
        self.ensure_active()?;
        if force_pages {
            self.pool.flush_all_for(self.id)?;
        }
        {
            let _quiesce = self.checkpoint_latch.read();
            self.recovery.commit()?;
        }
        self.state = TransactionState::Committed;
        self.release_locks();
        {
            let _quiesce = self.checkpoint_latch.read();
            self.active.lock().remove(&self.id);
            self.recovery.log_txn_end()?;
        }
        debug!("Transaction {} committed", self.id);
        Ok(())
    }

    /// Undo everything, then release locks. Locks are released even when
    /// the rollback fails.
    pub(crate) fn rollback(&mut self) -> Result<()> {
        self.ensure_active()?;
        self.state = TransactionState::Aborted;
        let result = {
            let _quiesce = self.checkpoint_latch.read();
            let result = self.recovery.rollback();
            self.active.lock().remove(&self.id);
            result
        };
        self.release_locks();
        result?;
        debug!("Transaction {} aborted", self.id);
        Ok(())
    }

    fn release_locks(&mut self) {
        self.lock_table.release_all(self.id);
        self.locks.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != TransactionState::Active {
            return;
        }
        warn!("Transaction {} dropped while active, rolling it back", self.id);
        if let Err(e) = self.rollback() {
            warn!("Failed to roll back transaction {}: {}", self.id, e);
        }
    }
}
