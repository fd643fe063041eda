use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use thiserror::Error;

use crate::common::types::{BlockId, TxnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Transaction {txn_id} gave up on a {mode:?} lock on {block} after {waited:?}")]
    LockConflict {
        txn_id: TxnId,
        block: BlockId,
        mode: LockMode,
        waited: Duration,
    },
}

pub type Result<T> = std::result::Result<T, LockError>;

#[derive(Debug, Default)]
struct LockState {
    readers: HashSet<TxnId>,
    writer: Option<TxnId>,
    /// Readers waiting to become the writer, served in order
    upgrade_requests: VecDeque<TxnId>,
}

impl LockState {
    fn is_free(&self) -> bool {
        self.readers.is_empty() && self.writer.is_none() && self.upgrade_requests.is_empty()
    }
}

#[derive(Default)]
struct Locks {
    blocks: HashMap<BlockId, LockState>,
    held: HashMap<TxnId, HashSet<BlockId>>,
}

/// Block-level shared/exclusive locks.
///
/// An exclusive lock is always obtained by upgrading a shared one. Waiters
/// give up after the configured timeout with [`LockError::LockConflict`],
/// which is also how deadlocks are broken.
pub struct LockTable {
    locks: Mutex<Locks>,
    released: Condvar,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(Locks::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    pub fn lock_shared(&self, txn_id: TxnId, block: &BlockId) -> Result<()> {
        let mut locks = self.locks.lock();
        self.acquire_shared(&mut locks, txn_id, block)
    }

    fn acquire_shared(&self, locks: &mut MutexGuard<'_, Locks>, txn_id: TxnId, block: &BlockId) -> Result<()> {
        {
            let state = locks.blocks.entry(block.clone()).or_default();
            if state.readers.contains(&txn_id) || state.writer == Some(txn_id) {
                return Ok(());
            }
        }

        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            let state = locks.blocks.entry(block.clone()).or_default();
            if state.writer.is_none() && state.upgrade_requests.is_empty() {
                state.readers.insert(txn_id);
                break;
            }
            if self.released.wait_until(locks, deadline).timed_out() {
                let state = locks.blocks.entry(block.clone()).or_default();
                if state.writer.is_none() && state.upgrade_requests.is_empty() {
                    state.readers.insert(txn_id);
                    break;
                }
                if state.is_free() {
                    locks.blocks.remove(block);
                }
                warn!("Transaction {} timed out waiting for a shared lock on {}", txn_id, block);
                return Err(LockError::LockConflict {
                    txn_id,
                    block: block.clone(),
                    mode: LockMode::Shared,
                    waited: started.elapsed(),
                });
            }
        }

        locks.held.entry(txn_id).or_default().insert(block.clone());
        debug!("Transaction {} holds a shared lock on {}", txn_id, block);
        Ok(())
    }

    /// Take (or upgrade to) an exclusive lock. On timeout the shared lock
    /// taken along the way is kept.
    pub fn lock_exclusive(&self, txn_id: TxnId, block: &BlockId) -> Result<()> {
        let mut locks = self.locks.lock();
        self.acquire_shared(&mut locks, txn_id, block)?;

        {
            let state = locks.blocks.entry(block.clone()).or_default();
            if state.writer == Some(txn_id) {
                return Ok(());
            }
            state.upgrade_requests.push_back(txn_id);
        }

        let started = Instant::now();
        let deadline = started + self.timeout;
        loop {
            let state = locks.blocks.entry(block.clone()).or_default();
            let blocked = state.readers.len() > 1
                || state.writer.is_some()
                || state.upgrade_requests.front() != Some(&txn_id);
            if !blocked {
                state.upgrade_requests.pop_front();
                state.readers.remove(&txn_id);
                state.writer = Some(txn_id);
                break;
            }
            if self.released.wait_until(&mut locks, deadline).timed_out() {
                let state = locks.blocks.entry(block.clone()).or_default();
                state.upgrade_requests.retain(|&id| id != txn_id);
                self.released.notify_all();
                warn!("Transaction {} timed out waiting for an exclusive lock on {}", txn_id, block);
                return Err(LockError::LockConflict {
                    txn_id,
                    block: block.clone(),
                    mode: LockMode::Exclusive,
                    waited: started.elapsed(),
                });
            }
        }

        debug!("Transaction {} holds an exclusive lock on {}", txn_id, block);
        Ok(())
    }

    /// Drop whatever lock `txn_id` has on `block`
    pub fn unlock(&self, txn_id: TxnId, block: &BlockId) {
        let mut locks = self.locks.lock();
        Self::remove_lock(&mut locks, txn_id, block);
        if let Some(held) = locks.held.get_mut(&txn_id) {
            held.remove(block);
            if held.is_empty() {
                locks.held.remove(&txn_id);
            }
        }
        self.released.notify_all();
    }

    /// Drop every lock held by `txn_id`
    pub fn release_all(&self, txn_id: TxnId) {
        let mut locks = self.locks.lock();
        let blocks = locks.held.remove(&txn_id).unwrap_or_default();
        for block in &blocks {
            Self::remove_lock(&mut locks, txn_id, block);
        }
        debug!("Transaction {} released {} locks", txn_id, blocks.len());
        self.released.notify_all();
    }

    fn remove_lock(locks: &mut Locks, txn_id: TxnId, block: &BlockId) {
        if let Some(state) = locks.blocks.get_mut(block) {
            state.readers.remove(&txn_id);
            if state.writer == Some(txn_id) {
                state.writer = None;
            }
            state.upgrade_requests.retain(|&id| id != txn_id);
            if state.is_free() {
                locks.blocks.remove(block);
            }
        }
    }

    /// Mode of the lock `txn_id` holds on `block`, if any
    pub fn lock_mode(&self, txn_id: TxnId, block: &BlockId) -> Option<LockMode> {
        let locks = self.locks.lock();
        let state = locks.blocks.get(block)?;
        if state.writer == Some(txn_id) {
            Some(LockMode::Exclusive)
        } else if state.readers.contains(&txn_id) {
            Some(LockMode::Shared)
        } else {
            None
        }
    }

    /// Number of blocks with at least one lock
    pub fn locked_blocks(&self) -> usize {
        self.locks.lock().blocks.len()
    }
}
