use parking_lot::RwLock;

use crate::common::types::{BlockId, LogPosition, Lsn, TxnId, INVALID_LSN};
use crate::storage::page::Page;

/// A buffer slot. The latch guards page content only; the bookkeeping
/// lives in [`FrameMeta`] under the pool lock.
pub struct Frame {
    pub(crate) page: RwLock<Page>,
}

impl Frame {
    pub fn new(block_size: usize) -> Self {
        Self {
            page: RwLock::new(Page::new(block_size)),
        }
    }
}

/// Per-frame bookkeeping, guarded by the pool lock
#[derive(Debug, Clone, Default)]
pub struct FrameMeta {
    pub block: Option<BlockId>,
    pub pin_count: u32,
    /// Transaction that dirtied the frame; `None` means clean
    pub modifying_txn: Option<TxnId>,
    /// Last LSN written while dirty
    pub lsn: Lsn,
    /// First logged change since the frame was last clean
    pub rec_lsn: Lsn,
    pub rec_offset: u64,
}

impl FrameMeta {
    pub fn is_dirty(&self) -> bool {
        self.modifying_txn.is_some()
    }

    /// Record a change by `txn`. An invalid position marks an unlogged change.
    pub fn set_modified(&mut self, txn: TxnId, position: LogPosition) {
        self.modifying_txn = Some(txn);
        if position.lsn == INVALID_LSN {
            return;
        }
        if self.rec_lsn == INVALID_LSN {
            self.rec_lsn = position.lsn;
            self.rec_offset = position.offset;
        }
        self.lsn = self.lsn.max(position.lsn);
    }

    pub fn mark_clean(&mut self) {
        self.modifying_txn = None;
        self.lsn = INVALID_LSN;
        self.rec_lsn = INVALID_LSN;
        self.rec_offset = 0;
    }

    /// Point the frame at a freshly read block, pinned once
    pub fn assign(&mut self, block: BlockId) {
        *self = Self {
            block: Some(block),
            pin_count: 1,
            ..Self::default()
        };
    }
}
