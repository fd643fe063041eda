use log::warn;
use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::types::{BlockId, FrameId, LogPosition, TxnId};
use crate::storage::buffer::error::Result;
use crate::storage::buffer::manager::BufferPoolManager;
use crate::storage::page::Page;

/// A pinned page. Dropping the guard unpins it; use [`BufferGuard::release`]
/// to observe unpin errors (such as a failed write-back).
///
/// Latches returned by `page`/`page_mut` must be dropped before calling
/// `set_modified` or anything else that enters the pool.
pub struct BufferGuard<'a> {
    pool: &'a BufferPoolManager,
    frame_id: FrameId,
    block: BlockId,
    released: bool,
}

impl<'a> BufferGuard<'a> {
    pub(crate) fn new(pool: &'a BufferPoolManager, frame_id: FrameId, block: BlockId) -> Self {
        Self {
            pool,
            frame_id,
            block,
            released: false,
        }
    }

    pub fn block(&self) -> &BlockId {
        &self.block
    }

    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }

    /// Shared latch on the page content
    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.pool.frame(self.frame_id).page.read()
    }

    /// Exclusive latch on the page content
    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        self.pool.frame(self.frame_id).page.write()
    }

    /// Mark the page dirty on behalf of `txn`. `position` is the log
    /// record describing the change; the caller stamps the page LSN itself
    /// while it holds the write latch.
    pub fn set_modified(&self, txn: TxnId, position: LogPosition) -> Result<()> {
        self.pool.set_modified(self.frame_id, txn, position)
    }

    /// Unpin explicitly, reporting any error
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.pool.unpin(self.frame_id)
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.pool.unpin(self.frame_id) {
            warn!("Failed to unpin {} in frame {}: {}", self.block, self.frame_id, e);
        }
    }
}
