use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{BlockId, FrameId, LogPosition, TxnId, INVALID_LSN};
use crate::storage::buffer::error::{BufferPoolError, Result};
use crate::storage::buffer::frame::{Frame, FrameMeta};
use crate::storage::buffer::guard::BufferGuard;
use crate::storage::buffer::replacer::LRUReplacer;
use crate::storage::disk::FileManager;
use crate::transaction::wal::log_record::DirtyPageEntry;
use crate::transaction::wal::LogManager;

/// Configuration for the buffer pool
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames
    pub pool_size: usize,

    /// How long `pin` waits for a frame before giving up
    pub pin_timeout: Duration,

    /// Write a dirty page back as soon as its pin count drops to zero
    pub flush_on_unpin: bool,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            pin_timeout: Duration::from_secs(10),
            flush_on_unpin: true,
        }
    }
}

/// Counters reported by [`BufferPoolManager::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferPoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub writes: u64,
}

/// Everything guarded by the pool lock
struct PoolState {
    metas: Vec<FrameMeta>,
    page_table: HashMap<BlockId, FrameId>,
    free_list: VecDeque<FrameId>,
    replacer: LRUReplacer,
    stats: BufferPoolStats,
}

/// Fixed set of frames caching disk blocks.
///
/// Lock order is pool lock, then a frame latch, then the log lock. The
/// pool lock is held across page I/O, which keeps the frame table and the
/// on-disk state in step.
pub struct BufferPoolManager {
    config: BufferPoolConfig,
    frames: Vec<Frame>,
    state: Mutex<PoolState>,
    frame_released: Condvar,
    file_manager: Arc<FileManager>,
    log_manager: Arc<LogManager>,
}

impl BufferPoolManager {
    pub fn new(
        config: BufferPoolConfig,
        file_manager: Arc<FileManager>,
        log_manager: Arc<LogManager>,
    ) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(BufferPoolError::InvalidOperation(
                "buffer pool needs at least one frame".to_string(),
            ));
        }

        let block_size = file_manager.block_size();
        let frames = (0..config.pool_size).map(|_| Frame::new(block_size)).collect();
        let free_list = (0..config.pool_size as FrameId).collect();

        Ok(Self {
            state: Mutex::new(PoolState {
                metas: vec![FrameMeta::default(); config.pool_size],
                page_table: HashMap::with_capacity(config.pool_size),
                free_list,
                replacer: LRUReplacer::new(config.pool_size),
                stats: BufferPoolStats::default(),
            }),
            config,
            frames,
            frame_released: Condvar::new(),
            file_manager,
            log_manager,
        })
    }

    pub fn file_manager(&self) -> &Arc<FileManager> {
        &self.file_manager
    }

    pub fn log_manager(&self) -> &Arc<LogManager> {
        &self.log_manager
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size
    }

    pub(crate) fn frame(&self, frame_id: FrameId) -> &Frame {
        &self.frames[frame_id as usize]
    }

    /// Pin `block`, reading it from disk if it is not resident. Blocks
    /// for up to `pin_timeout` when every frame is pinned.
    pub fn pin(&self, block: &BlockId) -> Result<BufferGuard<'_>> {
        let started = Instant::now();
        let deadline = started + self.config.pin_timeout;
        let mut state = self.state.lock();

        loop {
            if let Some(frame_id) = self.try_pin(&mut state, block)? {
                return Ok(BufferGuard::new(self, frame_id, block.clone()));
            }

            debug!("All frames pinned, waiting for a frame for {}", block);
            if self.frame_released.wait_until(&mut state, deadline).timed_out() {
                if let Some(frame_id) = self.try_pin(&mut state, block)? {
                    return Ok(BufferGuard::new(self, frame_id, block.clone()));
                }
                warn!("Timed out waiting for a frame for {}", block);
                return Err(BufferPoolError::Timeout {
                    block: block.clone(),
                    waited: started.elapsed(),
                });
            }
        }
    }

    /// Pin without waiting; `None` means no frame can be freed right now
    fn try_pin(&self, state: &mut PoolState, block: &BlockId) -> Result<Option<FrameId>> {
        if let Some(&frame_id) = state.page_table.get(block) {
            let meta = &mut state.metas[frame_id as usize];
            if meta.pin_count == 0 {
                state.replacer.remove(frame_id);
            }
            meta.pin_count += 1;
            state.stats.hits += 1;
            return Ok(Some(frame_id));
        }

        let frame_id = match self.choose_victim(state)? {
            Some(frame_id) => frame_id,
            None => return Ok(None),
        };

        {
            let mut page = self.frame(frame_id).page.write();
            if let Err(e) = self.file_manager.read(block, &mut page) {
                state.free_list.push_back(frame_id);
                return Err(e.into());
            }
        }
        state.metas[frame_id as usize].assign(block.clone());
        state.page_table.insert(block.clone(), frame_id);
        state.stats.misses += 1;
        debug!("Read {} into frame {}", block, frame_id);
        Ok(Some(frame_id))
    }

    /// Take a free frame, or evict the least recently unpinned one after
    /// writing back its dirty content
    fn choose_victim(&self, state: &mut PoolState) -> Result<Option<FrameId>> {
        if let Some(frame_id) = state.free_list.pop_front() {
            return Ok(Some(frame_id));
        }
        let frame_id = match state.replacer.victim() {
            Some(frame_id) => frame_id,
            None => return Ok(None),
        };

        if let Err(e) = self.write_frame(state, frame_id) {
            state.replacer.record_unpinned(frame_id);
            return Err(e);
        }
        let meta = std::mem::take(&mut state.metas[frame_id as usize]);
        if let Some(old) = meta.block {
            debug!("Evicting {} from frame {}", old, frame_id);
            state.page_table.remove(&old);
        }
        state.stats.evictions += 1;
        Ok(Some(frame_id))
    }

    /// Write a dirty frame to disk, forcing the log up to its LSN first
    fn write_frame(&self, state: &mut PoolState, frame_id: FrameId) -> Result<()> {
        let meta = &state.metas[frame_id as usize];
        if !meta.is_dirty() {
            return Ok(());
        }
        let block = match &meta.block {
            Some(block) => block.clone(),
            None => return Ok(()),
        };

        {
            let page = self.frame(frame_id).page.read();
            // WAL: the log must cover the page before the page hits disk
            self.log_manager.flush(meta.lsn.max(page.lsn()))?;
            self.file_manager.write(&block, &page)?;
        }
        state.metas[frame_id as usize].mark_clean();
        state.stats.writes += 1;
        debug!("Wrote {} from frame {}", block, frame_id);
        Ok(())
    }

    pub(crate) fn unpin(&self, frame_id: FrameId) -> Result<()> {
        let mut state = self.state.lock();
        let meta = &mut state.metas[frame_id as usize];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::InvalidOperation(format!(
                "frame {} is not pinned",
                frame_id
            )));
        }
        meta.pin_count -= 1;
        if meta.pin_count > 0 {
            return Ok(());
        }

        state.replacer.record_unpinned(frame_id);
        self.frame_released.notify_all();
        if self.config.flush_on_unpin {
            self.write_frame(&mut state, frame_id)?;
        }
        Ok(())
    }

    pub(crate) fn set_modified(&self, frame_id: FrameId, txn: TxnId, position: LogPosition) -> Result<()> {
        let mut state = self.state.lock();
        let meta = &mut state.metas[frame_id as usize];
        if meta.pin_count == 0 {
            return Err(BufferPoolError::InvalidOperation(format!(
                "frame {} modified while unpinned",
                frame_id
            )));
        }
        meta.set_modified(txn, position);
        Ok(())
    }

    /// Append a new zeroed block to `file_name` and pin it
    pub fn new_page(&self, file_name: &str) -> Result<BufferGuard<'_>> {
        let block = self.file_manager.append(file_name)?;
        self.pin(&block)
    }

    /// Grow the file so `block` exists, then pin it
    pub fn new_page_at(&self, block: &BlockId) -> Result<BufferGuard<'_>> {
        let count = self.file_manager.block_count(block.file_name())?;
        if count <= block.number() {
            self.file_manager
                .set_file_size(block.file_name(), block.number() + 1)?;
        }
        self.pin(block)
    }

    /// Shrink `file_name` to `blocks` blocks, dropping cached copies of the
    /// removed blocks. Fails if one of them is pinned.
    pub fn truncate_file(&self, file_name: &str, blocks: u32) -> Result<()> {
        let mut state = self.state.lock();
        let doomed: Vec<(BlockId, FrameId)> = state
            .page_table
            .iter()
            .filter(|(block, _)| block.file_name() == file_name && block.number() >= blocks)
            .map(|(block, &frame_id)| (block.clone(), frame_id))
            .collect();

        if let Some((block, _)) = doomed
            .iter()
            .find(|(_, frame_id)| state.metas[*frame_id as usize].pin_count > 0)
        {
            return Err(BufferPoolError::InvalidOperation(format!(
                "cannot truncate pinned {}",
                block
            )));
        }

        for (block, frame_id) in doomed {
            state.page_table.remove(&block);
            state.replacer.remove(frame_id);
            state.metas[frame_id as usize] = FrameMeta::default();
            state.free_list.push_back(frame_id);
        }
        self.file_manager.set_file_size(file_name, blocks)?;
        self.frame_released.notify_all();
        Ok(())
    }

    /// Write back every page dirtied by `txn`
    pub fn flush_all_for(&self, txn: TxnId) -> Result<()> {
        let mut state = self.state.lock();
        let frame_ids: Vec<FrameId> = (0..self.frames.len() as FrameId)
            .filter(|&id| state.metas[id as usize].modifying_txn == Some(txn))
            .collect();
        for frame_id in frame_ids {
            self.write_frame(&mut state, frame_id)?;
        }
        Ok(())
    }

    /// Write back every dirty page
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        let mut written = 0;
        for frame_id in 0..self.frames.len() as FrameId {
            if state.metas[frame_id as usize].is_dirty() {
                self.write_frame(&mut state, frame_id)?;
                written += 1;
            }
        }
        info!("Flushed {} dirty pages", written);
        Ok(())
    }

    /// Dirty pages with logged changes, for checkpoints
    pub fn dirty_page_table(&self) -> Vec<DirtyPageEntry> {
        let state = self.state.lock();
        state
            .metas
            .iter()
            .filter(|meta| meta.is_dirty() && meta.rec_lsn != INVALID_LSN)
            .filter_map(|meta| {
                meta.block.as_ref().map(|block| DirtyPageEntry {
                    block: block.clone(),
                    rec_lsn: meta.rec_lsn,
                    rec_offset: meta.rec_offset,
                })
            })
            .collect()
    }

    /// Current pin count of `block`, zero when not resident
    pub fn pin_count(&self, block: &BlockId) -> u32 {
        let state = self.state.lock();
        state
            .page_table
            .get(block)
            .map(|&frame_id| state.metas[frame_id as usize].pin_count)
            .unwrap_or(0)
    }

    /// Frames that could be handed out without waiting
    pub fn available(&self) -> usize {
        let state = self.state.lock();
        state.free_list.len() + state.replacer.len()
    }

    pub fn is_resident(&self, block: &BlockId) -> bool {
        self.state.lock().page_table.contains_key(block)
    }

    pub fn block_in_frame(&self, frame_id: FrameId) -> Option<BlockId> {
        self.state
            .lock()
            .metas
            .get(frame_id as usize)
            .and_then(|meta| meta.block.clone())
    }

    pub fn stats(&self) -> BufferPoolStats {
        self.state.lock().stats
    }
}
