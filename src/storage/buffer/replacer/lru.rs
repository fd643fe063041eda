use linked_hash_map::LinkedHashMap;

use crate::common::types::FrameId;

/// LRU (Least Recently Used) replacement over unpinned frames.
///
/// Only frames whose pin count dropped to zero are tracked, so a victim
/// is never pinned.
pub struct LRUReplacer {
    lru_list: LinkedHashMap<FrameId, ()>,
}

impl LRUReplacer {
    pub fn new(pool_size: usize) -> Self {
        Self {
            lru_list: LinkedHashMap::with_capacity(pool_size),
        }
    }

    /// A frame became unpinned; it is now the most recently used candidate
    pub fn record_unpinned(&mut self, frame_id: FrameId) {
        self.lru_list.remove(&frame_id);
        self.lru_list.insert(frame_id, ());
    }

    /// Remove a frame from the replacer, e.g. because it was pinned again
    pub fn remove(&mut self, frame_id: FrameId) {
        self.lru_list.remove(&frame_id);
    }

    /// Victim selection: take the least recently unpinned frame
    pub fn victim(&mut self) -> Option<FrameId> {
        self.lru_list.pop_front().map(|(frame_id, _)| frame_id)
    }

    pub fn len(&self) -> usize {
        self.lru_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru_list.is_empty()
    }
}
