use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::PAGE_DATA_OFFSET;

pub const HEADER_OFFSET: usize = PAGE_DATA_OFFSET;
pub const HEADER_SIZE: usize = 12; // 4 bytes per field * 3 fields
pub const RECORD_OFFSET_SIZE: usize = 8; // 4 bytes for offset + 4 bytes for length

/// First byte available for tuple data
pub const DATA_START: usize = HEADER_OFFSET + HEADER_SIZE;

/// Slot array entry. Slots grow backwards from the end of the page,
/// tuple data grows forwards from the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub offset: u32,
    pub length: u32,
}

impl RecordLocation {
    /// Deleted slots keep their position but point nowhere
    pub const EMPTY: RecordLocation = RecordLocation { offset: 0, length: 0 };

    pub fn is_empty(&self) -> bool {
        self.offset == 0
    }

    pub fn to_bytes(&self) -> [u8; RECORD_OFFSET_SIZE] {
        let mut bytes = [0u8; RECORD_OFFSET_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.offset);
        LittleEndian::write_u32(&mut bytes[4..8], self.length);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let offset = LittleEndian::read_u32(&bytes[0..4]);
        let length = LittleEndian::read_u32(&bytes[4..8]);
        Self { offset, length }
    }
}

/// Start of a slot array holding `count` entries, or `None` when that many
/// entries would run into the header
pub fn slots_start(page_size: usize, count: u32) -> Option<usize> {
    RECORD_OFFSET_SIZE
        .checked_mul(count as usize)
        .and_then(|len| page_size.checked_sub(len))
        .filter(|start| *start >= DATA_START)
}

/// Position of the slot entry for `slot` in a page of `page_size` bytes
pub fn slot_position(page_size: usize, slot: u32) -> Option<usize> {
    slots_start(page_size, slot.checked_add(1)?)
}
