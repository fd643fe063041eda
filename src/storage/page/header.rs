use byteorder::{ByteOrder, LittleEndian};

use crate::storage::page::layout::{DATA_START, HEADER_OFFSET, HEADER_SIZE};

/// Header of a slotted table page, stored right after the page LSN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TablePageHeader {
    pub free_space_offset: u32,
    pub record_count: u32,
    pub live_count: u32,
}

impl Default for TablePageHeader {
    fn default() -> Self {
        Self::new()
    }
}

impl TablePageHeader {
    pub fn new() -> Self {
        Self {
            free_space_offset: DATA_START as u32,
            record_count: 0,
            live_count: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.free_space_offset);
        LittleEndian::write_u32(&mut bytes[4..8], self.record_count);
        LittleEndian::write_u32(&mut bytes[8..12], self.live_count);
        bytes
    }

    /// Read the header from raw page bytes. A freshly appended (all zero)
    /// block decodes as an empty page.
    pub fn from_page_bytes(data: &[u8]) -> Self {
        let bytes = &data[HEADER_OFFSET..HEADER_OFFSET + HEADER_SIZE];
        let free_space_offset = LittleEndian::read_u32(&bytes[0..4]);
        if free_space_offset == 0 {
            return Self::new();
        }
        Self {
            free_space_offset,
            record_count: LittleEndian::read_u32(&bytes[4..8]),
            live_count: LittleEndian::read_u32(&bytes[8..12]),
        }
    }

    pub fn write_to(&self, data: &mut [u8]) {
        data[HEADER_OFFSET..HEADER_OFFSET + HEADER_SIZE].copy_from_slice(&self.to_bytes());
    }
}
