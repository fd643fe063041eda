use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Lsn, PAGE_DATA_OFFSET, PAGE_LSN_SIZE};
use crate::storage::page::error::PageError;

const INT_SIZE: usize = 4;
const LEN_PREFIX_SIZE: usize = 4;

/// A block-sized byte buffer with typed accessors.
///
/// Bytes `0..PAGE_LSN_SIZE` hold the LSN of the last log record applied to
/// the page. The typed setters refuse to write there; logged changes stamp
/// it through [`Page::set_lsn`] while holding the page latch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    data: Vec<u8>,
}

impl Page {
    pub fn new(block_size: usize) -> Self {
        Self {
            data: vec![0; block_size],
        }
    }

    /// Wrap existing bytes, e.g. a block read straight from disk
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Zero the whole page, LSN included
    pub fn reset(&mut self) {
        self.data.fill(0);
    }

    pub fn lsn(&self) -> Lsn {
        LittleEndian::read_u64(&self.data[0..PAGE_LSN_SIZE])
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        LittleEndian::write_u64(&mut self.data[0..PAGE_LSN_SIZE], lsn);
    }

    pub fn get_int(&self, offset: usize) -> Result<i32, PageError> {
        let bytes = self.slice(offset, INT_SIZE)?;
        Ok(LittleEndian::read_i32(bytes))
    }

    pub fn set_int(&mut self, offset: usize, value: i32) -> Result<(), PageError> {
        let bytes = self.slice_mut(offset, INT_SIZE)?;
        LittleEndian::write_i32(bytes, value);
        Ok(())
    }

    pub fn get_bytes(&self, offset: usize) -> Result<Vec<u8>, PageError> {
        let len = LittleEndian::read_u32(self.slice(offset, LEN_PREFIX_SIZE)?) as usize;
        Ok(self.slice(offset + LEN_PREFIX_SIZE, len)?.to_vec())
    }

    pub fn set_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<(), PageError> {
        // Check the full extent before touching anything
        self.check(offset, Self::max_length(bytes.len()))?;
        LittleEndian::write_u32(self.slice_mut(offset, LEN_PREFIX_SIZE)?, bytes.len() as u32);
        self.slice_mut(offset + LEN_PREFIX_SIZE, bytes.len())?
            .copy_from_slice(bytes);
        Ok(())
    }

    pub fn get_string(&self, offset: usize) -> Result<String, PageError> {
        String::from_utf8(self.get_bytes(offset)?).map_err(|_| PageError::InvalidUtf8)
    }

    pub fn set_string(&mut self, offset: usize, value: &str) -> Result<(), PageError> {
        self.set_bytes(offset, value.as_bytes())
    }

    /// Bytes needed to store a blob or string of `len` bytes
    pub fn max_length(len: usize) -> usize {
        LEN_PREFIX_SIZE + len
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), PageError> {
        if offset < PAGE_DATA_OFFSET {
            return Err(PageError::ReservedOffset(offset));
        }
        match offset.checked_add(len) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(PageError::OutOfBounds {
                offset,
                len,
                size: self.data.len(),
            }),
        }
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&[u8], PageError> {
        self.check(offset, len)?;
        Ok(&self.data[offset..offset + len])
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], PageError> {
        self.check(offset, len)?;
        Ok(&mut self.data[offset..offset + len])
    }
}
