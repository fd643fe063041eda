use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::common::types::{Lsn, INVALID_LSN};

/// Error type for log buffer operations
#[derive(Error, Debug)]
pub enum LogBufferError {
    #[error("Log buffer is full")]
    BufferFull,

    #[error("Record of {size} bytes exceeds the log block capacity of {capacity} bytes")]
    RecordTooLarge { size: usize, capacity: usize },

    #[error("Corrupt log block: {0}")]
    Corrupt(String),
}

/// Result type for log buffer operations
pub type Result<T> = std::result::Result<T, LogBufferError>;

/// Size of the boundary field at the start of every log block
pub const BOUNDARY_SIZE: usize = 4;

/// Size of the length prefix in front of every record
pub const FRAME_SIZE: usize = 4;

/// Frame flag: the record goes on in the first frame of the next block
pub const FRAME_MORE: u32 = 1 << 31;

/// Frame flag: this frame carries the rest of a record begun in the
/// previous block
pub const FRAME_CONTINUED: u32 = 1 << 30;

/// Bits of the frame prefix holding the fragment length
pub const FRAME_LEN_MASK: u32 = FRAME_CONTINUED - 1;

/// Smallest first fragment of a record spanning blocks, so that its LSN
/// always sits in the block where it starts
pub const MIN_FIRST_FRAGMENT: usize = 8;

/// One frame of a log block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub bytes: &'a [u8],
    /// The record continues in the next block
    pub more: bool,
    /// The frame continues a record from the previous block
    pub continued: bool,
}

impl Frame<'_> {
    /// Bytes the frame takes in its block, prefix included
    pub fn framed_len(&self) -> usize {
        FRAME_SIZE + self.bytes.len()
    }
}

/// In-memory image of the tail block of the log file.
///
/// A block starts with a `u32` boundary holding the number of bytes in use
/// (boundary included), followed by records framed as `u32 len + bytes`.
/// A record larger than what is left in a block is cut into fragments;
/// the two high bits of the prefix link a fragment to its neighbours.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    data: Vec<u8>,
    /// Largest LSN stored in this block
    max_lsn: Lsn,
}

impl LogBuffer {
    /// Create an empty block of `block_size` bytes
    pub fn new(block_size: usize) -> Self {
        let mut buffer = Self {
            data: vec![0; block_size],
            max_lsn: INVALID_LSN,
        };
        buffer.set_used(BOUNDARY_SIZE);
        buffer
    }

    /// Load a block read back from the log file
    pub fn from_block(data: Vec<u8>, max_lsn: Lsn) -> Result<Self> {
        let buffer = Self { data, max_lsn };
        let used = buffer.used();
        if used < BOUNDARY_SIZE || used > buffer.data.len() {
            return Err(LogBufferError::Corrupt(format!("boundary {} out of range", used)));
        }
        Ok(buffer)
    }

    /// Bytes in use, boundary included
    pub fn used(&self) -> usize {
        LittleEndian::read_u32(&self.data[0..BOUNDARY_SIZE]) as usize
    }

    fn set_used(&mut self, used: usize) {
        LittleEndian::write_u32(&mut self.data[0..BOUNDARY_SIZE], used as u32);
    }

    /// Largest payload a single block can hold
    pub fn capacity(&self) -> usize {
        self.data.len() - BOUNDARY_SIZE - FRAME_SIZE
    }

    /// Check if the block has room for a record of `len` bytes
    pub fn has_space(&self, len: usize) -> bool {
        self.used() + FRAME_SIZE + len <= self.data.len()
    }

    /// Payload bytes the next frame of this block can carry
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.used() + FRAME_SIZE)
    }

    /// Append a framed record, returning its position within the block
    pub fn append(&mut self, lsn: Lsn, record: &[u8]) -> Result<usize> {
        if record.len() > self.capacity() {
            return Err(LogBufferError::RecordTooLarge {
                size: record.len(),
                capacity: self.capacity(),
            });
        }
        self.append_fragment(record, 0, lsn)
    }

    /// Append one fragment with the given `FRAME_*` flags. `lsn` counts
    /// towards the block's largest LSN; pass [`INVALID_LSN`] for a
    /// fragment that does not complete its record.
    pub fn append_fragment(&mut self, fragment: &[u8], flags: u32, lsn: Lsn) -> Result<usize> {
        if !self.has_space(fragment.len()) {
            return Err(LogBufferError::BufferFull);
        }

        let pos = self.used();
        let prefix = fragment.len() as u32 | (flags & (FRAME_MORE | FRAME_CONTINUED));
        LittleEndian::write_u32(&mut self.data[pos..pos + FRAME_SIZE], prefix);
        self.data[pos + FRAME_SIZE..pos + FRAME_SIZE + fragment.len()].copy_from_slice(fragment);
        self.set_used(pos + FRAME_SIZE + fragment.len());

        if lsn > self.max_lsn {
            self.max_lsn = lsn;
        }
        Ok(pos)
    }

    /// Drop every frame from `pos` on
    pub fn truncate(&mut self, pos: usize) {
        let pos = pos.clamp(BOUNDARY_SIZE, self.used());
        self.data[pos..].fill(0);
        self.set_used(pos);
    }

    /// Frame at `pos`
    pub fn read_at(&self, pos: usize) -> Result<Frame<'_>> {
        read_frame(&self.data, pos)
    }

    /// Reset the block for reuse
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.set_used(BOUNDARY_SIZE);
        self.max_lsn = INVALID_LSN;
    }

    /// The whole block as written to disk
    pub fn content(&self) -> &[u8] {
        &self.data
    }

    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn
    }

    pub fn is_empty(&self) -> bool {
        self.used() == BOUNDARY_SIZE
    }
}

/// Read the frame at `pos` in a raw log block
pub fn read_frame(block: &[u8], pos: usize) -> Result<Frame<'_>> {
    let used = block_used(block)?;
    if pos < BOUNDARY_SIZE || pos + FRAME_SIZE > used {
        return Err(LogBufferError::Corrupt(format!("no record at position {}", pos)));
    }
    let prefix = LittleEndian::read_u32(&block[pos..pos + FRAME_SIZE]);
    let len = (prefix & FRAME_LEN_MASK) as usize;
    let start = pos + FRAME_SIZE;
    if start + len > used {
        return Err(LogBufferError::Corrupt(format!(
            "record at {} runs past boundary {}",
            pos, used
        )));
    }
    let frame = Frame {
        bytes: &block[start..start + len],
        more: prefix & FRAME_MORE != 0,
        continued: prefix & FRAME_CONTINUED != 0,
    };
    // Only the last frame of a block may go on, only the first may continue
    if frame.more && start + len != used {
        return Err(LogBufferError::Corrupt(format!("fragment at {} is not last in its block", pos)));
    }
    if frame.continued && pos != BOUNDARY_SIZE {
        return Err(LogBufferError::Corrupt(format!("continuation at {} is not first in its block", pos)));
    }
    Ok(frame)
}

/// Boundary of a raw log block, validated against its length
pub fn block_used(block: &[u8]) -> Result<usize> {
    if block.len() < BOUNDARY_SIZE {
        return Err(LogBufferError::Corrupt("block shorter than its boundary".to_string()));
    }
    let used = LittleEndian::read_u32(&block[0..BOUNDARY_SIZE]) as usize;
    if used > block.len() {
        return Err(LogBufferError::Corrupt(format!("boundary {} out of range", used)));
    }
    // An all-zero block was allocated but never written
    Ok(used.max(BOUNDARY_SIZE))
}
