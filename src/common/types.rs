use std::fmt;

use serde::{Deserialize, Serialize};

/// Default block size in bytes (8KB)
pub const PAGE_SIZE: usize = 8192;

/// Bytes reserved at the start of every block for the page LSN
pub const PAGE_LSN_SIZE: usize = 8;

/// First offset clients may write to
pub const PAGE_DATA_OFFSET: usize = PAGE_LSN_SIZE;

/// Transaction ID type
pub type TxnId = u32;

/// Buffer pool frame ID type
pub type FrameId = u32;

/// LSN (Log Sequence Number) type
pub type Lsn = u64;

/// LSN value meaning "no record"
pub const INVALID_LSN: Lsn = 0;

/// Identifies a block by the file it lives in and its position within that file
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId {
    file_name: String,
    number: u32,
}

impl BlockId {
    pub fn new(file_name: impl Into<String>, number: u32) -> Self {
        Self {
            file_name: file_name.into(),
            number,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn number(&self) -> u32 {
        self.number
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[file {}, block {}]", self.file_name, self.number)
    }
}

/// Record ID: a slot inside a block of a table file
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub block_number: u32,
    pub slot: u32,
}

impl Rid {
    pub fn new(block_number: u32, slot: u32) -> Self {
        Self { block_number, slot }
    }

    /// The block this record lives in
    pub fn block(&self, file_name: &str) -> BlockId {
        BlockId::new(file_name, self.block_number)
    }
}

impl fmt::Display for Rid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.block_number, self.slot)
    }
}

/// Where a log record was written: its LSN and its byte offset in the log file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LogPosition {
    pub lsn: Lsn,
    pub offset: u64,
}

impl LogPosition {
    pub fn new(lsn: Lsn, offset: u64) -> Self {
        Self { lsn, offset }
    }
}
