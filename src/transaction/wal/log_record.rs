use std::fmt;
use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::types::{BlockId, Lsn, Rid, TxnId, INVALID_LSN};

/// Error type for log record operations
#[derive(Error, Debug)]
pub enum LogRecordError {
    #[error("Log record truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("Unknown log record kind {0}")]
    UnknownKind(u8),

    #[error("Invalid string in log record")]
    InvalidString,

    #[error("Failed to encode checkpoint tables: {0}")]
    SerializationError(String),

    #[error("Failed to decode checkpoint tables: {0}")]
    DeserializationError(String),

    #[error("{0} trailing bytes after log record")]
    TrailingBytes(usize),
}

/// Result type for log record operations
pub type Result<T> = std::result::Result<T, LogRecordError>;

/// Transaction id used by records that belong to no transaction (checkpoints)
pub const SYSTEM_TXN_ID: TxnId = 0;

/// Size of the fixed header:
/// `lsn u64 | txn_id u32 | prev_lsn u64 | kind u8 | is_clr u8 | undo_next_lsn u64`
pub const LOG_RECORD_HEADER_SIZE: usize = 30;

/// Types of log records supported by the WAL system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LogRecordType {
    Begin = 1,
    Commit = 2,
    Abort = 3,
    TxnEnd = 4,
    Insert = 5,
    Delete = 6,
    Update = 7,
    SetInt = 8,
    SetString = 9,
    InitPage = 10,
    CheckpointBegin = 11,
    CheckpointEnd = 12,
}

impl TryFrom<u8> for LogRecordType {
    type Error = LogRecordError;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            1 => Self::Begin,
            2 => Self::Commit,
            3 => Self::Abort,
            4 => Self::TxnEnd,
            5 => Self::Insert,
            6 => Self::Delete,
            7 => Self::Update,
            8 => Self::SetInt,
            9 => Self::SetString,
            10 => Self::InitPage,
            11 => Self::CheckpointBegin,
            12 => Self::CheckpointEnd,
            other => return Err(LogRecordError::UnknownKind(other)),
        })
    }
}

/// Payload of INSERT and DELETE records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TupleContent {
    pub file_name: String,
    pub rid: Rid,
    pub tuple: Vec<u8>,
}

/// Payload of UPDATE records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateContent {
    pub file_name: String,
    pub rid: Rid,
    pub old_tuple: Vec<u8>,
    pub new_tuple: Vec<u8>,
}

/// Payload of byte-level SETINT records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetIntContent {
    pub block: BlockId,
    pub offset: u32,
    pub old_value: i32,
    pub new_value: i32,
}

/// Payload of byte-level SETSTRING records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetStringContent {
    pub block: BlockId,
    pub offset: u32,
    pub old_value: String,
    pub new_value: String,
}

/// Payload of INITPAGE records: `file_name` grew to hold `block_number`.
/// As a CLR it means the file shrinks back to `block_number` blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitPageContent {
    pub file_name: String,
    pub block_number: u32,
}

/// Status of a transaction in the recovery transaction table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnStatus {
    Undergoing,
    Committed,
}

/// One row of the transaction table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionTableEntry {
    pub txn_id: TxnId,
    pub last_lsn: Lsn,
    pub status: TxnStatus,
    /// Log offset of the transaction's BEGIN record
    pub first_offset: u64,
}

/// One row of the dirty page table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyPageEntry {
    pub block: BlockId,
    /// Earliest LSN that dirtied the page
    pub rec_lsn: Lsn,
    /// Log offset of the record carrying `rec_lsn`
    pub rec_offset: u64,
}

/// Payload of CHECKPOINTEND records
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CheckpointContent {
    /// Log offset of the matching CHECKPOINTBEGIN record
    pub begin_offset: u64,
    /// Transaction ids below this were handed out before the checkpoint
    pub next_txn_id: TxnId,
    pub transaction_table: Vec<TransactionTableEntry>,
    pub dirty_page_table: Vec<DirtyPageEntry>,
}

/// Per-kind payload of a log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecordBody {
    Begin,
    Commit,
    Abort,
    TxnEnd,
    Insert(TupleContent),
    Delete(TupleContent),
    Update(UpdateContent),
    SetInt(SetIntContent),
    SetString(SetStringContent),
    InitPage(InitPageContent),
    CheckpointBegin,
    CheckpointEnd(CheckpointContent),
}

/// Main log record structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Log Sequence Number, stamped by the log manager on append
    pub lsn: Lsn,
    /// Transaction that generated this record
    pub txn_id: TxnId,
    /// LSN of the previous record of the same transaction
    pub prev_lsn: Lsn,
    /// Whether this is a compensation record written during undo
    pub is_clr: bool,
    /// For CLRs: the next record of the transaction still owed an undo
    pub undo_next_lsn: Lsn,
    pub body: LogRecordBody,
}

impl LogRecord {
    pub fn new(txn_id: TxnId, prev_lsn: Lsn, body: LogRecordBody) -> Self {
        Self {
            lsn: INVALID_LSN,
            txn_id,
            prev_lsn,
            is_clr: false,
            undo_next_lsn: INVALID_LSN,
            body,
        }
    }

    /// A compensation record whose undo chain continues at `undo_next_lsn`
    pub fn new_clr(txn_id: TxnId, prev_lsn: Lsn, undo_next_lsn: Lsn, body: LogRecordBody) -> Self {
        Self {
            is_clr: true,
            undo_next_lsn,
            ..Self::new(txn_id, prev_lsn, body)
        }
    }

    pub fn new_begin(txn_id: TxnId) -> Self {
        Self::new(txn_id, INVALID_LSN, LogRecordBody::Begin)
    }

    pub fn new_commit(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordBody::Commit)
    }

    pub fn new_abort(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordBody::Abort)
    }

    pub fn new_txn_end(txn_id: TxnId, prev_lsn: Lsn) -> Self {
        Self::new(txn_id, prev_lsn, LogRecordBody::TxnEnd)
    }

    pub fn new_insert(txn_id: TxnId, prev_lsn: Lsn, file_name: &str, rid: Rid, tuple: Vec<u8>) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordBody::Insert(TupleContent {
                file_name: file_name.to_string(),
                rid,
                tuple,
            }),
        )
    }

    pub fn new_delete(txn_id: TxnId, prev_lsn: Lsn, file_name: &str, rid: Rid, tuple: Vec<u8>) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordBody::Delete(TupleContent {
                file_name: file_name.to_string(),
                rid,
                tuple,
            }),
        )
    }

    pub fn new_update(
        txn_id: TxnId,
        prev_lsn: Lsn,
        file_name: &str,
        rid: Rid,
        old_tuple: Vec<u8>,
        new_tuple: Vec<u8>,
    ) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordBody::Update(UpdateContent {
                file_name: file_name.to_string(),
                rid,
                old_tuple,
                new_tuple,
            }),
        )
    }

    pub fn new_set_int(txn_id: TxnId, prev_lsn: Lsn, block: BlockId, offset: u32, old_value: i32, new_value: i32) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordBody::SetInt(SetIntContent {
                block,
                offset,
                old_value,
                new_value,
            }),
        )
    }

    pub fn new_set_string(
        txn_id: TxnId,
        prev_lsn: Lsn,
        block: BlockId,
        offset: u32,
        old_value: String,
        new_value: String,
    ) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordBody::SetString(SetStringContent {
                block,
                offset,
                old_value,
                new_value,
            }),
        )
    }

    pub fn new_init_page(txn_id: TxnId, prev_lsn: Lsn, file_name: &str, block_number: u32) -> Self {
        Self::new(
            txn_id,
            prev_lsn,
            LogRecordBody::InitPage(InitPageContent {
                file_name: file_name.to_string(),
                block_number,
            }),
        )
    }

    pub fn new_checkpoint_begin() -> Self {
        Self::new(SYSTEM_TXN_ID, INVALID_LSN, LogRecordBody::CheckpointBegin)
    }

    pub fn new_checkpoint_end(content: CheckpointContent) -> Self {
        Self::new(SYSTEM_TXN_ID, INVALID_LSN, LogRecordBody::CheckpointEnd(content))
    }

    pub fn record_type(&self) -> LogRecordType {
        match &self.body {
            LogRecordBody::Begin => LogRecordType::Begin,
            LogRecordBody::Commit => LogRecordType::Commit,
            LogRecordBody::Abort => LogRecordType::Abort,
            LogRecordBody::TxnEnd => LogRecordType::TxnEnd,
            LogRecordBody::Insert(_) => LogRecordType::Insert,
            LogRecordBody::Delete(_) => LogRecordType::Delete,
            LogRecordBody::Update(_) => LogRecordType::Update,
            LogRecordBody::SetInt(_) => LogRecordType::SetInt,
            LogRecordBody::SetString(_) => LogRecordType::SetString,
            LogRecordBody::InitPage(_) => LogRecordType::InitPage,
            LogRecordBody::CheckpointBegin => LogRecordType::CheckpointBegin,
            LogRecordBody::CheckpointEnd(_) => LogRecordType::CheckpointEnd,
        }
    }

    /// The page whose content this record changes, if any. INITPAGE changes
    /// a file's length rather than a page and returns `None`.
    pub fn target_block(&self) -> Option<BlockId> {
        match &self.body {
            LogRecordBody::Insert(c) | LogRecordBody::Delete(c) => Some(c.rid.block(&c.file_name)),
            LogRecordBody::Update(c) => Some(c.rid.block(&c.file_name)),
            LogRecordBody::SetInt(c) => Some(c.block.clone()),
            LogRecordBody::SetString(c) => Some(c.block.clone()),
            _ => None,
        }
    }

    /// Records that carry a redo/undo effect
    pub fn is_data_record(&self) -> bool {
        matches!(
            self.body,
            LogRecordBody::Insert(_)
                | LogRecordBody::Delete(_)
                | LogRecordBody::Update(_)
                | LogRecordBody::SetInt(_)
                | LogRecordBody::SetString(_)
                | LogRecordBody::InitPage(_)
        )
    }

    /// Whether undo must visit this record. CLRs are never undone.
    pub fn is_undoable(&self) -> bool {
        self.is_data_record() && !self.is_clr
    }

    /// Serialize the log record to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(LOG_RECORD_HEADER_SIZE + 32);
        // Writes into a Vec cannot fail
        buf.write_u64::<LittleEndian>(self.lsn).ok();
        buf.write_u32::<LittleEndian>(self.txn_id).ok();
        buf.write_u64::<LittleEndian>(self.prev_lsn).ok();
        buf.write_u8(self.record_type() as u8).ok();
        buf.write_u8(self.is_clr as u8).ok();
        buf.write_u64::<LittleEndian>(self.undo_next_lsn).ok();

        match &self.body {
            LogRecordBody::Begin
            | LogRecordBody::Commit
            | LogRecordBody::Abort
            | LogRecordBody::TxnEnd
            | LogRecordBody::CheckpointBegin => {}
            LogRecordBody::Insert(c) | LogRecordBody::Delete(c) => {
                put_str(&mut buf, &c.file_name);
                put_rid(&mut buf, c.rid);
                put_bytes(&mut buf, &c.tuple);
            }
            LogRecordBody::Update(c) => {
                put_str(&mut buf, &c.file_name);
                put_rid(&mut buf, c.rid);
                put_bytes(&mut buf, &c.old_tuple);
                put_bytes(&mut buf, &c.new_tuple);
            }
            LogRecordBody::SetInt(c) => {
                put_block(&mut buf, &c.block);
                buf.write_u32::<LittleEndian>(c.offset).ok();
                buf.write_i32::<LittleEndian>(c.old_value).ok();
                buf.write_i32::<LittleEndian>(c.new_value).ok();
            }
            LogRecordBody::SetString(c) => {
                put_block(&mut buf, &c.block);
                buf.write_u32::<LittleEndian>(c.offset).ok();
                put_str(&mut buf, &c.old_value);
                put_str(&mut buf, &c.new_value);
            }
            LogRecordBody::InitPage(c) => {
                put_str(&mut buf, &c.file_name);
                buf.write_u32::<LittleEndian>(c.block_number).ok();
            }
            LogRecordBody::CheckpointEnd(c) => {
                let tables = bincode::serialize(c)
                    .map_err(|e| LogRecordError::SerializationError(e.to_string()))?;
                put_bytes(&mut buf, &tables);
            }
        }
        Ok(buf)
    }

    /// Deserialize bytes into a log record
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let lsn = r.u64()?;
        let txn_id = r.u32()?;
        let prev_lsn = r.u64()?;
        let kind = LogRecordType::try_from(r.u8()?)?;
        let is_clr = r.u8()? != 0;
        let undo_next_lsn = r.u64()?;

        let body = match kind {
            LogRecordType::Begin => LogRecordBody::Begin,
            LogRecordType::Commit => LogRecordBody::Commit,
            LogRecordType::Abort => LogRecordBody::Abort,
            LogRecordType::TxnEnd => LogRecordBody::TxnEnd,
            LogRecordType::CheckpointBegin => LogRecordBody::CheckpointBegin,
            LogRecordType::Insert | LogRecordType::Delete => {
                let content = TupleContent {
                    file_name: r.string()?,
                    rid: r.rid()?,
                    tuple: r.bytes()?,
                };
                if kind == LogRecordType::Insert {
                    LogRecordBody::Insert(content)
                } else {
                    LogRecordBody::Delete(content)
                }
            }
            LogRecordType::Update => LogRecordBody::Update(UpdateContent {
                file_name: r.string()?,
                rid: r.rid()?,
                old_tuple: r.bytes()?,
                new_tuple: r.bytes()?,
            }),
            LogRecordType::SetInt => LogRecordBody::SetInt(SetIntContent {
                block: r.block()?,
                offset: r.u32()?,
                old_value: r.i32()?,
                new_value: r.i32()?,
            }),
            LogRecordType::SetString => LogRecordBody::SetString(SetStringContent {
                block: r.block()?,
                offset: r.u32()?,
                old_value: r.string()?,
                new_value: r.string()?,
            }),
            LogRecordType::InitPage => LogRecordBody::InitPage(InitPageContent {
                file_name: r.string()?,
                block_number: r.u32()?,
            }),
            LogRecordType::CheckpointEnd => {
                let tables = r.bytes()?;
                let content = bincode::deserialize(&tables)
                    .map_err(|e| LogRecordError::DeserializationError(e.to_string()))?;
                LogRecordBody::CheckpointEnd(content)
            }
        };

        let remaining = r.remaining();
        if remaining != 0 {
            return Err(LogRecordError::TrailingBytes(remaining));
        }

        Ok(Self {
            lsn,
            txn_id,
            prev_lsn,
            is_clr,
            undo_next_lsn,
            body,
        })
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lsn={} txn={} prev={} {:?}",
            self.lsn,
            self.txn_id,
            self.prev_lsn,
            self.record_type()
        )?;
        if self.is_clr {
            write!(f, " CLR undo_next={}", self.undo_next_lsn)?;
        }
        match &self.body {
            LogRecordBody::Insert(c) | LogRecordBody::Delete(c) => {
                write!(f, " {} rid={} tuple={}", c.file_name, c.rid, hex::encode(&c.tuple))
            }
            LogRecordBody::Update(c) => write!(
                f,
                " {} rid={} old={} new={}",
                c.file_name,
                c.rid,
                hex::encode(&c.old_tuple),
                hex::encode(&c.new_tuple)
            ),
            LogRecordBody::SetInt(c) => {
                write!(f, " {} off={} {} -> {}", c.block, c.offset, c.old_value, c.new_value)
            }
            LogRecordBody::SetString(c) => {
                write!(f, " {} off={} {:?} -> {:?}", c.block, c.offset, c.old_value, c.new_value)
            }
            LogRecordBody::InitPage(c) => write!(f, " {} block={}", c.file_name, c.block_number),
            LogRecordBody::CheckpointEnd(c) => write!(
                f,
                " begin_offset={} txns={} dirty_pages={}",
                c.begin_offset,
                c.transaction_table.len(),
                c.dirty_page_table.len()
            ),
            _ => Ok(()),
        }
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.write_u32::<LittleEndian>(bytes.len() as u32).ok();
    buf.extend_from_slice(bytes);
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_rid(buf: &mut Vec<u8>, rid: Rid) {
    buf.write_u32::<LittleEndian>(rid.block_number).ok();
    buf.write_u32::<LittleEndian>(rid.slot).ok();
}

fn put_block(buf: &mut Vec<u8>, block: &BlockId) {
    put_str(buf, block.file_name());
    buf.write_u32::<LittleEndian>(block.number()).ok();
}

/// Bounds checked cursor over a serialized record
struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn remaining(&self) -> usize {
        self.cursor.get_ref().len() - self.cursor.position() as usize
    }

    fn need(&self, needed: usize) -> Result<()> {
        if self.remaining() < needed {
            return Err(LogRecordError::Truncated {
                offset: self.cursor.position() as usize,
                needed,
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8> {
        self.need(1)?;
        self.cursor.read_u8().map_err(|_| self.truncated(1))
    }

    fn u32(&mut self) -> Result<u32> {
        self.need(4)?;
        self.cursor.read_u32::<LittleEndian>().map_err(|_| self.truncated(4))
    }

    fn i32(&mut self) -> Result<i32> {
        self.need(4)?;
        self.cursor.read_i32::<LittleEndian>().map_err(|_| self.truncated(4))
    }

    fn u64(&mut self) -> Result<u64> {
        self.need(8)?;
        self.cursor.read_u64::<LittleEndian>().map_err(|_| self.truncated(8))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        // Length comes from disk: check before allocating
        self.need(len)?;
        let mut out = vec![0u8; len];
        self.cursor.read_exact(&mut out).map_err(|_| self.truncated(len))?;
        Ok(out)
    }

    fn string(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?).map_err(|_| LogRecordError::InvalidString)
    }

    fn rid(&mut self) -> Result<Rid> {
        Ok(Rid::new(self.u32()?, self.u32()?))
    }

    fn block(&mut self) -> Result<BlockId> {
        let file_name = self.string()?;
        Ok(BlockId::new(file_name, self.u32()?))
    }

    fn truncated(&self, needed: usize) -> LogRecordError {
        LogRecordError::Truncated {
            offset: self.cursor.position() as usize,
            needed,
        }
    }
}
