use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{LogPosition, Lsn, INVALID_LSN, PAGE_SIZE};
use crate::transaction::wal::iterator::{LogIterator, LogRecordIterator};
use crate::transaction::wal::log_buffer::{
    self, LogBuffer, LogBufferError, BOUNDARY_SIZE, FRAME_CONTINUED, FRAME_LEN_MASK, FRAME_MORE, FRAME_SIZE,
    MIN_FIRST_FRAGMENT,
};
use crate::transaction::wal::log_record::{LogRecord, LogRecordError};
use crate::transaction::wal::master::MasterRecord;

/// Error type for log manager operations
#[derive(Error, Debug)]
pub enum LogManagerError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Buffer error: {0}")]
    BufferError(#[from] LogBufferError),

    #[error("Log record error: {0}")]
    LogRecordError(#[from] LogRecordError),

    #[error("Invalid log file format: {0}")]
    InvalidFormat(String),

    #[error("Invalid log record: {0}")]
    InvalidRecord(String),
}

/// Result type for log manager operations
pub type Result<T> = std::result::Result<T, LogManagerError>;

/// Configuration for the log manager
#[derive(Debug, Clone)]
pub struct LogManagerConfig {
    /// Path to the log file
    pub log_path: PathBuf,

    /// Size of a log block; should match the data page size
    pub block_size: usize,

    /// Whether every flush calls `sync_data`
    pub force_sync: bool,
}

impl Default for LogManagerConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("walstore.log"),
            block_size: PAGE_SIZE,
            force_sync: true,
        }
    }
}

/// Snapshot of the log manager counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub next_lsn: Lsn,
    pub flushed_lsn: Lsn,
    /// Offset the next record will be written at (or just before)
    pub end_offset: u64,
    pub blocks: u64,
}

/// Mutable state guarded by the log lock
struct LogState {
    file: File,
    /// Mirror of the tail block of the file
    buffer: LogBuffer,
    /// Block number `buffer` belongs to
    tail_block: u64,
    next_lsn: Lsn,
}

/// Manager for write-ahead logging operations.
///
/// Never calls into the buffer pool, so the pool may call `flush` while
/// holding its own lock.
pub struct LogManager {
    config: LogManagerConfig,
    master_path: PathBuf,
    state: Mutex<LogState>,
    /// Every record with an LSN at or below this has been written out
    flushed_lsn: AtomicU64,
}

impl LogManager {
    /// Open or create the log file. An existing log is scanned once to
    /// find the largest LSN and the tail block.
    pub fn new(config: LogManagerConfig) -> Result<Self> {
        if config.block_size < BOUNDARY_SIZE + FRAME_SIZE + MIN_FIRST_FRAGMENT
            || config.block_size > FRAME_LEN_MASK as usize
        {
            return Err(LogManagerError::InvalidFormat(format!(
                "block size {} too small",
                config.block_size
            )));
        }
        if let Some(parent) = config.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&config.log_path)?;

        let (buffer, tail_block, max_lsn) = Self::scan_existing(&mut file, config.block_size)?;
        let master_path = Self::master_path_for(&config.log_path);

        info!(
            "Opened log {:?}: {} blocks, next LSN {}",
            config.log_path,
            if buffer.is_empty() && tail_block == 0 { 0 } else { tail_block + 1 },
            max_lsn + 1
        );

        Ok(Self {
            config,
            master_path,
            state: Mutex::new(LogState {
                file,
                buffer,
                tail_block,
                next_lsn: max_lsn + 1,
            }),
            flushed_lsn: AtomicU64::new(max_lsn),
        })
    }

    /// Find the largest LSN on disk and load the tail block. A record
    /// whose last fragment never reached the file is cut off, together
    /// with the blocks holding its other fragments.
    fn scan_existing(file: &mut File, block_size: usize) -> Result<(LogBuffer, u64, Lsn)> {
        let len = file.metadata()?.len();
        if len % block_size as u64 != 0 {
            return Err(LogManagerError::InvalidFormat(format!(
                "log length {} is not a multiple of the block size {}",
                len, block_size
            )));
        }
        let blocks = len / block_size as u64;
        if blocks == 0 {
            return Ok((LogBuffer::new(block_size), 0, INVALID_LSN));
        }

        let mut block_maxes = Vec::with_capacity(blocks as usize);
        // Block, position and LSN of a record still waiting for fragments
        let mut pending: Option<(u64, usize, Lsn)> = None;
        let mut block = vec![0u8; block_size];
        file.seek(SeekFrom::Start(0))?;
        for block_number in 0..blocks {
            file.read_exact(&mut block)?;
            let mut block_max = INVALID_LSN;
            let used = log_buffer::block_used(&block)?;
            let mut pos = BOUNDARY_SIZE;
            while pos < used {
                let frame = log_buffer::read_frame(&block, pos)?;
                let lsn = match (frame.continued, pending) {
                    (true, Some((_, _, lsn))) => lsn,
                    (false, None) if frame.bytes.len() >= 8 => LittleEndian::read_u64(&frame.bytes[0..8]),
                    (false, None) => INVALID_LSN,
                    _ => {
                        return Err(LogManagerError::InvalidFormat(format!(
                            "broken record chain in log block {}",
                            block_number
                        )));
                    }
                };
                if frame.more {
                    if pending.is_none() {
                        pending = Some((block_number, pos, lsn));
                    }
                } else {
                    pending = None;
                    block_max = block_max.max(lsn);
                }
                pos += frame.framed_len();
            }
            block_maxes.push(block_max);
        }

        let max_lsn = block_maxes.iter().copied().max().unwrap_or(INVALID_LSN);
        let (tail_block, tail) = match pending {
            None => {
                let tail_max = block_maxes.last().copied().unwrap_or(INVALID_LSN);
                (blocks - 1, LogBuffer::from_block(block, tail_max)?)
            }
            Some((start_block, start_pos, lsn)) => {
                warn!(
                    "Dropping LSN {} at log offset {}: its last fragment was never written",
                    lsn,
                    start_block * block_size as u64 + start_pos as u64
                );
                file.set_len((start_block + 1) * block_size as u64)?;
                file.seek(SeekFrom::Start(start_block * block_size as u64))?;
                file.read_exact(&mut block)?;
                let mut tail = LogBuffer::from_block(block, block_maxes[start_block as usize])?;
                tail.truncate(start_pos);
                file.seek(SeekFrom::Start(start_block * block_size as u64))?;
                file.write_all(tail.content())?;
                file.sync_all()?;
                (start_block, tail)
            }
        };
        Ok((tail, tail_block, max_lsn))
    }

    fn master_path_for(log_path: &Path) -> PathBuf {
        let mut path = log_path.as_os_str().to_owned();
        path.push(".master");
        PathBuf::from(path)
    }

    /// Append a log record, stamping it with the next LSN
    pub fn append(&self, record: &mut LogRecord) -> Result<LogPosition> {
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        record.lsn = lsn;
        let bytes = record.serialize()?;
        let position = self.append_framed(&mut state, lsn, &bytes)?;
        debug!("Appended {:?} at {:?}", record.record_type(), position);
        Ok(position)
    }

    /// Append a raw entry. Its first 8 bytes are overwritten with the
    /// assigned LSN, so encoded records can be passed through unchanged.
    pub fn append_bytes(&self, bytes: &[u8]) -> Result<LogPosition> {
        if bytes.len() < 8 {
            return Err(LogManagerError::InvalidRecord(format!(
                "raw entry of {} bytes has no room for an LSN",
                bytes.len()
            )));
        }
        let mut state = self.state.lock();
        let lsn = state.next_lsn;
        let mut entry = bytes.to_vec();
        LittleEndian::write_u64(&mut entry[0..8], lsn);
        self.append_framed(&mut state, lsn, &entry)
    }

    fn append_framed(&self, state: &mut LogState, lsn: Lsn, bytes: &[u8]) -> Result<LogPosition> {
        let offset = if bytes.len() > state.buffer.capacity() {
            self.append_spanning(state, lsn, bytes)?
        } else {
            if !state.buffer.has_space(bytes.len()) {
                self.next_block(state)?;
            }
            let pos = state.buffer.append(lsn, bytes)?;
            self.offset_of(state, pos)
        };

        state.next_lsn = lsn + 1;
        Ok(LogPosition::new(lsn, offset))
    }

    fn offset_of(&self, state: &LogState, pos: usize) -> u64 {
        state.tail_block * self.config.block_size as u64 + pos as u64
    }

    /// Cut a record larger than a block into fragments, filling the tail
    /// block first. Every block but the last is written out as it fills.
    /// Returns the offset of the first fragment.
    fn append_spanning(&self, state: &mut LogState, lsn: Lsn, bytes: &[u8]) -> Result<u64> {
        if state.buffer.remaining() < MIN_FIRST_FRAGMENT {
            self.next_block(state)?;
        }
        let offset = self.offset_of(state, state.buffer.used());

        let mut rest = bytes;
        let mut continued = 0;
        loop {
            let take = rest.len().min(state.buffer.remaining());
            let (flags, fragment_lsn) = if take < rest.len() {
                (continued | FRAME_MORE, INVALID_LSN)
            } else {
                (continued, lsn)
            };
            state.buffer.append_fragment(&rest[..take], flags, fragment_lsn)?;
            rest = &rest[take..];
            if rest.is_empty() {
                break;
            }
            self.next_block(state)?;
            continued = FRAME_CONTINUED;
        }
        debug!("LSN {} spans {} bytes across log blocks", lsn, bytes.len());
        Ok(offset)
    }

    /// Write out the full tail block and start the next one
    fn next_block(&self, state: &mut LogState) -> Result<()> {
        self.write_tail(state)?;
        state.tail_block += 1;
        state.buffer.reset();
        Ok(())
    }

    /// Write the tail block in place and advance the flushed LSN
    fn write_tail(&self, state: &mut LogState) -> Result<()> {
        let offset = state.tail_block * self.config.block_size as u64;
        state.file.seek(SeekFrom::Start(offset))?;
        state.file.write_all(state.buffer.content())?;
        if self.config.force_sync {
            state.file.sync_data()?;
        }
        self.flushed_lsn.fetch_max(state.buffer.max_lsn(), Ordering::SeqCst);
        debug!(
            "Wrote log block {} up to LSN {}",
            state.tail_block,
            state.buffer.max_lsn()
        );
        Ok(())
    }

    /// Make every record with an LSN at or below `lsn` durable
    pub fn flush(&self, lsn: Lsn) -> Result<()> {
        if lsn <= self.flushed_lsn() {
            return Ok(());
        }
        let mut state = self.state.lock();
        // Another thread may have flushed while we waited
        if lsn <= self.flushed_lsn() {
            return Ok(());
        }
        self.write_tail(&mut state)
    }

    /// Make every appended record durable
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.buffer.max_lsn() > self.flushed_lsn() {
            self.write_tail(&mut state)?;
        }
        Ok(())
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.flushed_lsn.load(Ordering::SeqCst)
    }

    /// LSN of the most recently appended record
    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().next_lsn - 1
    }

    pub fn block_size(&self) -> usize {
        self.config.block_size
    }

    pub fn log_path(&self) -> &Path {
        &self.config.log_path
    }

    pub fn master_path(&self) -> &Path {
        &self.master_path
    }

    pub fn stats(&self) -> LogStats {
        let state = self.state.lock();
        let empty = state.tail_block == 0 && state.buffer.is_empty();
        LogStats {
            next_lsn: state.next_lsn,
            flushed_lsn: self.flushed_lsn(),
            end_offset: state.tail_block * self.config.block_size as u64 + state.buffer.used() as u64,
            blocks: if empty { 0 } else { state.tail_block + 1 },
        }
    }

    /// Read the raw entry at `offset`, from the tail buffer or the file,
    /// joining the fragments of a record that spans blocks
    pub fn read_bytes_at(&self, offset: u64) -> Result<Vec<u8>> {
        let block_size = self.config.block_size as u64;
        let mut block_number = offset / block_size;
        let mut pos = (offset % block_size) as usize;

        let mut state = self.state.lock();
        let mut entry = Vec::new();
        let mut first = true;
        loop {
            let block = Self::read_block(&mut state, block_number, self.config.block_size)?;
            let frame = log_buffer::read_frame(&block, pos)?;
            if frame.continued == first {
                return Err(LogManagerError::InvalidRecord(format!("no record starts at offset {}", offset)));
            }
            entry.extend_from_slice(frame.bytes);
            if !frame.more {
                return Ok(entry);
            }
            first = false;
            block_number += 1;
            pos = BOUNDARY_SIZE;
        }
    }

    /// Copy of a log block, taken from the tail buffer when it is the tail
    fn read_block(state: &mut LogState, block_number: u64, block_size: usize) -> Result<Vec<u8>> {
        if block_number == state.tail_block {
            return Ok(state.buffer.content().to_vec());
        }
        if block_number > state.tail_block {
            return Err(LogManagerError::InvalidRecord(format!(
                "log block {} is past the end of the log",
                block_number
            )));
        }
        let mut block = vec![0u8; block_size];
        state.file.seek(SeekFrom::Start(block_number * block_size as u64))?;
        state.file.read_exact(&mut block)?;
        Ok(block)
    }

    /// Read and decode the record at `offset`
    pub fn read_record_at(&self, offset: u64) -> Result<LogRecord> {
        let bytes = self.read_bytes_at(offset)?;
        Ok(LogRecord::deserialize(&bytes)?)
    }

    /// Forward iterator over raw entries starting at `offset`. Flushes
    /// first so the file holds every appended record.
    pub fn iter_from(&self, offset: u64) -> Result<LogIterator> {
        self.flush_all()?;
        let file = File::open(&self.config.log_path)?;
        let blocks = file.metadata()?.len() / self.config.block_size as u64;
        Ok(LogIterator::new(file, self.config.block_size, offset, blocks))
    }

    /// Forward iterator over decoded records starting at `offset`
    pub fn iter_records_from(&self, offset: u64) -> Result<LogRecordIterator> {
        Ok(LogRecordIterator::new(self.iter_from(offset)?))
    }

    /// Point the master record at the CHECKPOINTEND stored at `offset`
    pub fn write_master(&self, checkpoint_offset: u64) -> Result<()> {
        MasterRecord::new(checkpoint_offset).write_to(&self.master_path)?;
        info!("Master record now points at log offset {}", checkpoint_offset);
        Ok(())
    }

    /// Offset of the latest CHECKPOINTEND, if a checkpoint was ever taken
    pub fn read_master(&self) -> Result<Option<u64>> {
        match MasterRecord::read_from(&self.master_path)? {
            None => Ok(None),
            Some(master) if master.validate() => Ok(Some(master.checkpoint_offset)),
            Some(_) => Err(LogManagerError::InvalidFormat(format!(
                "bad master record in {:?}",
                self.master_path
            ))),
        }
    }
}
