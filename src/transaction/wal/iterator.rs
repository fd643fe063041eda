use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

use crate::transaction::wal::log_buffer::{self, BOUNDARY_SIZE, FRAME_SIZE};
use crate::transaction::wal::log_manager::{LogManagerError, Result};
use crate::transaction::wal::log_record::LogRecord;

/// Forward iterator over the raw entries of a log file, yielding
/// `(offset, bytes)`. Blocks are read lazily, one at a time; a record
/// spanning blocks is yielded once, joined, at the offset it starts at.
pub struct LogIterator {
    file: File,
    block_size: usize,
    /// Blocks present when the iterator was created
    block_count: u64,
    block_number: u64,
    block: Vec<u8>,
    loaded: bool,
    used: usize,
    pos: usize,
    done: bool,
}

impl LogIterator {
    pub fn new(file: File, block_size: usize, offset: u64, block_count: u64) -> Self {
        Self {
            file,
            block_size,
            block_count,
            block_number: offset / block_size as u64,
            block: vec![0; block_size],
            loaded: false,
            used: 0,
            pos: (offset % block_size as u64) as usize,
            done: false,
        }
    }

    fn advance(&mut self) -> Result<Option<(u64, Vec<u8>)>> {
        let mut entry: Option<(u64, Vec<u8>)> = None;
        loop {
            if !self.loaded {
                // A record still missing fragments at the end is not complete yet
                if self.block_number >= self.block_count {
                    return Ok(None);
                }
                self.file
                    .seek(SeekFrom::Start(self.block_number * self.block_size as u64))?;
                self.file.read_exact(&mut self.block)?;
                self.used = log_buffer::block_used(&self.block)?;
                self.pos = self.pos.max(BOUNDARY_SIZE);
                self.loaded = true;
            }

            if self.pos < self.used {
                let frame = log_buffer::read_frame(&self.block, self.pos)?;
                let offset = self.block_number * self.block_size as u64 + self.pos as u64;
                match (&mut entry, frame.continued) {
                    (None, false) => entry = Some((offset, frame.bytes.to_vec())),
                    (Some((_, bytes)), true) => bytes.extend_from_slice(frame.bytes),
                    _ => {
                        return Err(LogManagerError::InvalidFormat(format!(
                            "broken record chain at log offset {}",
                            offset
                        )));
                    }
                }
                self.pos += frame.framed_len();
                if !frame.more {
                    return Ok(entry);
                }
            } else if entry.is_some() {
                return Err(LogManagerError::InvalidFormat(format!(
                    "log block {} ends inside a record",
                    self.block_number
                )));
            }

            self.block_number += 1;
            self.pos = BOUNDARY_SIZE;
            self.loaded = false;
        }
    }
}

impl Iterator for LogIterator {
    type Item = Result<(u64, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Decoding wrapper over [`LogIterator`]
pub struct LogRecordIterator {
    inner: LogIterator,
}

impl LogRecordIterator {
    pub fn new(inner: LogIterator) -> Self {
        Self { inner }
    }
}

impl Iterator for LogRecordIterator {
    type Item = Result<(u64, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.and_then(|(offset, bytes)| Ok((offset, LogRecord::deserialize(&bytes)?))))
    }
}
