use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::BlockId;
use crate::storage::page::Page;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Page of {actual} bytes does not match block size {expected}")]
    PageSizeMismatch { expected: usize, actual: usize },
    #[error("Invalid file name: {0}")]
    InvalidFileName(String),
}

/// FileManager reads and writes whole blocks of the named files that live
/// in one database directory.
pub struct FileManager {
    db_dir: PathBuf,
    block_size: usize,
    is_new: bool,
    open_files: Mutex<HashMap<String, File>>,
}

impl FileManager {
    /// Open (creating if needed) the database directory
    pub fn new(db_dir: impl AsRef<Path>, block_size: usize) -> Result<Self, FileError> {
        let db_dir = db_dir.as_ref().to_path_buf();
        let is_new = !db_dir.exists();
        std::fs::create_dir_all(&db_dir)?;

        Ok(Self {
            db_dir,
            block_size,
            is_new,
            open_files: Mutex::new(HashMap::new()),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether the directory was created by this instance
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Read a block into `page`. Reading past the end of the file yields a
    /// zeroed page.
    pub fn read(&self, block: &BlockId, page: &mut Page) -> Result<(), FileError> {
        self.check_page(page)?;
        let offset = self.block_offset(block);

        let mut files = self.open_files.lock();
        let file = Self::file_for(&mut files, &self.db_dir, block.file_name())?;

        let file_size = file.metadata()?.len();
        if offset + self.block_size as u64 > file_size {
            page.reset();
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(page.data_mut())?;
        Ok(())
    }

    /// Write `page` to its block
    pub fn write(&self, block: &BlockId, page: &Page) -> Result<(), FileError> {
        self.check_page(page)?;
        let offset = self.block_offset(block);

        let mut files = self.open_files.lock();
        let file = Self::file_for(&mut files, &self.db_dir, block.file_name())?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(page.data())?;
        file.sync_data()?;

        debug!("Wrote block {}", block);
        Ok(())
    }

    /// Append a zeroed block to the file and return its id
    pub fn append(&self, file_name: &str) -> Result<BlockId, FileError> {
        let mut files = self.open_files.lock();
        let file = Self::file_for(&mut files, &self.db_dir, file_name)?;

        let blocks = file.metadata()?.len() / self.block_size as u64;
        let block = BlockId::new(file_name, blocks as u32);

        file.seek(SeekFrom::Start(blocks * self.block_size as u64))?;
        file.write_all(&vec![0u8; self.block_size])?;
        file.sync_data()?;

        debug!("Appended block {}", block);
        Ok(block)
    }

    /// Number of whole blocks in the file
    pub fn block_count(&self, file_name: &str) -> Result<u32, FileError> {
        let mut files = self.open_files.lock();
        let file = Self::file_for(&mut files, &self.db_dir, file_name)?;
        Ok((file.metadata()?.len() / self.block_size as u64) as u32)
    }

    /// Grow or truncate the file to exactly `blocks` blocks
    pub fn set_file_size(&self, file_name: &str, blocks: u32) -> Result<(), FileError> {
        let mut files = self.open_files.lock();
        let file = Self::file_for(&mut files, &self.db_dir, file_name)?;
        file.set_len(blocks as u64 * self.block_size as u64)?;
        file.sync_all()?;

        debug!("Resized {} to {} blocks", file_name, blocks);
        Ok(())
    }

    fn file_for<'a>(
        files: &'a mut HashMap<String, File>,
        db_dir: &Path,
        file_name: &str,
    ) -> Result<&'a mut File, FileError> {
        if file_name.is_empty() || file_name.contains(['/', '\\']) {
            return Err(FileError::InvalidFileName(file_name.to_string()));
        }
        if !files.contains_key(file_name) {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(db_dir.join(file_name))?;
            files.insert(file_name.to_string(), file);
        }
        files
            .get_mut(file_name)
            .ok_or_else(|| FileError::InvalidFileName(file_name.to_string()))
    }

    fn check_page(&self, page: &Page) -> Result<(), FileError> {
        if page.size() != self.block_size {
            return Err(FileError::PageSizeMismatch {
                expected: self.block_size,
                actual: page.size(),
            });
        }
        Ok(())
    }

    fn block_offset(&self, block: &BlockId) -> u64 {
        block.number() as u64 * self.block_size as u64
    }
}
