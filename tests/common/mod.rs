#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use walstore::common::types::{BlockId, Lsn};
use walstore::storage::buffer::{BufferPoolConfig, BufferPoolManager};
use walstore::storage::disk::FileManager;
use walstore::transaction::wal::{LogManager, LogManagerConfig};
use walstore::{DatabaseConfig, Page};

pub const TEST_BLOCK_SIZE: usize = 512;

// Small blocks and no fsync keep the tests fast
pub fn test_config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig {
        block_size: TEST_BLOCK_SIZE,
        pool_size: 16,
        pin_timeout: Duration::from_secs(2),
        lock_timeout: Duration::from_millis(200),
        force_sync: false,
        ..DatabaseConfig::new(dir.path())
    }
}

// Create a buffer pool and its log in a fresh temporary directory
pub fn create_test_buffer_pool(
    pool_size: usize,
    flush_on_unpin: bool,
) -> Result<(Arc<BufferPoolManager>, Arc<LogManager>, TempDir)> {
    let dir = TempDir::new()?;
    let file_manager = Arc::new(FileManager::new(dir.path(), TEST_BLOCK_SIZE)?);
    let log_manager = Arc::new(LogManager::new(LogManagerConfig {
        log_path: dir.path().join("test.log"),
        block_size: TEST_BLOCK_SIZE,
        force_sync: false,
    })?);
    let buffer_pool = Arc::new(BufferPoolManager::new(
        BufferPoolConfig {
            pool_size,
            pin_timeout: Duration::from_millis(500),
            flush_on_unpin,
        },
        file_manager,
        Arc::clone(&log_manager),
    )?);
    Ok((buffer_pool, log_manager, dir))
}

// Generate test data of specified size
pub fn generate_test_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 256) as u8).collect()
}

// Page LSNs of every block of a data file, read straight from disk
pub fn on_disk_page_lsns(db_dir: &Path, file_name: &str, block_size: usize) -> Result<Vec<(BlockId, Lsn)>> {
    let path = db_dir.join(file_name);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let bytes = std::fs::read(path)?;
    Ok(bytes
        .chunks_exact(block_size)
        .enumerate()
        .map(|(number, chunk)| {
            let page = Page::from_bytes(chunk.to_vec());
            (BlockId::new(file_name, number as u32), page.lsn())
        })
        .collect())
}

// No page on disk may be ahead of the durable log
pub fn assert_wal_invariant(db_dir: &Path, file_name: &str, block_size: usize, flushed_lsn: Lsn) -> Result<()> {
    for (block, lsn) in on_disk_page_lsns(db_dir, file_name, block_size)? {
        assert!(
            lsn <= flushed_lsn,
            "{} has page LSN {} but the log is only durable up to {}",
            block,
            lsn,
            flushed_lsn
        );
    }
    Ok(())
}
