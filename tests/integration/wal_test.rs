use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use tempfile::TempDir;
use walstore::common::types::{BlockId, Lsn, Rid};
use walstore::transaction::wal::log_record::LogRecordBody;
use walstore::transaction::wal::{LogManager, LogManagerConfig, LogManagerError, LogRecord, LogRecordType};

fn create_test_log_manager(dir: &TempDir, block_size: usize) -> Result<Arc<LogManager>> {
    Ok(Arc::new(LogManager::new(LogManagerConfig {
        log_path: dir.path().join("wal.log"),
        block_size,
        force_sync: false,
    })?))
}

#[test]
fn test_wal_basic_operations() -> Result<()> {
    let dir = TempDir::new()?;
    let log_manager = create_test_log_manager(&dir, 256)?;

    let begin = log_manager.append(&mut LogRecord::new_begin(1))?;
    let insert = log_manager.append(&mut LogRecord::new_insert(
        1,
        begin.lsn,
        "accounts",
        Rid::new(0, 0),
        b"alice:100".to_vec(),
    ))?;
    let update = log_manager.append(&mut LogRecord::new_update(
        1,
        insert.lsn,
        "accounts",
        Rid::new(0, 0),
        b"alice:100".to_vec(),
        b"alice:80".to_vec(),
    ))?;
    let commit = log_manager.append(&mut LogRecord::new_commit(1, update.lsn))?;
    log_manager.flush(commit.lsn)?;
    assert!(log_manager.flushed_lsn() >= commit.lsn);

    let records: Vec<LogRecord> = log_manager
        .iter_records_from(0)?
        .map(|item| item.map(|(_, record)| record))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(records.len(), 4);
    assert_eq!(records[2].prev_lsn, insert.lsn);
    match &records[2].body {
        LogRecordBody::Update(c) => {
            assert_eq!(c.file_name, "accounts");
            assert_eq!(c.old_tuple, b"alice:100");
            assert_eq!(c.new_tuple, b"alice:80");
        }
        other => panic!("expected an update, found {:?}", other),
    }
    assert_eq!(records[3].record_type(), LogRecordType::Commit);
    Ok(())
}

#[test]
fn test_iterator_starts_at_offset() -> Result<()> {
    let dir = TempDir::new()?;
    let log_manager = create_test_log_manager(&dir, 128)?;

    let mut positions = Vec::new();
    for txn in 1..=30 {
        positions.push(log_manager.append(&mut LogRecord::new_begin(txn))?);
    }

    let start = positions[17];
    let lsns: Vec<Lsn> = log_manager
        .iter_records_from(start.offset)?
        .map(|item| item.map(|(_, record)| record.lsn))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(lsns, (start.lsn..=30).collect::<Vec<_>>());

    // Offsets reported by the iterator are usable for random access
    for item in log_manager.iter_from(0)? {
        let (offset, bytes) = item?;
        assert_eq!(log_manager.read_bytes_at(offset)?, bytes);
    }
    Ok(())
}

#[test]
fn test_reopen_keeps_flushed_records_only() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let log_manager = create_test_log_manager(&dir, 512)?;
        let begin = log_manager.append(&mut LogRecord::new_begin(1))?;
        let set = log_manager.append(&mut LogRecord::new_set_string(
            1,
            begin.lsn,
            BlockId::new("data", 3),
            64,
            String::new(),
            "hello".to_string(),
        ))?;
        log_manager.flush(set.lsn)?;
        // Never flushed: lost with the process
        log_manager.append(&mut LogRecord::new_commit(1, set.lsn))?;
    }

    let log_manager = create_test_log_manager(&dir, 512)?;
    assert_eq!(log_manager.last_lsn(), 2);
    let kinds: Vec<LogRecordType> = log_manager
        .iter_records_from(0)?
        .map(|item| item.map(|(_, record)| record.record_type()))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(kinds, vec![LogRecordType::Begin, LogRecordType::SetString]);

    let next = log_manager.append(&mut LogRecord::new_commit(1, 2))?;
    assert_eq!(next.lsn, 3);
    Ok(())
}

#[test]
fn test_torn_log_file_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let log_manager = create_test_log_manager(&dir, 256)?;
        log_manager.append(&mut LogRecord::new_begin(1))?;
        log_manager.flush_all()?;
    }
    let mut file = OpenOptions::new().append(true).open(dir.path().join("wal.log"))?;
    file.write_all(&[0xAB; 10])?;

    match LogManager::new(LogManagerConfig {
        log_path: dir.path().join("wal.log"),
        block_size: 256,
        force_sync: false,
    }) {
        Err(LogManagerError::InvalidFormat(_)) => Ok(()),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("log with a partial block was accepted"),
    }
}

#[test]
fn test_concurrent_appends_get_unique_lsns() -> Result<()> {
    let dir = TempDir::new()?;
    let log_manager = create_test_log_manager(&dir, 256)?;
    let threads = 4;
    let per_thread = 50;

    let lsns: Vec<Lsn> = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let log_manager = Arc::clone(&log_manager);
                s.spawn(move |_| -> Result<Vec<Lsn>> {
                    let mut lsns = Vec::new();
                    let mut prev = 0;
                    for _ in 0..per_thread {
                        let position = log_manager.append(&mut LogRecord::new_set_int(
                            t + 1,
                            prev,
                            BlockId::new("data", t),
                            16,
                            0,
                            1,
                        ))?;
                        // Within one thread LSNs only grow
                        assert!(position.lsn > prev);
                        prev = position.lsn;
                        lsns.push(position.lsn);
                    }
                    Ok(lsns)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("appender panicked"))
            .collect::<Result<Vec<_>>>()
    })
    .expect("scope panicked")?
    .into_iter()
    .flatten()
    .collect();

    let unique: HashSet<Lsn> = lsns.iter().copied().collect();
    assert_eq!(unique.len(), (threads * per_thread) as usize);
    assert_eq!(log_manager.last_lsn(), (threads * per_thread) as Lsn);

    // Every record made it into the file exactly once, in LSN order
    let on_disk: Vec<Lsn> = log_manager
        .iter_records_from(0)?
        .map(|item| item.map(|(_, record)| record.lsn))
        .collect::<std::result::Result<_, _>>()?;
    assert_eq!(on_disk, (1..=(threads * per_thread) as Lsn).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_master_record_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let log_manager = create_test_log_manager(&dir, 256)?;
        log_manager.append(&mut LogRecord::new_checkpoint_begin())?;
        let end = log_manager.append(&mut LogRecord::new_checkpoint_end(Default::default()))?;
        log_manager.flush(end.lsn)?;
        log_manager.write_master(end.offset)?;
    }

    let log_manager = create_test_log_manager(&dir, 256)?;
    let offset = log_manager.read_master()?.expect("master record missing");
    let record = log_manager.read_record_at(offset)?;
    assert_eq!(record.record_type(), LogRecordType::CheckpointEnd);
    Ok(())
}
