// Recovery Integration Tests
//
// A crash is simulated by forgetting the in-flight transactions and
// dropping the database without closing it: only what already reached
// the files survives.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use walstore::common::types::{BlockId, TxnId};
use walstore::storage::buffer::{BufferPoolConfig, BufferPoolManager};
use walstore::storage::disk::FileManager;
use walstore::transaction::recovery::{apply, CrashRecovery};
use walstore::transaction::wal::{LogManager, LogManagerConfig, LogRecord, LogRecordBody, LogRecordType};
use walstore::{Database, DatabaseConfig, IsolationLevel, Page};

#[path = "../common/mod.rs"]
mod common;
use common::{assert_wal_invariant, on_disk_page_lsns, test_config, TEST_BLOCK_SIZE};

const FILE: &str = "accounts";

/// Create one block holding `value` at offset 16 and commit it
fn committed_block(db: &Database, value: i32) -> Result<BlockId> {
    let mut txn = db.begin(IsolationLevel::Serializable)?;
    let block = txn.append_block(FILE)?;
    txn.set_int(&block, 16, value, true)?;
    db.commit(txn)?;
    Ok(block)
}

/// Begin and commit an empty transaction, which forces the whole log
fn force_log(db: &Database) -> Result<()> {
    let txn = db.begin(IsolationLevel::Serializable)?;
    db.commit(txn)?;
    Ok(())
}

fn read_int(config: &DatabaseConfig, block: &BlockId, offset: usize) -> Result<i32> {
    let db = Database::open(config.clone())?;
    let mut txn = db.begin(IsolationLevel::Serializable)?;
    let value = txn.get_int(block, offset)?;
    db.commit(txn)?;
    Ok(value)
}

fn records_of(db: &Database, txn_id: TxnId) -> Result<Vec<LogRecord>> {
    Ok(db
        .log_manager()
        .iter_records_from(0)?
        .map(|item| item.map(|(_, record)| record))
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|record| record.txn_id == txn_id)
        .collect())
}

fn on_disk_int(config: &DatabaseConfig, block: &BlockId, offset: usize) -> Result<i32> {
    let bytes = std::fs::read(config.db_dir.join(block.file_name()))?;
    let start = block.number() as usize * config.block_size;
    let page = Page::from_bytes(bytes[start..start + config.block_size].to_vec());
    Ok(page.get_int(offset)?)
}

#[test]
fn test_uncommitted_change_is_undone() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;

    let block;
    {
        let db = Database::open(config.clone())?;
        block = committed_block(&db, 100)?;

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser.set_int(&block, 16, 999, true)?;
        force_log(&db)?;
        std::mem::forget(loser);
    }

    let db = Database::open(config.clone())?;
    let stats = db.recovery_stats().clone();
    assert_eq!(stats.transactions_undone, 1);
    assert_eq!(stats.records_undone, 1);
    assert!(stats.pages_redone >= 2);

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(txn.get_int(&block, 16)?, 100);
    db.commit(txn)?;
    Ok(())
}

#[test]
fn test_committed_change_is_redone() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;
    config.force_pages_on_commit = false;

    let block;
    {
        let db = Database::open(config.clone())?;
        block = committed_block(&db, 42)?;

        // Keep the page pinned so nothing writes it before the crash
        let guard = db.buffer_pool().pin(&block)?;
        std::mem::forget(guard);
    }
    assert_eq!(on_disk_int(&config, &block, 16)?, 0);
    assert!(on_disk_page_lsns(&config.db_dir, FILE, TEST_BLOCK_SIZE)?
        .iter()
        .all(|(_, lsn)| *lsn == 0));

    let db = Database::open(config.clone())?;
    assert!(db.recovery_stats().pages_redone >= 1);
    assert_eq!(db.recovery_stats().transactions_undone, 0);
    drop(db);

    // Recovery flushed its work
    assert_eq!(on_disk_int(&config, &block, 16)?, 42);
    assert_eq!(read_int(&config, &block, 16)?, 42);
    Ok(())
}

#[test]
fn test_written_uncommitted_page_is_rolled_back() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = true;

    let (block, loser_id);
    {
        let db = Database::open(config.clone())?;
        block = committed_block(&db, 5)?;

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser_id = loser.id();
        loser.set_int(&block, 16, 77, true)?;
        // The release wrote the page, so its log record is durable too
        assert_eq!(on_disk_int(&config, &block, 16)?, 77);
        assert_wal_invariant(&config.db_dir, FILE, TEST_BLOCK_SIZE, db.log_manager().flushed_lsn())?;
        std::mem::forget(loser);
    }

    let db = Database::open(config.clone())?;
    assert_eq!(db.recovery_stats().transactions_undone, 1);

    let loser_records: Vec<(LogRecordType, bool)> = db
        .log_manager()
        .iter_records_from(0)?
        .map(|item| item.map(|(_, record)| record))
        .collect::<std::result::Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|record| record.txn_id == loser_id)
        .map(|record| (record.record_type(), record.is_clr))
        .collect();
    assert_eq!(
        loser_records,
        vec![
            (LogRecordType::Begin, false),
            (LogRecordType::SetInt, false),
            (LogRecordType::SetInt, true),
            (LogRecordType::TxnEnd, false),
        ]
    );
    drop(db);

    assert_eq!(on_disk_int(&config, &block, 16)?, 5);
    Ok(())
}

#[test]
fn test_recovery_across_checkpoint() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;

    let (block, other);
    {
        let db = Database::open(config.clone())?;
        block = committed_block(&db, 1)?;
        other = committed_block(&db, 2)?;

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser.set_int(&block, 16, 10, true)?;
        let mut winner = db.begin(IsolationLevel::Serializable)?;
        winner.set_int(&other, 16, 20, true)?;

        db.checkpoint()?;

        loser.set_int(&block, 20, 11, true)?;
        winner.set_int(&other, 20, 21, true)?;
        db.commit(winner)?;
        std::mem::forget(loser);
    }

    let db = Database::open(config.clone())?;
    assert_eq!(db.recovery_stats().transactions_undone, 1);
    assert_eq!(db.recovery_stats().records_undone, 2);

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(txn.get_int(&block, 16)?, 1);
    assert_eq!(txn.get_int(&block, 20)?, 0);
    assert_eq!(txn.get_int(&other, 16)?, 20);
    assert_eq!(txn.get_int(&other, 20)?, 21);
    db.commit(txn)?;
    Ok(())
}

#[test]
fn test_redo_is_idempotent() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;

    let block;
    {
        let db = Database::open(config.clone())?;
        block = committed_block(&db, 8)?;
        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser.set_string(&block, 40, "pending", true)?;
        force_log(&db)?;
        std::mem::forget(loser);
    }

    let file_manager = Arc::new(FileManager::new(&config.db_dir, TEST_BLOCK_SIZE)?);
    let log_manager = Arc::new(LogManager::new(LogManagerConfig {
        log_path: config.log_path(),
        block_size: TEST_BLOCK_SIZE,
        force_sync: false,
    })?);
    let buffer_pool = Arc::new(BufferPoolManager::new(
        BufferPoolConfig {
            flush_on_unpin: false,
            ..BufferPoolConfig::default()
        },
        file_manager,
        Arc::clone(&log_manager),
    )?);
    let recovery = CrashRecovery::new(Arc::clone(&log_manager), Arc::clone(&buffer_pool));

    let mut analysis = recovery.analysis()?;
    assert_eq!(analysis.undergoing().count(), 1);
    assert!(recovery.redo(&analysis)? > 0);
    assert_eq!(recovery.redo(&analysis)?, 0);
    {
        let guard = buffer_pool.pin(&block)?;
        assert_eq!(guard.page().get_string(40)?, "pending");
        assert_eq!(guard.page().get_int(16)?, 8);
    }

    let (undone, rolled_back, _) = recovery.undo(&mut analysis)?;
    assert_eq!((undone, rolled_back), (1, 1));
    let guard = buffer_pool.pin(&block)?;
    assert_eq!(guard.page().get_string(40)?, "");
    Ok(())
}

#[test]
fn test_recovery_is_repeatable() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;

    let block;
    {
        let db = Database::open(config.clone())?;
        block = committed_block(&db, 3)?;
        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser.set_int(&block, 16, 4, true)?;
        force_log(&db)?;
        std::mem::forget(loser);
    }

    // Crash again right after recovery
    {
        let db = Database::open(config.clone())?;
        assert_eq!(db.recovery_stats().transactions_undone, 1);
    }

    let db = Database::open(config.clone())?;
    assert_eq!(db.recovery_stats().transactions_undone, 0);
    assert_eq!(db.recovery_stats().records_undone, 0);
    drop(db);
    assert_eq!(read_int(&config, &block, 16)?, 3);
    Ok(())
}

#[test]
fn test_undone_append_shrinks_file() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(&dir);

    {
        let db = Database::open(config.clone())?;
        committed_block(&db, 1)?;

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        let extra = loser.append_block(FILE)?;
        assert_eq!(extra.number(), 1);
        loser.set_int(&extra, 16, 9, true)?;
        force_log(&db)?;
        std::mem::forget(loser);
    }

    let db = Database::open(config)?;
    assert_eq!(db.recovery_stats().records_undone, 2);
    assert_eq!(db.file_manager().block_count(FILE)?, 1);

    // The next append reuses the block number
    let mut txn = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(txn.append_block(FILE)?.number(), 1);
    db.commit(txn)?;
    Ok(())
}

#[test]
fn test_random_workload_survives_crash() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.pool_size = 4;
    config.flush_on_unpin = false;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let blocks = 6;

    let mut expected: HashMap<(u32, usize), i32> = HashMap::new();
    {
        let db = Database::open(config.clone())?;
        let mut setup = db.begin(IsolationLevel::Serializable)?;
        for _ in 0..blocks {
            setup.append_block("random")?;
        }
        db.commit(setup)?;

        for _ in 0..40 {
            let mut txn = db.begin(IsolationLevel::Serializable)?;
            let mut pending = expected.clone();
            for _ in 0..rng.gen_range(1..6) {
                let number = rng.gen_range(0..blocks);
                let offset = 16 + 4 * rng.gen_range(0..8usize);
                let value: i32 = rng.r#gen();
                txn.set_int(&BlockId::new("random", number), offset, value, true)?;
                pending.insert((number, offset), value);
            }
            if rng.gen_bool(0.7) {
                db.commit(txn)?;
                expected = pending;
            } else {
                db.abort(txn)?;
            }
        }

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        for number in 0..blocks {
            loser.set_int(&BlockId::new("random", number), 16, -1, true)?;
        }
        force_log(&db)?;
        assert_wal_invariant(&config.db_dir, "random", TEST_BLOCK_SIZE, db.log_manager().flushed_lsn())?;
        std::mem::forget(loser);
    }

    let db = Database::open(config)?;
    let mut reader = db.begin(IsolationLevel::RepeatableRead)?;
    for number in 0..blocks {
        for slot in 0..8 {
            let offset = 16 + 4 * slot;
            let want = expected.get(&(number, offset)).copied().unwrap_or(0);
            assert_eq!(
                reader.get_int(&BlockId::new("random", number), offset)?,
                want,
                "block {} offset {}",
                number,
                offset
            );
        }
    }
    db.commit(reader)?;
    Ok(())
}

#[test]
fn test_crashed_append_leaves_no_block() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(&dir);

    {
        let db = Database::open(config.clone())?;
        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser.append_block(FILE)?;
        // The file grew, so the INITPAGE explaining it is already durable
        assert_eq!(db.file_manager().block_count(FILE)?, 1);
        assert_eq!(db.log_manager().flushed_lsn(), db.log_manager().last_lsn());
        std::mem::forget(loser);
    }

    let db = Database::open(config)?;
    assert_eq!(db.recovery_stats().transactions_undone, 1);
    assert_eq!(db.recovery_stats().records_undone, 1);
    assert_eq!(db.file_manager().block_count(FILE)?, 0);
    Ok(())
}

#[test]
fn test_checkpoint_with_every_frame_dirty() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;
    config.force_pages_on_commit = false;
    let blocks = config.pool_size as u32;

    let loser_id;
    {
        let db = Database::open(config.clone())?;
        let mut setup = db.begin(IsolationLevel::Serializable)?;
        for number in 0..blocks {
            let block = setup.append_block(FILE)?;
            setup.set_int(&block, 16, number as i32, true)?;
        }
        db.commit(setup)?;

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser_id = loser.id();
        for number in 0..blocks {
            loser.set_int(&BlockId::new(FILE, number), 20, -1, true)?;
        }

        // The dirty page table alone is larger than one log block
        let position = db.checkpoint()?;
        let content = match db.log_manager().read_record_at(position.offset)?.body {
            LogRecordBody::CheckpointEnd(content) => content,
            other => panic!("expected a checkpoint end, got {:?}", other),
        };
        assert_eq!(content.dirty_page_table.len(), blocks as usize);
        assert!(content.transaction_table.iter().any(|entry| entry.txn_id == loser_id));
        assert_eq!(db.log_manager().read_master()?, Some(position.offset));

        force_log(&db)?;
        std::mem::forget(loser);
    }

    let db = Database::open(config.clone())?;
    assert_eq!(db.recovery_stats().transactions_undone, 1);
    assert_eq!(db.recovery_stats().records_undone, blocks as usize);

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    for number in 0..blocks {
        let block = BlockId::new(FILE, number);
        assert_eq!(txn.get_int(&block, 16)?, number as i32);
        assert_eq!(txn.get_int(&block, 20)?, 0);
    }
    // Dirty the whole pool again; close checkpoints with all of it listed
    for number in 0..blocks {
        txn.set_int(&BlockId::new(FILE, number), 24, 7, true)?;
    }
    db.commit(txn)?;
    db.close()?;

    assert_eq!(read_int(&config, &BlockId::new(FILE, blocks - 1), 24)?, 7);
    Ok(())
}

#[test]
fn test_large_tuple_updates_survive_crash() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;
    config.force_pages_on_commit = false;

    // Old and new image together exceed one log block
    let original = vec![b'a'; 240];
    let committed = vec![b'c'; 240];
    let pending = vec![b'p'; 240];

    let (block, rid);
    {
        let db = Database::open(config.clone())?;
        let mut setup = db.begin(IsolationLevel::Serializable)?;
        block = setup.append_block(FILE)?;
        rid = setup.insert_tuple(&block, &original)?;
        db.commit(setup)?;

        let mut winner = db.begin(IsolationLevel::Serializable)?;
        assert_eq!(winner.update_tuple(FILE, rid, &committed)?, original);
        db.commit(winner)?;

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser.update_tuple(FILE, rid, &pending)?;
        force_log(&db)?;
        std::mem::forget(loser);
    }

    let db = Database::open(config)?;
    assert_eq!(db.recovery_stats().transactions_undone, 1);
    assert_eq!(db.recovery_stats().records_undone, 1);

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(txn.get_tuple(FILE, rid)?, committed);
    assert_eq!(txn.scan_block(&block)?.len(), 1);
    db.commit(txn)?;
    Ok(())
}

#[test]
fn test_interrupted_rollback_is_not_undone_twice() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.flush_on_unpin = false;

    let (block, loser_id);
    {
        let db = Database::open(config.clone())?;
        block = committed_block(&db, 100)?;

        let mut loser = db.begin(IsolationLevel::Serializable)?;
        loser_id = loser.id();
        loser.set_int(&block, 16, 1, true)?;
        loser.set_int(&block, 20, 2, true)?;
        force_log(&db)?;
        std::mem::forget(loser);
    }

    // Bring the pages up to date, then undo only the newest record and
    // crash before the rest of the rollback
    {
        let file_manager = Arc::new(FileManager::new(&config.db_dir, TEST_BLOCK_SIZE)?);
        let log_manager = Arc::new(LogManager::new(LogManagerConfig {
            log_path: config.log_path(),
            block_size: TEST_BLOCK_SIZE,
            force_sync: false,
        })?);
        let buffer_pool = Arc::new(BufferPoolManager::new(
            BufferPoolConfig {
                flush_on_unpin: false,
                ..BufferPoolConfig::default()
            },
            file_manager,
            Arc::clone(&log_manager),
        )?);
        let recovery = CrashRecovery::new(Arc::clone(&log_manager), Arc::clone(&buffer_pool));
        let analysis = recovery.analysis()?;
        recovery.redo(&analysis)?;

        let newest = log_manager
            .iter_records_from(0)?
            .map(|item| item.map(|(_, record)| record))
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .filter(|record| record.txn_id == loser_id)
            .last()
            .expect("loser has records");
        assert!(matches!(newest.body, LogRecordBody::SetInt(_)));
        apply::undo(&buffer_pool, &log_manager, &newest, newest.lsn)?;
        log_manager.flush_all()?;
        {
            let guard = buffer_pool.pin(&block)?;
            assert_eq!(guard.page().get_int(20)?, 0);
            assert_eq!(guard.page().get_int(16)?, 1);
        }
    }

    let db = Database::open(config.clone())?;
    assert_eq!(db.recovery_stats().transactions_undone, 1);
    assert_eq!(db.recovery_stats().records_undone, 1);

    let records = records_of(&db, loser_id)?;
    let kinds: Vec<(LogRecordType, bool)> = records.iter().map(|r| (r.record_type(), r.is_clr)).collect();
    assert_eq!(
        kinds,
        vec![
            (LogRecordType::Begin, false),
            (LogRecordType::SetInt, false),
            (LogRecordType::SetInt, false),
            (LogRecordType::SetInt, true),
            (LogRecordType::SetInt, true),
            (LogRecordType::TxnEnd, false),
        ]
    );
    let (first_set, second_set) = (&records[1], &records[2]);
    let (first_clr, second_clr) = (&records[3], &records[4]);
    assert_eq!(first_clr.undo_next_lsn, first_set.lsn);
    assert_eq!(second_clr.prev_lsn, first_clr.lsn);
    assert_eq!(second_clr.undo_next_lsn, first_set.prev_lsn);
    assert_eq!(second_set.lsn, first_clr.prev_lsn);
    drop(db);

    assert_eq!(read_int(&config, &block, 16)?, 100);
    assert_eq!(read_int(&config, &block, 20)?, 0);
    Ok(())
}
