use anyhow::Result;
use tempfile::TempDir;
use walstore::common::types::{BlockId, Rid};
use walstore::transaction::{Transaction, TransactionState};
use walstore::{Database, DatabaseError, IsolationLevel, PageError, TransactionError};

#[path = "../common/mod.rs"]
mod common;
use common::{generate_test_data, test_config};

const TABLE: &str = "people.tbl";

fn tuples(db: &Database, block: &BlockId) -> Result<Vec<(Rid, Vec<u8>)>> {
    let mut txn = db.begin(IsolationLevel::RepeatableRead)?;
    let rows = txn.scan_block(block)?;
    db.commit(txn)?;
    Ok(rows)
}

#[test]
fn test_tuple_lifecycle_survives_reopen() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(&dir);

    let block;
    {
        let db = Database::open(config.clone())?;
        let mut txn = db.begin(IsolationLevel::Serializable)?;
        block = txn.append_block(TABLE)?;
        let alice = txn.insert_tuple(&block, b"alice")?;
        let bob = txn.insert_tuple(&block, b"bob")?;
        let carol = txn.insert_tuple(&block, b"carol")?;
        assert_eq!((alice.slot, bob.slot, carol.slot), (0, 1, 2));

        assert_eq!(txn.update_tuple(TABLE, bob, b"robert")?, b"bob");
        assert_eq!(txn.delete_tuple(TABLE, alice)?, b"alice");
        assert_eq!(txn.get_tuple(TABLE, bob)?, b"robert");
        assert!(matches!(
            txn.get_tuple(TABLE, alice),
            Err(TransactionError::PageError(PageError::RecordNotFound))
        ));
        db.commit(txn)?;
        db.close()?;
    }

    let db = Database::open(config)?;
    assert_eq!(db.recovery_stats().records_undone, 0);
    assert_eq!(
        tuples(&db, &block)?,
        vec![
            (Rid::new(0, 1), b"robert".to_vec()),
            (Rid::new(0, 2), b"carol".to_vec()),
        ]
    );
    Ok(())
}

#[test]
fn test_abort_restores_tuples() -> Result<()> {
    let dir = TempDir::new()?;
    let db = Database::open(test_config(&dir))?;

    let mut setup = db.begin(IsolationLevel::Serializable)?;
    let block = setup.append_block(TABLE)?;
    let first = setup.insert_tuple(&block, b"first")?;
    let second = setup.insert_tuple(&block, &generate_test_data(100))?;
    db.commit(setup)?;
    let before = tuples(&db, &block)?;

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    txn.update_tuple(TABLE, first, b"first, but much longer than before")?;
    txn.delete_tuple(TABLE, second)?;
    let third = txn.insert_tuple(&block, b"third")?;
    // The emptied slot is not reused, so undo can put the tuple back
    assert_eq!(third.slot, 2);
    db.abort(txn)?;

    assert_eq!(tuples(&db, &block)?, before);
    Ok(())
}

#[test]
fn test_unlogged_change_is_not_undone() -> Result<()> {
    let dir = TempDir::new()?;
    let db = Database::open(test_config(&dir))?;

    let mut setup = db.begin(IsolationLevel::Serializable)?;
    let block = setup.append_block(TABLE)?;
    db.commit(setup)?;

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    txn.set_int(&block, 16, 7, false)?;
    txn.set_string(&block, 32, "logged", true)?;
    db.abort(txn)?;

    let mut check = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(check.get_int(&block, 16)?, 7);
    assert_eq!(check.get_string(&block, 32)?, "");
    db.commit(check)?;
    Ok(())
}

#[test]
fn test_isolation_levels_and_lock_conflicts() -> Result<()> {
    let dir = TempDir::new()?;
    let db = Database::open(test_config(&dir))?;

    let mut setup = db.begin(IsolationLevel::Serializable)?;
    let block = setup.append_block(TABLE)?;
    setup.set_int(&block, 16, 1, true)?;
    db.commit(setup)?;

    let mut writer = db.begin(IsolationLevel::Serializable)?;
    writer.set_int(&block, 16, 2, true)?;

    // Dirty reads take no lock at all
    let mut dirty = db.begin(IsolationLevel::ReadUncommitted)?;
    assert_eq!(dirty.get_int(&block, 16)?, 2);
    assert!(dirty.held_locks().is_empty());
    db.commit(dirty)?;

    let mut committed = db.begin(IsolationLevel::ReadCommitted)?;
    assert!(matches!(
        committed.get_int(&block, 16),
        Err(TransactionError::LockError(_))
    ));
    db.abort(committed)?;

    db.commit(writer)?;

    // Short read locks are gone once the read returns
    let mut committed = db.begin(IsolationLevel::ReadCommitted)?;
    assert_eq!(committed.get_int(&block, 16)?, 2);
    assert!(committed.held_locks().is_empty());

    let mut reader = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(reader.get_int(&block, 16)?, 2);
    assert_eq!(reader.held_locks().len(), 1);

    let mut blocked = db.begin(IsolationLevel::Serializable)?;
    assert!(matches!(
        blocked.set_int(&block, 16, 3, true),
        Err(TransactionError::LockError(_))
    ));
    db.abort(blocked)?;
    db.commit(reader)?;
    db.commit(committed)?;
    Ok(())
}

#[test]
fn test_transaction_lifecycle() -> Result<()> {
    let dir = TempDir::new()?;
    let db = Database::open(test_config(&dir))?;
    let manager = db.transaction_manager();

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    txn.append_block(TABLE)?;
    let id = txn.id();
    assert!(manager.transaction_exists(id));
    assert_eq!(manager.active_transaction_ids(), vec![id]);

    // Dropping an active transaction rolls it back
    drop(txn);
    assert!(!manager.transaction_exists(id));
    assert_eq!(db.file_manager().block_count(TABLE)?, 0);

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    assert!(txn.id() > id);
    assert_eq!(txn.state(), TransactionState::Active);
    assert_eq!(txn.block_count(TABLE)?, 0);
    db.commit(txn)?;

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    txn.append_block(TABLE)?;
    db.abort(txn)?;
    assert!(manager.active_transaction_ids().is_empty());
    assert_eq!(db.file_manager().block_count(TABLE)?, 0);
    Ok(())
}

#[test]
fn test_corrupt_page_header_is_an_error() -> Result<()> {
    let dir = TempDir::new()?;
    let db = Database::open(test_config(&dir))?;

    let mut txn = db.begin(IsolationLevel::Serializable)?;
    let block = txn.append_block(TABLE)?;
    txn.insert_tuple(&block, b"row")?;
    // Overwrite the slotted header: sane free space offset, absurd slot count
    txn.set_int(&block, 8, 20, true)?;
    txn.set_int(&block, 12, 1_000_000, true)?;

    assert!(matches!(
        txn.get_tuple(TABLE, Rid::new(0, 100)),
        Err(TransactionError::PageError(PageError::Corrupt(_)))
    ));
    assert!(matches!(
        txn.scan_block(&block),
        Err(TransactionError::PageError(PageError::Corrupt(_)))
    ));
    assert!(matches!(
        txn.insert_tuple(&block, b"more"),
        Err(TransactionError::PageError(PageError::Corrupt(_)))
    ));

    // Rolling back the raw writes makes the page readable again
    db.abort(txn)?;
    let mut check = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(check.block_count(TABLE)?, 0);
    db.commit(check)?;
    Ok(())
}

/// Bump the shared total and this worker's own counter
fn increment(txn: &mut Transaction, shared: &BlockId, own: &BlockId, worker: u32) -> std::result::Result<(), TransactionError> {
    // Write first so the shared read happens under the exclusive lock
    txn.set_int(shared, 20, worker as i32, true)?;
    let total = txn.get_int(shared, 16)?;
    txn.set_int(shared, 16, total + 1, true)?;
    let mine = txn.get_int(own, 16)?;
    txn.set_int(own, 16, mine + 1, true)
}

#[test]
fn test_concurrent_counters() -> Result<()> {
    let dir = TempDir::new()?;
    let db = Database::open(test_config(&dir))?;
    let threads: u32 = 4;
    let rounds: u32 = 25;

    let mut setup = db.begin(IsolationLevel::Serializable)?;
    let shared = setup.append_block("counters")?;
    for _ in 0..threads {
        setup.append_block("counters")?;
    }
    db.commit(setup)?;

    let retries = crossbeam::scope(|s| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let db = &db;
                let shared = &shared;
                s.spawn(move |_| -> Result<usize> {
                    let own = BlockId::new("counters", t + 1);
                    let mut retries = 0;
                    for _ in 0..rounds {
                        // Two upgraders deadlock until one times out; retry the loser
                        loop {
                            let mut txn = db.begin(IsolationLevel::Serializable)?;
                            match increment(&mut txn, shared, &own, t) {
                                Ok(()) => {
                                    db.commit(txn)?;
                                    break;
                                }
                                Err(TransactionError::LockError(_)) => {
                                    db.abort(txn)?;
                                    retries += 1;
                                }
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                    Ok(retries)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("worker panicked"))
            .collect::<Result<Vec<usize>>>()
    })
    .expect("scope panicked")?;
    assert_eq!(retries.len(), threads as usize);

    let mut check = db.begin(IsolationLevel::Serializable)?;
    assert_eq!(check.get_int(&shared, 16)?, (threads * rounds) as i32);
    for t in 0..threads {
        assert_eq!(check.get_int(&BlockId::new("counters", t + 1), 16)?, rounds as i32);
    }
    db.commit(check)?;
    assert!(db.transaction_manager().active_transaction_ids().is_empty());
    Ok(())
}

#[test]
fn test_clean_close_needs_no_recovery() -> Result<()> {
    let dir = TempDir::new()?;
    let config = test_config(&dir);

    let last_id;
    {
        let db = Database::open(config.clone())?;
        let mut txn = db.begin(IsolationLevel::Serializable)?;
        let block = txn.append_block(TABLE)?;
        txn.insert_tuple(&block, b"row")?;
        last_id = txn.id();
        db.commit(txn)?;
        db.close()?;
    }

    let db = Database::open(config)?;
    let stats = db.recovery_stats().clone();
    assert_eq!(stats.pages_redone, 0);
    assert_eq!(stats.records_undone, 0);
    assert_eq!(stats.transactions_undone, 0);
    assert!(stats.max_txn_id >= last_id);

    let txn = db.begin(IsolationLevel::Serializable)?;
    assert!(txn.id() > last_id);
    db.commit(txn)?;
    Ok(())
}

#[test]
fn test_invalid_config_is_rejected() -> Result<()> {
    let dir = TempDir::new()?;
    let mut config = test_config(&dir);
    config.pool_size = 0;
    assert!(matches!(Database::open(config), Err(DatabaseError::InvalidConfig(_))));

    let mut config = test_config(&dir);
    config.block_size = 16;
    assert!(matches!(Database::open(config), Err(DatabaseError::InvalidConfig(_))));
    Ok(())
}
