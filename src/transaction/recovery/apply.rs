//! Physical redo and undo of log records

use log::debug;

use crate::common::types::{LogPosition, Lsn};
use crate::storage::buffer::BufferPoolManager;
use crate::storage::page::{Page, PageError, TablePage};
use crate::transaction::recovery::error::{RecoveryError, Result};
use crate::transaction::wal::log_record::{LogRecord, LogRecordBody, UpdateContent};
use crate::transaction::wal::LogManager;

/// Apply the page effect of a record body. INITPAGE and control records
/// have none.
pub fn apply_to_page(page: &mut Page, body: &LogRecordBody) -> Result<()> {
    match body {
        LogRecordBody::Insert(c) => TablePage::insert_at(page, c.rid.slot, &c.tuple)?,
        LogRecordBody::Delete(c) => {
            TablePage::delete(page, c.rid.slot)?;
        }
        LogRecordBody::Update(c) => {
            TablePage::update(page, c.rid.slot, &c.new_tuple)?;
        }
        LogRecordBody::SetInt(c) => page.set_int(c.offset as usize, c.new_value)?,
        LogRecordBody::SetString(c) => page.set_string(c.offset as usize, &c.new_value)?,
        other => {
            return Err(RecoveryError::InvariantViolation(format!(
                "{:?} has no page effect",
                other
            )))
        }
    }
    Ok(())
}

/// Re-apply a page record unless the page already reflects it. Returns
/// whether the page changed.
pub fn redo_page(pool: &BufferPoolManager, record: &LogRecord, position: LogPosition) -> Result<bool> {
    let block = record.target_block().ok_or_else(|| {
        RecoveryError::InvariantViolation(format!("record {} does not target a page", record.lsn))
    })?;

    let guard = pool.pin(&block)?;
    {
        let mut page = guard.page_mut();
        if page.lsn() >= record.lsn {
            return Ok(false);
        }
        apply_to_page(&mut page, &record.body)?;
        page.set_lsn(record.lsn);
    }
    guard.set_modified(record.txn_id, position)?;
    debug!("Redid {} on {}", record, block);
    Ok(true)
}

/// Grow `file_name` so that `block_number` exists
pub fn extend_file(pool: &BufferPoolManager, file_name: &str, block_number: u32) -> Result<()> {
    let count = pool.file_manager().block_count(file_name)?;
    if count <= block_number {
        pool.file_manager().set_file_size(file_name, block_number + 1)?;
    }
    Ok(())
}

/// Shrink `file_name` back to `blocks` blocks if it is longer
pub fn shrink_file(pool: &BufferPoolManager, file_name: &str, blocks: u32) -> Result<()> {
    let count = pool.file_manager().block_count(file_name)?;
    if count > blocks {
        pool.truncate_file(file_name, blocks)?;
    }
    Ok(())
}

/// Body of the compensation record that reverses `body`
pub fn compensation_body(body: &LogRecordBody) -> Option<LogRecordBody> {
    Some(match body {
        LogRecordBody::Insert(c) => LogRecordBody::Delete(c.clone()),
        LogRecordBody::Delete(c) => LogRecordBody::Insert(c.clone()),
        LogRecordBody::Update(c) => LogRecordBody::Update(UpdateContent {
            file_name: c.file_name.clone(),
            rid: c.rid,
            old_tuple: c.new_tuple.clone(),
            new_tuple: c.old_tuple.clone(),
        }),
        LogRecordBody::SetInt(c) => {
            let mut swapped = c.clone();
            std::mem::swap(&mut swapped.old_value, &mut swapped.new_value);
            LogRecordBody::SetInt(swapped)
        }
        LogRecordBody::SetString(c) => {
            let mut swapped = c.clone();
            std::mem::swap(&mut swapped.old_value, &mut swapped.new_value);
            LogRecordBody::SetString(swapped)
        }
        LogRecordBody::InitPage(c) => LogRecordBody::InitPage(c.clone()),
        _ => return None,
    })
}

/// Check that `page` still shows the after-image of `record`
fn check_after_image(page: &Page, record: &LogRecord) -> Result<()> {
    let holds = match &record.body {
        LogRecordBody::Insert(c) => TablePage::get(page, c.rid.slot).ok().as_deref() == Some(&c.tuple[..]),
        LogRecordBody::Delete(c) => matches!(TablePage::get(page, c.rid.slot), Err(PageError::RecordNotFound)),
        LogRecordBody::Update(c) => TablePage::get(page, c.rid.slot).ok().as_deref() == Some(&c.new_tuple[..]),
        LogRecordBody::SetInt(c) => page.get_int(c.offset as usize).ok() == Some(c.new_value),
        LogRecordBody::SetString(c) => {
            page.get_string(c.offset as usize).ok().as_deref() == Some(c.new_value.as_str())
        }
        _ => true,
    };
    if holds {
        Ok(())
    } else {
        Err(RecoveryError::InvariantViolation(format!(
            "page does not reflect {} before undo",
            record
        )))
    }
}

/// Undo one record: write its CLR (chained after `prev_lsn`, continuing
/// the undo at `record.prev_lsn`), then apply the CLR.
pub fn undo(pool: &BufferPoolManager, log: &LogManager, record: &LogRecord, prev_lsn: Lsn) -> Result<LogPosition> {
    if !record.is_undoable() {
        return Err(RecoveryError::InvariantViolation(format!("record {} cannot be undone", record)));
    }
    let body = compensation_body(&record.body).ok_or_else(|| {
        RecoveryError::InvariantViolation(format!("record {} has no compensation", record))
    })?;
    let mut clr = LogRecord::new_clr(record.txn_id, prev_lsn, record.prev_lsn, body);

    if let LogRecordBody::InitPage(c) = &record.body {
        // The extension may never have reached disk; shrinking is then a no-op
        let position = log.append(&mut clr)?;
        shrink_file(pool, &c.file_name, c.block_number)?;
        debug!("Undid {} with CLR {}", record.lsn, position.lsn);
        return Ok(position);
    }

    let block = record.target_block().ok_or_else(|| {
        RecoveryError::InvariantViolation(format!("record {} does not target a page", record.lsn))
    })?;
    let guard = pool.pin(&block)?;
    let position = {
        let mut page = guard.page_mut();
        check_after_image(&page, record)?;
        let position = log.append(&mut clr)?;
        apply_to_page(&mut page, &clr.body)?;
        page.set_lsn(position.lsn);
        position
    };
    guard.set_modified(record.txn_id, position)?;
    debug!("Undid {} with CLR {}", record.lsn, position.lsn);
    Ok(position)
}
