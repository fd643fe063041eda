use std::ops::Range;

use crate::storage::page::error::PageError;
use crate::storage::page::header::TablePageHeader;
use crate::storage::page::layout::{slot_position, slots_start, RecordLocation, DATA_START, RECORD_OFFSET_SIZE};
use crate::storage::page::page::Page;

/// Slotted tuple layout on top of a [`Page`].
///
/// Tuple data grows forward from the header, the slot array grows backward
/// from the end of the page. Slot numbers are stable: deleting a tuple only
/// empties its slot, so a later undo can put the tuple back at the same
/// RID.
///
/// Header and slot contents come straight off disk, so every offset is
/// checked before it is used; a page that does not add up is reported as
/// [`PageError::Corrupt`].
pub struct TablePage;

impl TablePage {
    pub fn header(page: &Page) -> TablePageHeader {
        TablePageHeader::from_page_bytes(page.data())
    }

    pub fn record_count(page: &Page) -> u32 {
        Self::header(page).record_count
    }

    /// Contiguous bytes between the tuple area and the slot array. A corrupt
    /// page has none.
    pub fn free_space(page: &Page) -> usize {
        Self::checked_header(page)
            .map(|header| Self::free_space_for(page.size(), &header))
            .unwrap_or(0)
    }

    /// Append a tuple into a new slot
    pub fn insert(page: &mut Page, data: &[u8]) -> Result<u32, PageError> {
        let slot = Self::checked_header(page)?.record_count;
        Self::insert_at(page, slot, data)?;
        Ok(slot)
    }

    /// Place a tuple at a specific slot. The slot must be either the next
    /// unused one or an emptied one; redo and undo rely on this to restore
    /// tuples at their logged RID.
    pub fn insert_at(page: &mut Page, slot: u32, data: &[u8]) -> Result<(), PageError> {
        let mut header = Self::checked_header(page)?;
        if slot > header.record_count {
            return Err(PageError::InvalidRecordId);
        }
        let new_slot = slot == header.record_count;
        if !new_slot && !Self::location(page, slot)?.is_empty() {
            return Err(PageError::SlotOccupied(slot));
        }

        let slot_cost = if new_slot { RECORD_OFFSET_SIZE } else { 0 };
        let offset = Self::reserve(page, &mut header, data.len() + slot_cost)?;

        page.data_mut()[offset..offset + data.len()].copy_from_slice(data);
        Self::set_location(
            page,
            slot,
            RecordLocation {
                offset: offset as u32,
                length: data.len() as u32,
            },
        )?;

        header.free_space_offset = (offset + data.len()) as u32;
        if new_slot {
            header.record_count += 1;
        }
        header.live_count += 1;
        header.write_to(page.data_mut());
        Ok(())
    }

    /// Empty a slot, returning the tuple it held
    pub fn delete(page: &mut Page, slot: u32) -> Result<Vec<u8>, PageError> {
        let old = Self::get(page, slot)?;
        let mut header = Self::header(page);
        header.live_count = header
            .live_count
            .checked_sub(1)
            .ok_or_else(|| PageError::Corrupt(format!("slot {slot} is live but the live count is zero")))?;
        Self::set_location(page, slot, RecordLocation::EMPTY)?;
        header.write_to(page.data_mut());
        Ok(old)
    }

    /// Replace the tuple in a slot, returning the previous tuple
    pub fn update(page: &mut Page, slot: u32, data: &[u8]) -> Result<Vec<u8>, PageError> {
        let old = Self::get(page, slot)?;
        let location = Self::location(page, slot)?;

        if data.len() <= location.length as usize {
            // Fits in place
            let start = location.offset as usize;
            page.data_mut()[start..start + data.len()].copy_from_slice(data);
            Self::set_location(
                page,
                slot,
                RecordLocation {
                    offset: location.offset,
                    length: data.len() as u32,
                },
            )?;
            return Ok(old);
        }

        // Relocation must fit even after compaction, checked before anything moves
        let mut header = Self::checked_header(page)?;
        let others: usize = Self::tuples(page)?
            .iter()
            .filter(|(s, _)| *s != slot)
            .map(|(_, d)| d.len())
            .sum();
        let slots_start = Self::slots_start_of(page.size(), &header)?;
        if DATA_START + others + data.len() > slots_start {
            return Err(PageError::InsufficientSpace);
        }

        // Drop the old copy first so compaction can reuse its space
        Self::set_location(page, slot, RecordLocation::EMPTY)?;
        let offset = Self::reserve(page, &mut header, data.len())?;
        page.data_mut()[offset..offset + data.len()].copy_from_slice(data);
        Self::set_location(
            page,
            slot,
            RecordLocation {
                offset: offset as u32,
                length: data.len() as u32,
            },
        )?;
        header.free_space_offset = (offset + data.len()) as u32;
        header.write_to(page.data_mut());
        Ok(old)
    }

    pub fn get(page: &Page, slot: u32) -> Result<Vec<u8>, PageError> {
        let header = Self::checked_header(page)?;
        if slot >= header.record_count {
            return Err(PageError::InvalidRecordId);
        }
        let location = Self::location(page, slot)?;
        if location.is_empty() {
            return Err(PageError::RecordNotFound);
        }
        let range = Self::tuple_range(&header, slot, location)?;
        Ok(page.data()[range].to_vec())
    }

    /// All live tuples with their slots, in slot order
    pub fn tuples(page: &Page) -> Result<Vec<(u32, Vec<u8>)>, PageError> {
        let header = Self::checked_header(page)?;
        let mut live = Vec::with_capacity(header.live_count as usize);
        for slot in 0..header.record_count {
            match Self::get(page, slot) {
                Ok(data) => live.push((slot, data)),
                Err(PageError::RecordNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(live)
    }

    /// Rewrite tuple data contiguously, keeping every slot number
    pub fn compact(page: &mut Page) -> Result<(), PageError> {
        let mut header = Self::checked_header(page)?;
        let live = Self::tuples(page)?;
        let mut offset = DATA_START;
        for (slot, data) in live {
            page.data_mut()[offset..offset + data.len()].copy_from_slice(&data);
            Self::set_location(
                page,
                slot,
                RecordLocation {
                    offset: offset as u32,
                    length: data.len() as u32,
                },
            )?;
            offset += data.len();
        }
        header.free_space_offset = offset as u32;
        header.write_to(page.data_mut());
        Ok(())
    }

    /// Find `needed` contiguous bytes at the free space offset, compacting
    /// once if fragmentation is in the way.
    fn reserve(page: &mut Page, header: &mut TablePageHeader, needed: usize) -> Result<usize, PageError> {
        if Self::free_space_for(page.size(), header) >= needed {
            return Ok(header.free_space_offset as usize);
        }
        Self::compact(page)?;
        *header = Self::header(page);
        if Self::free_space_for(page.size(), header) >= needed {
            Ok(header.free_space_offset as usize)
        } else {
            Err(PageError::InsufficientSpace)
        }
    }

    /// Header of `page`, rejected unless its counts fit a page of this size
    fn checked_header(page: &Page) -> Result<TablePageHeader, PageError> {
        let header = Self::header(page);
        let slots_start = Self::slots_start_of(page.size(), &header)?;
        let free = header.free_space_offset as usize;
        if free < DATA_START || free > slots_start {
            return Err(PageError::Corrupt(format!(
                "free space offset {free} is outside {DATA_START}..={slots_start}"
            )));
        }
        if header.live_count > header.record_count {
            return Err(PageError::Corrupt(format!(
                "{} live tuples in {} slots",
                header.live_count, header.record_count
            )));
        }
        Ok(header)
    }

    fn slots_start_of(page_size: usize, header: &TablePageHeader) -> Result<usize, PageError> {
        slots_start(page_size, header.record_count).ok_or_else(|| {
            PageError::Corrupt(format!(
                "{} slots do not fit in a page of {page_size} bytes",
                header.record_count
            ))
        })
    }

    /// Bytes of a live tuple, which must lie inside the tuple area
    fn tuple_range(header: &TablePageHeader, slot: u32, location: RecordLocation) -> Result<Range<usize>, PageError> {
        let start = location.offset as usize;
        let end = start + location.length as usize;
        if start < DATA_START || end > header.free_space_offset as usize {
            return Err(PageError::Corrupt(format!(
                "slot {slot} points at {start}..{end}, outside the tuple area"
            )));
        }
        Ok(start..end)
    }

    fn free_space_for(page_size: usize, header: &TablePageHeader) -> usize {
        slots_start(page_size, header.record_count)
            .map_or(0, |start| start.saturating_sub(header.free_space_offset as usize))
    }

    fn location(page: &Page, slot: u32) -> Result<RecordLocation, PageError> {
        let pos = slot_position(page.size(), slot).ok_or(PageError::InvalidRecordId)?;
        Ok(RecordLocation::from_bytes(&page.data()[pos..pos + RECORD_OFFSET_SIZE]))
    }

    fn set_location(page: &mut Page, slot: u32, location: RecordLocation) -> Result<(), PageError> {
        let pos = slot_position(page.size(), slot).ok_or(PageError::InvalidRecordId)?;
        page.data_mut()[pos..pos + RECORD_OFFSET_SIZE].copy_from_slice(&location.to_bytes());
        Ok(())
    }
}
