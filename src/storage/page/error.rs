use thiserror::Error;

#[derive(Error, Debug)]
pub enum PageError {
    #[error("Access of {len} bytes at offset {offset} is outside a page of {size} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },
    #[error("Offset {0} falls inside the page LSN header")]
    ReservedOffset(usize),
    #[error("Stored string is not valid UTF-8")]
    InvalidUtf8,
    #[error("Not enough space in page")]
    InsufficientSpace,
    #[error("Record not found")]
    RecordNotFound,
    #[error("Invalid record ID")]
    InvalidRecordId,
    #[error("Slot {0} is already occupied")]
    SlotOccupied(u32),
    #[error("Corrupt table page: {0}")]
    Corrupt(String),
}
