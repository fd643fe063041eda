pub mod types;

pub use types::{BlockId, FrameId, Lsn, LogPosition, Rid, TxnId, INVALID_LSN};
