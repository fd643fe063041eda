// Recovery Module

pub mod apply;
pub mod checkpoint;
pub mod crash_recovery;
pub mod error;
pub mod recovery_manager;

pub use checkpoint::{CheckpointConfig, CheckpointManager};
pub use crash_recovery::{AnalysisResult, CrashRecovery, RecoveryStats};
pub use error::{RecoveryError, Result};
pub use recovery_manager::{RecoveryManager, TxnProgress};
