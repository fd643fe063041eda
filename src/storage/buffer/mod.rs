pub mod error;
pub mod frame;
pub mod guard;
pub mod manager;
mod replacer;

pub use error::BufferPoolError;
pub use guard::BufferGuard;
pub use manager::{BufferPoolConfig, BufferPoolManager, BufferPoolStats};
