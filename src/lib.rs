//! childmux library - asynchronous child processes on a single-threaded reactor

pub mod buffer;
pub mod config;
pub mod error;
pub mod process;
pub mod reactor;
mod sys;

// Re-export commonly used types
pub use buffer::MemBuffer;
pub use config::{Config, EngineConfig};
pub use error::{ProcessError, Result};
pub use process::{Channel, ChannelFlags, Launcher, ProcessContext, ProcessController};
pub use reactor::Reactor;
