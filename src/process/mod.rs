//! Child process engine: spawning, channel I/O, and reaping

mod channel;
mod context;
mod controller;
mod handle;
mod launcher;
mod manager;
mod spawn;

pub use channel::{Channel, ChannelFlags, ChannelMap};
pub use context::ProcessContext;
pub use controller::{ChannelHandler, ExitHandler, LaunchHandler, ProcessController};
pub use launcher::Launcher;
pub use manager::ProcessManager;
pub use spawn::merged_environment;
