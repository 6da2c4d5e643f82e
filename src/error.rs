//! Error types for process setup

use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Setup failures surfaced by `start()`, `launch()` and the launcher.
///
/// Runtime I/O failures on a running child's channels are not errors at this
/// level; they close the affected channel.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Socket pair or pipe allocation failed
    #[error("Failed to allocate channel: {0}")]
    Pipe(#[source] io::Error),

    /// fork() failed
    #[error("Failed to fork: {0}")]
    Fork(#[source] Errno),

    /// The child could not exec the program
    #[error("Failed to execute {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The child could not change into the working directory
    #[error("Failed to enter working directory {}: {source}", dir.display())]
    WorkingDirectory {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An argument or environment entry contains an interior NUL byte
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// `start()` was called without a program
    #[error("No program configured")]
    NotConfigured,

    /// Another process manager already owns SIGCHLD in this process
    #[error("A process manager is already active in this process")]
    ManagerBusy,

    /// Installing the SIGCHLD handler failed
    #[error("Failed to install SIGCHLD handler: {0}")]
    SignalHandler(#[source] Errno),
}

/// Result type for process setup operations
pub type Result<T> = std::result::Result<T, ProcessError>;
