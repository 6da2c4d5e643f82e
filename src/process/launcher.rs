//! Fire-and-forget launch via double fork

use super::spawn::{self, ChildStage, ExecPlan};
use crate::config::EngineConfig;
use crate::error::{ProcessError, Result};
use crate::sys;
use nix::errno::Errno;
use nix::libc;
use nix::unistd::{fork, ForkResult};
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Starts a program that nobody tracks.
///
/// The immediate child forks the real one and exits at once; it is reaped
/// here, so the grandchild is re-parented to init and never becomes our
/// zombie. Output is not captured and the grandchild inherits our stdio.
///
/// ```no_run
/// use childmux::process::Launcher;
///
/// let pid = Launcher::new("xdg-open").arg("notes.txt").spawn()?;
/// println!("started {pid}");
/// # Ok::<(), childmux::error::ProcessError>(())
/// ```
#[derive(Debug, Clone)]
pub struct Launcher {
    argv: Vec<OsString>,
    working_dir: Option<PathBuf>,
    env_override: Option<Vec<String>>,
}

impl Launcher {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            argv: vec![program.into()],
            working_dir: None,
            env_override: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replace the environment with `KEY=value` entries
    pub fn env_override(mut self, entries: Vec<String>) -> Self {
        self.env_override = Some(entries);
        self
    }

    pub fn spawn(&self) -> Result<u32> {
        self.spawn_with(&EngineConfig::default())
    }

    /// Launch and return the grandchild's pid once it has exec'd
    pub fn spawn_with(&self, config: &EngineConfig) -> Result<u32> {
        let mut plan = ExecPlan::new(
            &self.argv,
            self.working_dir.as_deref(),
            self.env_override.as_deref(),
            config,
        )?;

        let (detect_read, detect_write) = sys::cloexec_pipe().map_err(ProcessError::Pipe)?;
        let (pid_read, pid_write) = sys::cloexec_pipe().map_err(ProcessError::Pipe)?;

        let intermediate = match unsafe { fork() } {
            Err(e) => {
                warn!(program = plan.program(), error = %e, "fork failed");
                return Err(ProcessError::Fork(e));
            }
            Ok(ForkResult::Child) => unsafe {
                fork_grandchild(&mut plan, detect_write.as_raw_fd(), pid_write.as_raw_fd())
            },
            Ok(ForkResult::Parent { child }) => child,
        };

        drop(detect_write);
        drop(pid_write);

        spawn::reap_blocking(intermediate);
        let grandchild = read_pid(pid_read);

        if let Some(failure) = spawn::await_exec(detect_read) {
            return Err(failure.into_error(&plan));
        }

        match grandchild {
            Some(pid) => {
                debug!(pid, program = plan.program(), "detached child started");
                Ok(pid)
            }
            None => Err(ProcessError::Fork(Errno::EIO)),
        }
    }
}

/// Body of the intermediate child: fork once more and leave.
unsafe fn fork_grandchild(plan: &mut ExecPlan, detect_fd: RawFd, pid_fd: RawFd) -> ! {
    match libc::fork() {
        -1 => {
            spawn::report_failure(detect_fd, ChildStage::Fork, Errno::last() as i32);
            libc::_exit(1);
        }
        0 => {
            let pid = libc::getpid();
            let bytes = pid.to_ne_bytes();
            libc::write(pid_fd, bytes.as_ptr().cast::<libc::c_void>(), bytes.len());
            libc::close(pid_fd);

            let mut report_fd = detect_fd;
            spawn::wire_child(&mut [], &mut report_fd, &[]);
            plan.exec(report_fd)
        }
        _ => libc::_exit(0),
    }
}

/// The grandchild pid relayed over `read_end`, if it got that far
fn read_pid(read_end: OwnedFd) -> Option<u32> {
    let fd = read_end.as_raw_fd();
    let mut buf = [0u8; std::mem::size_of::<libc::pid_t>()];
    let mut got = 0;
    while got < buf.len() {
        match sys::read_some(fd, &mut buf[got..]) {
            Ok(0) => break,
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (got == buf.len()).then(|| libc::pid_t::from_ne_bytes(buf) as u32)
}
