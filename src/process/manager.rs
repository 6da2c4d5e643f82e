//! Process-wide child reaper driven by a SIGCHLD self-pipe

use super::channel::Channel;
use super::handle::ChildHandle;
use crate::error::{ProcessError, Result};
use crate::reactor::{Interest, Reactor, WatchId};
use crate::sys;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::cell::{Cell, RefCell};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use tracing::{debug, warn};

/// Write end of the self-pipe, -1 when no manager is installed
static WAKE_FD: AtomicI32 = AtomicI32::new(-1);

/// SIGCHLD has exactly one owner per process
static MANAGER_ACTIVE: AtomicBool = AtomicBool::new(false);

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut libc::c_int {
    #[cfg(target_os = "linux")]
    return libc::__errno_location();
    #[cfg(target_os = "android")]
    return libc::__errno();
}

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut libc::c_int {
    libc::__error()
}

/// The interrupted code may be between a syscall and its errno check, so
/// errno is put back before returning.
extern "C" fn on_sigchld(_: libc::c_int) {
    let saved = nix::errno::errno();
    let fd = WAKE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe { libc::write(fd, b"C".as_ptr().cast::<libc::c_void>(), 1) };
    }
    unsafe { *errno_location() = saved };
}

/// Owns the SIGCHLD self-pipe and every live [`ChildHandle`].
///
/// On each wakeup it reaps exited children, drains whatever they left in
/// their output channels, notifies their controllers, and frees the handles.
/// Handles are only ever removed from inside that scan or at shutdown.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Rc<ManagerInner>,
}

struct ManagerInner {
    reactor: Reactor,
    wake_read: OwnedFd,
    _wake_write: OwnedFd,
    watch: Cell<Option<WatchId>>,
    previous: RefCell<Option<SigAction>>,
    handles: RefCell<Vec<Rc<RefCell<ChildHandle>>>>,
    scanning: Cell<bool>,
    shut_down: Cell<bool>,
    block_size: usize,
    on_idle: RefCell<Option<Box<dyn Fn()>>>,
}

impl ProcessManager {
    /// Install the SIGCHLD handler and start watching the self-pipe.
    ///
    /// Fails with [`ProcessError::ManagerBusy`] while another manager exists.
    pub(crate) fn create(reactor: &Reactor, block_size: usize) -> Result<Self> {
        if MANAGER_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ProcessError::ManagerBusy);
        }

        let result = Self::install(reactor, block_size);
        if result.is_err() {
            MANAGER_ACTIVE.store(false, Ordering::SeqCst);
        }
        result
    }

    fn install(reactor: &Reactor, block_size: usize) -> Result<Self> {
        let (wake_read, wake_write) = sys::cloexec_pipe().map_err(ProcessError::Pipe)?;
        sys::set_nonblocking(wake_read.as_raw_fd()).map_err(ProcessError::Pipe)?;
        sys::set_nonblocking(wake_write.as_raw_fd()).map_err(ProcessError::Pipe)?;

        WAKE_FD.store(wake_write.as_raw_fd(), Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_sigchld),
            SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
            SigSet::empty(),
        );
        let previous = match unsafe { sigaction(Signal::SIGCHLD, &action) } {
            Ok(previous) => previous,
            Err(e) => {
                WAKE_FD.store(-1, Ordering::SeqCst);
                return Err(ProcessError::SignalHandler(e));
            }
        };

        let read_fd = wake_read.as_raw_fd();
        let inner = Rc::new(ManagerInner {
            reactor: reactor.clone(),
            wake_read,
            _wake_write: wake_write,
            watch: Cell::new(None),
            previous: RefCell::new(Some(previous)),
            handles: RefCell::new(Vec::new()),
            scanning: Cell::new(false),
            shut_down: Cell::new(false),
            block_size: block_size.max(1),
            on_idle: RefCell::new(None),
        });

        let weak = Rc::downgrade(&inner);
        let watch = reactor.add_watch(read_fd, Interest::Readable, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_wakeup();
            }
        });
        inner.watch.set(Some(watch));

        debug!(wake_fd = read_fd, "process manager started");
        Ok(Self { inner })
    }

    /// Number of children not yet reaped
    pub fn live_handles(&self) -> usize {
        self.inner.handles.borrow().len()
    }

    /// Whether a SIGCHLD wakeup is waiting in the self-pipe
    pub fn wakeup_pending(&self) -> bool {
        sys::poll_readable(self.inner.wake_read.as_raw_fd(), 0)
    }

    /// Process a waiting wakeup now instead of on the next reactor turn
    pub fn pump(&self) {
        if self.wakeup_pending() {
            self.inner.on_wakeup();
        }
    }

    /// Scan children unconditionally; used when a caller already observed an exit
    pub(crate) fn pump_now(&self) {
        self.inner.on_wakeup();
    }

    pub(crate) fn register(&self, handle: Rc<RefCell<ChildHandle>>) {
        debug!(pid = %handle.borrow().pid(), "tracking child");
        self.inner.handles.borrow_mut().push(handle);
    }

    /// Parent-side fds of every tracked child, for closing in a new child
    pub(crate) fn tracked_fds(&self) -> Vec<RawFd> {
        self.inner
            .handles
            .borrow()
            .iter()
            .flat_map(|h| h.borrow().raw_fds())
            .collect()
    }

    /// Called whenever a scan leaves the handle list empty
    pub(crate) fn set_on_idle(&self, callback: impl Fn() + 'static) {
        *self.inner.on_idle.borrow_mut() = Some(Box::new(callback));
    }

    pub(crate) fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl ManagerInner {
    fn on_wakeup(&self) {
        if self.scanning.get() || self.shut_down.get() {
            return;
        }
        self.scanning.set(true);
        if let Some(id) = self.watch.get() {
            self.reactor.set_enabled(id, false);
        }

        self.drain_wake_pipe();
        self.reap_exited();

        if let Some(id) = self.watch.get() {
            self.reactor.set_enabled(id, true);
        }
        self.scanning.set(false);
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match sys::read_some(self.wake_read.as_raw_fd(), &mut buf) {
                Ok(n) if n == buf.len() => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                _ => break,
            }
        }
    }

    fn reap_exited(&self) {
        let snapshot: Vec<Rc<RefCell<ChildHandle>>> = self.handles.borrow().clone();
        let mut removed = 0;

        for handle in snapshot {
            let (pid, controller) = {
                let h = handle.borrow();
                (h.pid(), h.controller())
            };

            let exited = match &controller {
                Some(controller) => !controller.poll_exit(),
                None => reap_detached(pid),
            };
            if !exited {
                continue;
            }

            let mut drained = Vec::new();
            for channel in Channel::READABLE {
                let fd = handle.borrow().raw_fd(channel);
                let Some(fd) = fd else {
                    continue;
                };
                if sys::bytes_pending(fd) == 0 {
                    continue;
                }
                let (bytes, _) = sys::drain_pending(fd, self.block_size);
                if bytes.is_empty() {
                    continue;
                }
                debug!(%pid, %channel, bytes = bytes.len(), "drained output after exit");
                if let Some(controller) = &controller {
                    controller.absorb(channel, bytes);
                    drained.push(channel);
                }
            }

            if let Some(controller) = &controller {
                controller.release_watches();
            }
            handle.borrow_mut().close_all();

            if let Some(controller) = &controller {
                controller.exited(&drained);
            }

            self.handles
                .borrow_mut()
                .retain(|h| !Rc::ptr_eq(h, &handle));
            removed += 1;
            debug!(%pid, "child reaped");
        }

        if removed > 0 && self.handles.borrow().is_empty() {
            if let Some(callback) = self.on_idle.borrow().as_ref() {
                callback();
            }
        }
    }

    fn shutdown(&self) {
        if self.shut_down.replace(true) {
            return;
        }

        if let Some(id) = self.watch.take() {
            self.reactor.remove_watch(id);
        }

        let handles = std::mem::take(&mut *self.handles.borrow_mut());
        if !handles.is_empty() {
            debug!(count = handles.len(), "manager shut down with children still running");
        }
        drop(handles);

        if let Some(previous) = self.previous.borrow_mut().take() {
            if let Err(e) = unsafe { sigaction(Signal::SIGCHLD, &previous) } {
                warn!(error = %e, "failed to restore previous SIGCHLD handler");
            }
        }
        WAKE_FD.store(-1, Ordering::SeqCst);
        MANAGER_ACTIVE.store(false, Ordering::SeqCst);
        debug!("process manager stopped");
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Non-blocking reap of a child whose controller is gone
fn reap_detached(pid: Pid) -> bool {
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => return false,
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return true,
            Ok(_) => return false,
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => return true,
            Err(e) => {
                warn!(%pid, error = %e, "waitpid failed on detached child");
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sigchld_handler_preserves_errno() {
        assert!(
            MANAGER_ACTIVE
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
            "no manager should be installed in unit tests"
        );

        // Writing to a read end fails with EBADF inside the handler.
        let (read_end, _write_end) = sys::cloexec_pipe().expect("pipe");
        WAKE_FD.store(read_end.as_raw_fd(), Ordering::SeqCst);

        unsafe { *errno_location() = libc::ENOMEM };
        on_sigchld(libc::SIGCHLD);
        let after = nix::errno::errno();

        WAKE_FD.store(-1, Ordering::SeqCst);
        MANAGER_ACTIVE.store(false, Ordering::SeqCst);

        assert_eq!(after, libc::ENOMEM, "errno was clobbered by the handler");
    }
}
