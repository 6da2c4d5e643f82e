//! Per-process controller: configuration, start, non-blocking channel I/O,
//! and notification dispatch

use super::channel::{Channel, ChannelFlags, ChannelMap};
use super::context::ProcessContext;
use super::handle::ChildHandle;
use super::manager::ProcessManager;
use super::spawn::{self, ExecPlan};
use crate::buffer::MemBuffer;
use crate::error::{ProcessError, Result};
use crate::reactor::{Interest, WatchId};
use crate::sys;
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::cell::RefCell;
use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use tracing::{debug, warn};

/// Handler for output-ready and write-flushed notifications
pub type ChannelHandler = Rc<dyn Fn(&ProcessController, Channel)>;
/// Handler for the process-exited notification
pub type ExitHandler = Rc<dyn Fn(&ProcessController)>;
/// Handler for launch-finished; the flag tells whether the input was delivered
pub type LaunchHandler = Rc<dyn Fn(&ProcessController, bool)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExitState {
    Exited(i32),
    Signaled(Signal),
    /// Reaped by someone else before we could look
    Vanished,
}

struct ControllerState {
    argv: Vec<OsString>,
    working_dir: Option<PathBuf>,
    channels: ChannelFlags,
    generic_in_fd: RawFd,
    generic_out_fd: RawFd,

    active: ChannelFlags,
    pid: Option<Pid>,
    handle: Weak<RefCell<ChildHandle>>,
    exit: Option<ExitState>,
    /// Read buffers on readable channels, pending-write queues on writable ones
    buffers: ChannelMap<MemBuffer>,
    watches: ChannelMap<Option<WatchId>>,
    close_after_flush: ChannelMap<bool>,
    launch_pending: bool,
    launch_channel: Option<Channel>,
}

impl Default for ControllerState {
    fn default() -> Self {
        Self {
            argv: Vec::new(),
            working_dir: None,
            channels: ChannelFlags::NONE,
            generic_in_fd: 0,
            generic_out_fd: 1,
            active: ChannelFlags::NONE,
            pid: None,
            handle: Weak::new(),
            exit: None,
            buffers: ChannelMap::default(),
            watches: ChannelMap::default(),
            close_after_flush: ChannelMap::default(),
            launch_pending: false,
            launch_channel: None,
        }
    }
}

#[derive(Default)]
struct Handlers {
    output: ChannelMap<Option<ChannelHandler>>,
    flushed: ChannelMap<Option<ChannelHandler>>,
    exited: Option<ExitHandler>,
    launch_finished: Option<LaunchHandler>,
}

/// Shared core of a controller. Watches and child handles reach it through
/// weak references only.
pub(crate) struct ControllerShared {
    ctx: ProcessContext,
    state: RefCell<ControllerState>,
    handlers: RefCell<Handlers>,
}

/// Starts and talks to one external program at a time.
///
/// Every operation returns immediately. Output is read into per-channel
/// buffers as the reactor reports it; writes are queued and flushed as the
/// child accepts them. Notifications are delivered from reactor callbacks.
pub struct ProcessController {
    shared: Rc<ControllerShared>,
}

impl ProcessController {
    pub fn new(ctx: &ProcessContext) -> Self {
        Self {
            shared: Rc::new(ControllerShared {
                ctx: ctx.clone(),
                state: RefCell::new(ControllerState::default()),
                handlers: RefCell::new(Handlers::default()),
            }),
        }
    }

    /// Set everything needed for the next `start()`. No process is created.
    pub fn configure<I, S>(
        &self,
        argv: I,
        working_dir: Option<PathBuf>,
        channels: ChannelFlags,
        generic_in_fd: RawFd,
        generic_out_fd: RawFd,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut st = self.shared.state.borrow_mut();
        st.argv = argv.into_iter().map(Into::into).collect();
        st.working_dir = working_dir;
        st.channels = channels;
        st.generic_in_fd = generic_in_fd;
        st.generic_out_fd = generic_out_fd;
    }

    /// Program and arguments; a bare program name is looked up in PATH
    pub fn set_program<I, S>(&self, argv: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.shared.state.borrow_mut().argv = argv.into_iter().map(Into::into).collect();
    }

    pub fn set_working_dir(&self, dir: Option<PathBuf>) {
        self.shared.state.borrow_mut().working_dir = dir;
    }

    pub fn set_channels(&self, channels: ChannelFlags) {
        self.shared.state.borrow_mut().channels = channels;
    }

    pub fn set_generic_in_fd(&self, fd: RawFd) {
        self.shared.state.borrow_mut().generic_in_fd = fd;
    }

    pub fn set_generic_out_fd(&self, fd: RawFd) {
        self.shared.state.borrow_mut().generic_out_fd = fd;
    }

    /// Channels requested by configuration
    pub fn channels(&self) -> ChannelFlags {
        self.shared.state.borrow().channels
    }

    /// Channels wired for the current run, after collision resolution
    pub fn active_channels(&self) -> ChannelFlags {
        self.shared.state.borrow().active
    }

    /// Fork and exec the configured program.
    ///
    /// Any previous child is let go first: its channels are closed and the
    /// manager reaps it on its own. Returns only after the child has either
    /// exec'd or reported why it could not. `env_override` replaces the
    /// environment with `KEY=value` entries, keeping the library search path.
    pub fn start(&self, env_override: Option<&[String]>) -> Result<()> {
        self.start_with(env_override, ChannelFlags::NONE)
    }

    /// Start with `extra` channels wired for this run only
    fn start_with(&self, env_override: Option<&[String]>, extra: ChannelFlags) -> Result<()> {
        self.shared.reset();

        let (argv, working_dir, wiring) = {
            let st = self.shared.state.borrow();
            (
                st.argv.clone(),
                st.working_dir.clone(),
                (st.channels | extra).resolve(st.generic_in_fd, st.generic_out_fd),
            )
        };
        if argv.is_empty() {
            return Err(ProcessError::NotConfigured);
        }

        let ctx = &self.shared.ctx;
        let mut plan = ExecPlan::new(&argv, working_dir.as_deref(), env_override, ctx.config())?;
        let manager = ctx.acquire_manager()?;

        let result = self.shared.spawn(&manager, &mut plan, &wiring);
        if let Err(e) = &result {
            debug!(program = plan.program(), error = %e, "start failed");
            ctx.release_if_idle();
        }
        result
    }

    /// Start, feed `initial_input` to the child's stdin, and close stdin once
    /// it is fully written.
    ///
    /// The launch-finished handler fires exactly once: `true` after the input
    /// is flushed, `false` if the start fails or the input cannot be delivered.
    pub fn launch(&self, initial_input: impl Into<Vec<u8>>) -> Result<()> {
        let input = initial_input.into();
        let extra = {
            let st = self.shared.state.borrow();
            let generic_on_stdin =
                st.channels.contains(Channel::GenericIn) && st.generic_in_fd == 0;
            if generic_on_stdin {
                ChannelFlags::NONE
            } else {
                ChannelFlags::STDIN
            }
        };

        let result = self.start_with(None, extra);

        let channel = {
            let mut st = self.shared.state.borrow_mut();
            let channel = if st.active.contains(Channel::Stdin) {
                Channel::Stdin
            } else {
                Channel::GenericIn
            };
            st.launch_pending = true;
            st.launch_channel = result.is_ok().then_some(channel);
            channel
        };

        match result {
            Err(e) => {
                self.shared.defer_launch_result(false);
                Err(e)
            }
            Ok(()) if input.is_empty() => {
                {
                    let mut st = self.shared.state.borrow_mut();
                    self.shared.close_locked(&mut st, channel);
                }
                self.shared.defer_launch_result(true);
                Ok(())
            }
            Ok(()) => {
                self.shared.state.borrow_mut().close_after_flush[channel] = true;
                self.write(channel, input);
                Ok(())
            }
        }
    }

    /// Queue bytes for a writable channel. Never blocks.
    pub fn write(&self, channel: Channel, bytes: impl Into<Vec<u8>>) {
        debug_assert!(channel.is_writable(), "write() on read-only channel {channel}");
        if !channel.is_writable() {
            warn!(%channel, "write() on a read-only channel ignored");
            return;
        }

        let bytes = bytes.into();
        let mut st = self.shared.state.borrow_mut();
        debug_assert!(st.pid.is_some(), "write() before start()");
        debug_assert!(
            st.active.contains(channel),
            "write() on unconfigured channel {channel}"
        );
        if bytes.is_empty() {
            return;
        }

        let Some(watch) = st.watches[channel] else {
            warn!(%channel, bytes = bytes.len(), "channel closed, dropping write");
            return;
        };
        st.buffers[channel].append(bytes);
        self.shared.ctx.reactor().set_enabled(watch, true);
    }

    /// Everything readable on `channel` right now. Never blocks.
    pub fn read(&self, channel: Channel) -> Vec<u8> {
        debug_assert!(channel.is_readable(), "read() on write-only channel {channel}");
        if !channel.is_readable() {
            warn!(%channel, "read() on a write-only channel ignored");
            return Vec::new();
        }

        let mut st = self.shared.state.borrow_mut();
        self.shared.fill(&mut st, channel);
        st.buffers[channel].take_all()
    }

    /// Next complete line without its terminator, if one is available.
    ///
    /// Once the channel has reached end-of-stream the unterminated remainder
    /// is returned as a final line.
    pub fn read_line(&self, channel: Channel) -> Option<Vec<u8>> {
        debug_assert!(channel.is_readable(), "read_line() on write-only channel {channel}");
        if !channel.is_readable() {
            warn!(%channel, "read_line() on a write-only channel ignored");
            return None;
        }

        let mut st = self.shared.state.borrow_mut();
        let mut line = Vec::new();
        if self.shared.line_ready(&mut st, channel, &mut line) {
            st.buffers[channel].discard(line.len() + 1);
            return Some(line);
        }

        let closed = ControllerShared::channel_fd(&st, channel).is_none();
        if closed && !st.buffers[channel].is_empty() {
            return Some(st.buffers[channel].take_all());
        }
        None
    }

    pub fn can_read_line(&self, channel: Channel) -> bool {
        if !channel.is_readable() {
            return false;
        }
        let mut st = self.shared.state.borrow_mut();
        let mut line = Vec::new();
        if self.shared.line_ready(&mut st, channel, &mut line) {
            return true;
        }
        ControllerShared::channel_fd(&st, channel).is_none() && !st.buffers[channel].is_empty()
    }

    /// Buffered bytes plus what the kernel holds for `channel`
    pub fn bytes_available(&self, channel: Channel) -> usize {
        let st = self.shared.state.borrow();
        let pending = ControllerShared::channel_fd(&st, channel).map_or(0, sys::bytes_pending);
        st.buffers[channel].size() + pending
    }

    /// Close one channel. Pending writes on it are discarded.
    pub fn close_channel(&self, channel: Channel) {
        let was_launch_input = {
            let mut st = self.shared.state.borrow_mut();
            self.shared.close_locked(&mut st, channel);
            st.close_after_flush[channel] = false;
            st.launch_channel == Some(channel)
        };
        if was_launch_input {
            self.shared.finish_launch(false);
        }
    }

    /// Ask the child to exit (SIGTERM)
    pub fn terminate(&self) {
        self.shared.signal(Signal::SIGTERM);
    }

    /// Force the child to exit (SIGKILL)
    pub fn kill(&self) {
        self.shared.signal(Signal::SIGKILL);
    }

    /// Non-blocking liveness check.
    ///
    /// Reaps the child if it has exited and caches its status, then lets the
    /// manager process any waiting SIGCHLD wakeup, so the answer never depends
    /// on the reactor having turned first.
    pub fn is_running(&self) -> bool {
        let running = self.shared.poll_exit();

        if let Some(manager) = self.shared.ctx.manager() {
            let exit_unprocessed = !running && self.shared.state.borrow().handle.upgrade().is_some();
            if exit_unprocessed {
                manager.pump_now();
            } else {
                manager.pump();
            }
        }
        running
    }

    pub fn pid(&self) -> Option<u32> {
        self.shared
            .state
            .borrow()
            .pid
            .map(|pid| pid.as_raw() as u32)
    }

    /// Whether the child exited on its own. Valid after `is_running()` has
    /// returned false.
    pub fn normal_exit(&self) -> bool {
        matches!(self.shared.state.borrow().exit, Some(ExitState::Exited(_)))
    }

    /// Exit code 0-255; meaningful only when `normal_exit()` is true
    pub fn exit_status(&self) -> i32 {
        match self.shared.state.borrow().exit {
            Some(ExitState::Exited(code)) => code & 0xff,
            _ => 0,
        }
    }

    /// Signal that terminated the child, if it was killed
    pub fn exit_signal(&self) -> Option<Signal> {
        match self.shared.state.borrow().exit {
            Some(ExitState::Signaled(signal)) => Some(signal),
            _ => None,
        }
    }

    /// Register the output-ready handler for a readable channel.
    ///
    /// The channel's readiness watch is only enabled while a handler is set.
    pub fn on_output_ready(
        &self,
        channel: Channel,
        handler: impl Fn(&ProcessController, Channel) + 'static,
    ) {
        debug_assert!(channel.is_readable(), "output handler on write-only channel {channel}");
        self.shared.handlers.borrow_mut().output[channel] = Some(Rc::new(handler));
        self.shared.sync_read_watch(channel);
    }

    pub fn clear_output_ready(&self, channel: Channel) {
        self.shared.handlers.borrow_mut().output[channel] = None;
        self.shared.sync_read_watch(channel);
    }

    /// Register the handler fired once a writable channel's queue empties
    pub fn on_write_flushed(
        &self,
        channel: Channel,
        handler: impl Fn(&ProcessController, Channel) + 'static,
    ) {
        debug_assert!(channel.is_writable(), "flush handler on read-only channel {channel}");
        self.shared.handlers.borrow_mut().flushed[channel] = Some(Rc::new(handler));
    }

    pub fn clear_write_flushed(&self, channel: Channel) {
        self.shared.handlers.borrow_mut().flushed[channel] = None;
    }

    pub fn on_exited(&self, handler: impl Fn(&ProcessController) + 'static) {
        self.shared.handlers.borrow_mut().exited = Some(Rc::new(handler));
    }

    pub fn clear_exited(&self) {
        self.shared.handlers.borrow_mut().exited = None;
    }

    pub fn on_launch_finished(&self, handler: impl Fn(&ProcessController, bool) + 'static) {
        self.shared.handlers.borrow_mut().launch_finished = Some(Rc::new(handler));
    }
}

impl ControllerShared {
    fn facade(self: &Rc<Self>) -> ProcessController {
        ProcessController {
            shared: Rc::clone(self),
        }
    }

    fn channel_fd(st: &ControllerState, channel: Channel) -> Option<RawFd> {
        let handle = st.handle.upgrade()?;
        let fd = handle.try_borrow().ok()?.raw_fd(channel);
        fd
    }

    /// Drop all per-run state and let go of the previous child
    fn reset(self: &Rc<Self>) {
        self.release_watches();

        let previous = {
            let mut st = self.state.borrow_mut();
            st.pid = None;
            st.exit = None;
            st.active = ChannelFlags::NONE;
            for channel in Channel::ALL {
                st.buffers[channel].clear();
                st.close_after_flush[channel] = false;
            }
            st.launch_pending = false;
            st.launch_channel = None;
            std::mem::take(&mut st.handle)
        };

        if let Some(handle) = previous.upgrade() {
            let mut handle = handle.borrow_mut();
            debug!(pid = %handle.pid(), "detaching previous child");
            handle.detach();
            handle.close_all();
        }
    }

    fn spawn(
        self: &Rc<Self>,
        manager: &ProcessManager,
        plan: &mut ExecPlan,
        wiring: &[(Channel, RawFd)],
    ) -> Result<()> {
        let mut parent_ends: ChannelMap<Option<OwnedFd>> = ChannelMap::default();
        let mut child_ends: Vec<OwnedFd> = Vec::with_capacity(wiring.len());
        let mut redirects: Vec<(RawFd, RawFd)> = Vec::with_capacity(wiring.len());

        for &(channel, target) in wiring {
            let (parent, child) = sys::socket_pair().map_err(ProcessError::Pipe)?;
            sys::set_nonblocking(parent.as_raw_fd()).map_err(ProcessError::Pipe)?;
            redirects.push((child.as_raw_fd(), target));
            parent_ends[channel] = Some(parent);
            child_ends.push(child);
        }

        let (detect_read, detect_write) = sys::cloexec_pipe().map_err(ProcessError::Pipe)?;
        let inherited = manager.tracked_fds();
        let mut report_fd = detect_write.as_raw_fd();

        let pid = match unsafe { fork() } {
            Err(e) => {
                warn!(program = plan.program(), error = %e, "fork failed");
                return Err(ProcessError::Fork(e));
            }
            Ok(ForkResult::Child) => unsafe {
                spawn::wire_child(&mut redirects, &mut report_fd, &inherited);
                plan.exec(report_fd)
            },
            Ok(ForkResult::Parent { child }) => child,
        };

        drop(detect_write);
        drop(child_ends);

        if let Some(failure) = spawn::await_exec(detect_read) {
            spawn::reap_blocking(pid);
            return Err(failure.into_error(plan));
        }
        debug!(%pid, program = plan.program(), "child started");

        let handle = Rc::new(RefCell::new(ChildHandle::new(
            pid,
            parent_ends,
            Rc::downgrade(self),
        )));
        manager.register(Rc::clone(&handle));

        {
            let mut st = self.state.borrow_mut();
            st.pid = Some(pid);
            st.handle = Rc::downgrade(&handle);
            st.active = wiring
                .iter()
                .fold(ChannelFlags::NONE, |acc, &(c, _)| acc | ChannelFlags::from(c));
        }
        self.install_watches(&handle, wiring);
        Ok(())
    }

    fn install_watches(self: &Rc<Self>, handle: &Rc<RefCell<ChildHandle>>, wiring: &[(Channel, RawFd)]) {
        let reactor = self.ctx.reactor();
        for &(channel, _) in wiring {
            let fd = handle.borrow().raw_fd(channel);
            let Some(fd) = fd else {
                continue;
            };

            let weak = Rc::downgrade(self);
            let (id, enabled) = if channel.is_readable() {
                let id = reactor.add_watch(fd, Interest::Readable, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_readable(channel);
                    }
                });
                (id, self.handlers.borrow().output[channel].is_some())
            } else {
                let id = reactor.add_watch(fd, Interest::Writable, move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.on_writable(channel);
                    }
                });
                (id, false)
            };
            reactor.set_enabled(id, enabled);
            self.state.borrow_mut().watches[channel] = Some(id);
        }
    }

    fn sync_read_watch(&self, channel: Channel) {
        let enabled = self.handlers.borrow().output[channel].is_some();
        if let Some(id) = self.state.borrow().watches[channel] {
            self.ctx.reactor().set_enabled(id, enabled);
        }
    }

    /// Remove every readiness watch. Safe to call during teardown.
    pub(crate) fn release_watches(&self) {
        let ids: Vec<WatchId> = match self.state.try_borrow_mut() {
            Ok(mut st) => Channel::ALL
                .into_iter()
                .filter_map(|c| st.watches[c].take())
                .collect(),
            Err(_) => return,
        };
        for id in ids {
            self.ctx.reactor().remove_watch(id);
        }
    }

    fn close_locked(&self, st: &mut ControllerState, channel: Channel) {
        if let Some(id) = st.watches[channel].take() {
            self.ctx.reactor().remove_watch(id);
        }
        if channel.is_writable() {
            st.buffers[channel].clear();
        }
        if let Some(handle) = st.handle.upgrade() {
            if let Ok(mut handle) = handle.try_borrow_mut() {
                handle.close(channel);
            }
        }
    }

    /// Read everything available on `channel` into its buffer.
    ///
    /// Reads one block, then keeps reading while a zero-timeout poll says more
    /// is there. End-of-stream or an error closes the channel. Returns whether
    /// any bytes arrived.
    fn fill(&self, st: &mut ControllerState, channel: Channel) -> bool {
        let Some(fd) = Self::channel_fd(st, channel) else {
            return false;
        };

        let mut block = vec![0u8; self.ctx.config().read_block_size.max(1)];
        let mut received = false;
        loop {
            match sys::read_some(fd, &mut block) {
                Ok(0) => {
                    debug!(%channel, "end of stream");
                    self.close_locked(st, channel);
                    break;
                }
                Ok(n) => {
                    st.buffers[channel].append(&block[..n]);
                    received = true;
                    if !sys::poll_readable(fd, 0) {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(%channel, error = %e, "read failed, closing channel");
                    self.close_locked(st, channel);
                    break;
                }
            }
        }
        received
    }

    /// Confirm a complete line is buffered, pulling pending bytes from the
    /// kernel if the buffer alone does not hold one.
    fn line_ready(&self, st: &mut ControllerState, channel: Channel, line: &mut Vec<u8>) -> bool {
        if st.buffers[channel].scan_line(line) {
            return true;
        }

        let Some(fd) = Self::channel_fd(st, channel) else {
            return false;
        };
        if sys::bytes_pending(fd) == 0 && !sys::poll_readable(fd, 0) {
            return false;
        }
        self.fill(st, channel);
        st.buffers[channel].scan_line(line)
    }

    fn on_readable(self: &Rc<Self>, channel: Channel) {
        let received = {
            let mut st = self.state.borrow_mut();
            self.fill(&mut st, channel)
        };
        if received {
            self.emit_output(channel);
        }
    }

    fn on_writable(self: &Rc<Self>, channel: Channel) {
        enum Outcome {
            Waiting,
            Flushed,
            Failed,
        }

        let outcome = {
            let mut st = self.state.borrow_mut();
            match Self::channel_fd(&st, channel) {
                None => {
                    self.close_locked(&mut st, channel);
                    Outcome::Failed
                }
                Some(fd) => loop {
                    let result = match st.buffers[channel].front() {
                        Some(chunk) => sys::send_some(fd, chunk).map(|n| (n, chunk.len())),
                        None => break Outcome::Flushed,
                    };
                    match result {
                        Ok((n, len)) => {
                            st.buffers[channel].discard(n);
                            if n < len {
                                break Outcome::Waiting;
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Outcome::Waiting,
                        Err(e) => {
                            warn!(%channel, error = %e, "write failed, closing channel");
                            self.close_locked(&mut st, channel);
                            break Outcome::Failed;
                        }
                    }
                },
            }
        };

        match outcome {
            Outcome::Waiting => {}
            Outcome::Flushed => self.after_flush(channel),
            Outcome::Failed => {
                let was_launch_input = self.state.borrow().launch_channel == Some(channel);
                if was_launch_input {
                    self.finish_launch(false);
                }
            }
        }
    }

    fn after_flush(self: &Rc<Self>, channel: Channel) {
        let (closed, was_launch_input) = {
            let mut st = self.state.borrow_mut();
            if let Some(id) = st.watches[channel] {
                self.ctx.reactor().set_enabled(id, false);
            }
            let close = std::mem::take(&mut st.close_after_flush[channel]);
            if close {
                self.close_locked(&mut st, channel);
            }
            (close, st.launch_channel == Some(channel))
        };

        let handler = self.handlers.borrow().flushed[channel].clone();
        if let Some(handler) = handler {
            handler(&self.facade(), channel);
        }
        if closed && was_launch_input {
            self.finish_launch(true);
        }
    }

    fn defer_launch_result(self: &Rc<Self>, delivered: bool) {
        let weak = Rc::downgrade(self);
        self.ctx.reactor().defer(move || {
            if let Some(shared) = weak.upgrade() {
                shared.finish_launch(delivered);
            }
        });
    }

    fn finish_launch(self: &Rc<Self>, delivered: bool) {
        let pending = {
            let mut st = self.state.borrow_mut();
            st.launch_channel = None;
            std::mem::take(&mut st.launch_pending)
        };
        if !pending {
            return;
        }
        let handler = self.handlers.borrow().launch_finished.clone();
        if let Some(handler) = handler {
            handler(&self.facade(), delivered);
        }
    }

    fn emit_output(self: &Rc<Self>, channel: Channel) {
        let handler = self.handlers.borrow().output[channel].clone();
        if let Some(handler) = handler {
            handler(&self.facade(), channel);
        }
    }

    /// Non-blocking reap. Returns whether the child is still running; the
    /// first observed exit is cached.
    pub(crate) fn poll_exit(&self) -> bool {
        let mut st = self.state.borrow_mut();
        if st.exit.is_some() {
            return false;
        }
        let Some(pid) = st.pid else {
            return false;
        };

        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return true,
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!(%pid, code, "child exited");
                    st.exit = Some(ExitState::Exited(code));
                    return false;
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!(%pid, ?signal, "child killed by signal");
                    st.exit = Some(ExitState::Signaled(signal));
                    return false;
                }
                Ok(_) => return true,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    debug!(%pid, "child already reaped elsewhere");
                    st.exit = Some(ExitState::Vanished);
                    return false;
                }
                Err(e) => {
                    warn!(%pid, error = %e, "waitpid failed");
                    return true;
                }
            }
        }
    }

    /// Bytes the manager drained from an exited child's channel
    pub(crate) fn absorb(&self, channel: Channel, bytes: Vec<u8>) {
        self.state.borrow_mut().buffers[channel].append(bytes);
    }

    /// Exit path, run by the manager after draining and closing the channels
    pub(crate) fn exited(self: &Rc<Self>, drained: &[Channel]) {
        for &channel in drained {
            self.emit_output(channel);
        }
        self.finish_launch(false);

        let handler = self.handlers.borrow().exited.clone();
        if let Some(handler) = handler {
            handler(&self.facade());
        }
    }

    fn signal(&self, signal: Signal) {
        let st = self.state.borrow();
        debug_assert!(st.pid.is_some(), "{signal} sent before start()");
        let Some(pid) = st.pid else {
            warn!(?signal, "no child to signal");
            return;
        };
        if st.exit.is_some() {
            return;
        }
        if let Err(e) = kill(pid, signal) {
            warn!(%pid, ?signal, error = %e, "failed to signal child");
        }
    }
}

impl Drop for ControllerShared {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let ids: Vec<WatchId> = Channel::ALL
            .into_iter()
            .filter_map(|c| st.watches[c].take())
            .collect();
        let handle = st.handle.upgrade();

        for id in ids {
            self.ctx.reactor().remove_watch(id);
        }
        if let Some(handle) = handle {
            if let Ok(mut handle) = handle.try_borrow_mut() {
                handle.detach();
                handle.close_all();
            }
        }
    }
}
