//! Live child record owned by the process manager

use super::channel::{Channel, ChannelMap};
use super::controller::ControllerShared;
use nix::unistd::Pid;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};

/// One live OS process: its pid, the parent ends of its channels, and a
/// lookup-only link to the controller that started it.
///
/// The manager owns handles; a controller only ever holds a weak reference.
/// Either side going away severs the link.
pub(crate) struct ChildHandle {
    pid: Pid,
    fds: ChannelMap<Option<OwnedFd>>,
    controller: Weak<ControllerShared>,
}

impl ChildHandle {
    pub(crate) fn new(
        pid: Pid,
        fds: ChannelMap<Option<OwnedFd>>,
        controller: Weak<ControllerShared>,
    ) -> Self {
        Self {
            pid,
            fds,
            controller,
        }
    }

    pub(crate) fn pid(&self) -> Pid {
        self.pid
    }

    pub(crate) fn raw_fd(&self, channel: Channel) -> Option<RawFd> {
        self.fds[channel].as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Every fd still open on this handle
    pub(crate) fn raw_fds(&self) -> Vec<RawFd> {
        self.fds
            .iter()
            .filter_map(|(_, fd)| fd.as_ref().map(|fd| fd.as_raw_fd()))
            .collect()
    }

    pub(crate) fn controller(&self) -> Option<Rc<ControllerShared>> {
        self.controller.upgrade()
    }

    /// Sever the back-reference; the manager will reap the pid on its own
    pub(crate) fn detach(&mut self) {
        self.controller = Weak::new();
    }

    pub(crate) fn close(&mut self, channel: Channel) {
        self.fds[channel] = None;
    }

    pub(crate) fn close_all(&mut self) {
        for channel in Channel::ALL {
            self.fds[channel] = None;
        }
    }
}

impl Drop for ChildHandle {
    fn drop(&mut self) {
        // Watches go before the fds so nothing fires on a closed descriptor.
        if let Some(controller) = self.controller.upgrade() {
            controller.release_watches();
        }
        self.close_all();
    }
}
