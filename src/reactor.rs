//! Single-threaded readiness reactor
//!
//! The process engine never blocks; it registers interest in file descriptors
//! and reacts when the reactor reports them ready. A `Reactor` is a cheap
//! clonable handle, so controllers and the process manager can each keep one.
//!
//! Dispatch rules:
//! - a watch is dispatched only if it is still registered and enabled at the
//!   moment its turn comes, so a callback may disable or remove other watches
//!   (or itself) safely
//! - a callback that is already running is never re-entered from a nested turn
//! - deferred callbacks run at the start of the next turn, in FIFO order

use nix::errno::Errno;
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Identifier of a registered readiness watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WatchId(u64);

/// Readiness a watch is interested in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn poll_events(self) -> PollFlags {
        match self {
            Interest::Readable => PollFlags::POLLIN,
            Interest::Writable => PollFlags::POLLOUT,
        }
    }
}

type WatchCallback = Rc<RefCell<dyn FnMut()>>;
type Deferred = Box<dyn FnOnce()>;

struct Watch {
    fd: RawFd,
    interest: Interest,
    enabled: bool,
    callback: WatchCallback,
}

#[derive(Default)]
struct ReactorState {
    watches: BTreeMap<WatchId, Watch>,
    deferred: VecDeque<Deferred>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct Reactor {
    state: Rc<RefCell<ReactorState>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an enabled watch on `fd`
    pub fn add_watch(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: impl FnMut() + 'static,
    ) -> WatchId {
        let mut state = self.state.borrow_mut();
        let id = WatchId(state.next_id);
        state.next_id += 1;
        state.watches.insert(
            id,
            Watch {
                fd,
                interest,
                enabled: true,
                callback: Rc::new(RefCell::new(callback)),
            },
        );
        id
    }

    pub fn set_enabled(&self, id: WatchId, enabled: bool) {
        if let Some(watch) = self.state.borrow_mut().watches.get_mut(&id) {
            watch.enabled = enabled;
        }
    }

    pub fn is_enabled(&self, id: WatchId) -> bool {
        self.state
            .borrow()
            .watches
            .get(&id)
            .is_some_and(|w| w.enabled)
    }

    /// Unregister a watch. Must happen before its fd is closed.
    pub fn remove_watch(&self, id: WatchId) {
        // The callback may own values whose Drop touches the reactor again,
        // so release it only after the state borrow ends.
        let removed = self.state.borrow_mut().watches.remove(&id);
        drop(removed);
    }

    /// Number of registered watches, enabled or not
    pub fn watch_count(&self) -> usize {
        self.state.borrow().watches.len()
    }

    /// Queue a zero-delay single-shot callback for the next turn
    pub fn defer(&self, callback: impl FnOnce() + 'static) {
        self.state.borrow_mut().deferred.push_back(Box::new(callback));
    }

    fn run_deferred(&self) -> usize {
        let queued = self.state.borrow().deferred.len();
        let mut ran = 0;
        while ran < queued {
            let next = self.state.borrow_mut().deferred.pop_front();
            let Some(callback) = next else {
                break;
            };
            callback();
            ran += 1;
        }
        ran
    }

    /// Run one iteration: deferred callbacks, then a single poll over the
    /// enabled watches and dispatch of the ready ones.
    ///
    /// `None` waits indefinitely. Returns the number of callbacks run.
    pub fn turn(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let mut dispatched = self.run_deferred();

        let (ids, interests): (Vec<WatchId>, Vec<(RawFd, PollFlags)>) = {
            let state = self.state.borrow();
            state
                .watches
                .iter()
                .filter(|(_, w)| w.enabled)
                .map(|(id, w)| (*id, (w.fd, w.interest.poll_events())))
                .unzip()
        };

        let pending_deferred = !self.state.borrow().deferred.is_empty();
        let timeout_ms: libc::c_int = if dispatched > 0 || pending_deferred {
            0
        } else {
            match timeout {
                Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
                None => -1,
            }
        };

        // Registered fds stay open until their watch is removed.
        let borrowed: Vec<BorrowedFd<'_>> = interests
            .iter()
            .map(|&(fd, _)| unsafe { BorrowedFd::borrow_raw(fd) })
            .collect();
        let mut pollfds: Vec<PollFd<'_>> = borrowed
            .iter()
            .zip(&interests)
            .map(|(fd, &(_, events))| PollFd::new(fd, events))
            .collect();

        match poll(&mut pollfds, timeout_ms) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(dispatched),
            Err(e) => return Err(e.into()),
        }

        for ((id, &(fd, _)), pfd) in ids.iter().zip(&interests).zip(&pollfds) {
            let revents = pfd.revents().unwrap_or(PollFlags::POLLERR);
            if revents.is_empty() {
                continue;
            }

            let callback = {
                let mut state = self.state.borrow_mut();
                let Some(watch) = state.watches.get_mut(id) else {
                    continue;
                };
                if !watch.enabled || watch.fd != fd {
                    continue;
                }
                if revents.contains(PollFlags::POLLNVAL) {
                    warn!(fd, "watch on a closed descriptor, disabling");
                    watch.enabled = false;
                    continue;
                }
                Rc::clone(&watch.callback)
            };

            let Ok(mut guard) = callback.try_borrow_mut() else {
                continue;
            };
            (&mut *guard)();
            drop(guard);
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Turn until `done` returns true or `timeout` elapses.
    ///
    /// Returns whether `done` was satisfied.
    pub fn run_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let slice = (deadline - now).min(Duration::from_millis(50));
            self.turn(Some(slice))?;
        }
    }
}
