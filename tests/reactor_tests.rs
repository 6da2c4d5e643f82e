//! Tests for the readiness reactor

use childmux::reactor::{Interest, Reactor};
use std::cell::{Cell, RefCell};
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

const SHORT: Option<Duration> = Some(Duration::from_millis(20));

#[cfg(test)]
mod watch_tests {
    use super::*;

    #[test]
    fn test_readable_watch_fires_when_data_arrives() {
        let reactor = Reactor::new();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let hits = Rc::new(Cell::new(0));

        let counter = Rc::clone(&hits);
        reactor.add_watch(rx.as_raw_fd(), Interest::Readable, move || {
            counter.set(counter.get() + 1);
        });

        reactor.turn(SHORT).unwrap();
        assert_eq!(hits.get(), 0, "Nothing to read yet");

        tx.write_all(b"ping").unwrap();
        reactor.turn(SHORT).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_disabled_watch_does_not_fire() {
        let reactor = Reactor::new();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let hits = Rc::new(Cell::new(0));

        let counter = Rc::clone(&hits);
        let id = reactor.add_watch(rx.as_raw_fd(), Interest::Readable, move || {
            counter.set(counter.get() + 1);
        });
        assert!(reactor.is_enabled(id));

        reactor.set_enabled(id, false);
        tx.write_all(b"ping").unwrap();
        reactor.turn(SHORT).unwrap();
        assert_eq!(hits.get(), 0);

        reactor.set_enabled(id, true);
        reactor.turn(SHORT).unwrap();
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn test_writable_watch_fires_on_empty_socket() {
        let reactor = Reactor::new();
        let (tx, _rx) = UnixStream::pair().unwrap();
        let fired = Rc::new(Cell::new(false));

        let flag = Rc::clone(&fired);
        reactor.add_watch(tx.as_raw_fd(), Interest::Writable, move || flag.set(true));
        reactor.turn(SHORT).unwrap();
        assert!(fired.get());
    }

    #[test]
    fn test_watch_can_remove_itself() {
        let reactor = Reactor::new();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        tx.write_all(b"x").unwrap();

        let hits = Rc::new(Cell::new(0));
        let slot: Rc<RefCell<Option<childmux::reactor::WatchId>>> = Rc::new(RefCell::new(None));

        let counter = Rc::clone(&hits);
        let own_id = Rc::clone(&slot);
        let handle = reactor.clone();
        let id = reactor.add_watch(rx.as_raw_fd(), Interest::Readable, move || {
            counter.set(counter.get() + 1);
            if let Some(id) = own_id.borrow_mut().take() {
                handle.remove_watch(id);
            }
        });
        *slot.borrow_mut() = Some(id);

        reactor.turn(SHORT).unwrap();
        reactor.turn(SHORT).unwrap();
        assert_eq!(hits.get(), 1, "Removed watch must not fire again");
        assert_eq!(reactor.watch_count(), 0);
    }

    #[test]
    fn test_callback_removing_a_later_watch_skips_it() {
        let reactor = Reactor::new();
        let (mut tx_a, rx_a) = UnixStream::pair().unwrap();
        let (mut tx_b, rx_b) = UnixStream::pair().unwrap();
        tx_a.write_all(b"a").unwrap();
        tx_b.write_all(b"b").unwrap();

        let second_fired = Rc::new(Cell::new(false));
        let victim: Rc<Cell<Option<childmux::reactor::WatchId>>> = Rc::new(Cell::new(None));

        let handle = reactor.clone();
        let target = Rc::clone(&victim);
        reactor.add_watch(rx_a.as_raw_fd(), Interest::Readable, move || {
            if let Some(id) = target.take() {
                handle.remove_watch(id);
            }
        });
        let flag = Rc::clone(&second_fired);
        let id = reactor.add_watch(rx_b.as_raw_fd(), Interest::Readable, move || flag.set(true));
        victim.set(Some(id));

        reactor.turn(SHORT).unwrap();
        assert!(!second_fired.get());
    }
}

#[cfg(test)]
mod deferred_tests {
    use super::*;

    #[test]
    fn test_deferred_callbacks_run_in_order_on_next_turn() {
        let reactor = Reactor::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let order = Rc::clone(&order);
            reactor.defer(move || order.borrow_mut().push(i));
        }
        assert!(order.borrow().is_empty(), "Nothing runs before a turn");

        let ran = reactor.turn(None).unwrap();
        assert_eq!(ran, 3);
        assert_eq!(*order.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn test_callback_deferred_from_deferred_runs_next_turn() {
        let reactor = Reactor::new();
        let hits = Rc::new(Cell::new(0));

        let handle = reactor.clone();
        let outer = Rc::clone(&hits);
        reactor.defer(move || {
            outer.set(outer.get() + 1);
            let inner = Rc::clone(&outer);
            handle.defer(move || inner.set(inner.get() + 10));
        });

        reactor.turn(None).unwrap();
        assert_eq!(hits.get(), 1);
        reactor.turn(None).unwrap();
        assert_eq!(hits.get(), 11);
    }

    #[test]
    fn test_run_until_times_out() {
        let reactor = Reactor::new();
        let done = reactor
            .run_until(Duration::from_millis(30), || false)
            .unwrap();
        assert!(!done);
    }

    #[test]
    fn test_run_until_sees_deferred_work() {
        let reactor = Reactor::new();
        let flag = Rc::new(Cell::new(false));
        let setter = Rc::clone(&flag);
        reactor.defer(move || setter.set(true));

        let done = reactor
            .run_until(Duration::from_secs(1), || flag.get())
            .unwrap();
        assert!(done);
    }
}
