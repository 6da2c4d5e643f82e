//! File-descriptor primitives shared by the reactor and the process engine
//!
//! Thin wrappers over nix so the process code reads in terms of what it does
//! rather than which syscall it needs. Errors come back as `io::Error` so
//! callers can match on `ErrorKind`.

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::libc;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self, AddressFamily, MsgFlags, SockFlag, SockType};
use nix::unistd;
use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

nix::ioctl_read_bad!(fionread, libc::FIONREAD, libc::c_int);

/// Connected stream socket pair, both ends close-on-exec
pub fn socket_pair() -> io::Result<(OwnedFd, OwnedFd)> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = SockFlag::SOCK_CLOEXEC;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = SockFlag::empty();

    let pair = socket::socketpair(AddressFamily::Unix, SockType::Stream, None, flags)?;

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        use std::os::fd::AsRawFd;
        set_cloexec(pair.0.as_raw_fd())?;
        set_cloexec(pair.1.as_raw_fd())?;
    }

    Ok(pair)
}

/// Anonymous pipe `(read, write)`, both ends close-on-exec
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::FromRawFd;

    let (r, w) = unistd::pipe2(OFlag::O_CLOEXEC)?;
    // pipe2 hands back two freshly opened descriptors that nothing else owns.
    Ok(unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) })
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    use std::os::fd::{AsRawFd, FromRawFd};

    let (r, w) = unistd::pipe()?;
    let pair = unsafe { (OwnedFd::from_raw_fd(r), OwnedFd::from_raw_fd(w)) };
    set_cloexec(pair.0.as_raw_fd())?;
    set_cloexec(pair.1.as_raw_fd())?;
    Ok(pair)
}

pub fn set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC))?;
    Ok(())
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Single `read(2)`
pub fn read_some(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    Ok(unistd::read(fd, buf)?)
}

/// Single write that never raises SIGPIPE on a socket whose peer is gone
pub fn send_some(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    let flags = MsgFlags::MSG_NOSIGNAL;
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let flags = MsgFlags::empty();

    Ok(socket::send(fd, buf, flags)?)
}

/// Bytes the kernel reports as immediately readable (FIONREAD)
pub fn bytes_pending(fd: RawFd) -> usize {
    let mut n: libc::c_int = 0;
    match unsafe { fionread(fd, &mut n) } {
        Ok(_) if n > 0 => n as usize,
        _ => 0,
    }
}

/// Zero-or-more millisecond poll of one fd for readability (or hangup)
pub fn poll_readable(fd: RawFd, timeout_ms: libc::c_int) -> bool {
    // The caller owns `fd` for the duration of the call.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let mut fds = [PollFd::new(&borrowed, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, timeout_ms) {
            Ok(n) if n > 0 => {
                return fds[0].revents().map_or(true, |r| {
                    r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR)
                });
            }
            Ok(_) => return false,
            Err(Errno::EINTR) => continue,
            Err(_) => return false,
        }
    }
}

/// Read whatever is pending on `fd` right now without blocking.
///
/// Returns the bytes and whether the peer reached end-of-stream (or errored).
pub fn drain_pending(fd: RawFd, block_size: usize) -> (Vec<u8>, bool) {
    let mut out = Vec::new();
    let mut buf = vec![0u8; block_size.max(1)];
    loop {
        match read_some(fd, &mut buf) {
            Ok(0) => return (out, true),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return (out, false),
            Err(_) => return (out, true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_bytes_pending_counts_unread_data() {
        let (a, b) = socket_pair().expect("socketpair");
        assert_eq!(bytes_pending(b.as_raw_fd()), 0);

        send_some(a.as_raw_fd(), b"hello").expect("send");
        assert_eq!(bytes_pending(b.as_raw_fd()), 5);
        assert!(poll_readable(b.as_raw_fd(), 0));
    }

    #[test]
    fn test_drain_pending_reports_eof_after_peer_close() {
        let (a, b) = socket_pair().expect("socketpair");
        set_nonblocking(b.as_raw_fd()).expect("nonblocking");

        send_some(a.as_raw_fd(), b"tail").expect("send");
        let (bytes, eof) = drain_pending(b.as_raw_fd(), 2);
        assert_eq!(bytes, b"tail");
        assert!(!eof);

        drop(a);
        let (bytes, eof) = drain_pending(b.as_raw_fd(), 2);
        assert!(bytes.is_empty());
        assert!(eof);
    }

    #[test]
    fn test_cloexec_pipe_sets_close_on_exec_on_both_ends() {
        let (r, w) = cloexec_pipe().expect("pipe");
        for fd in [r.as_raw_fd(), w.as_raw_fd()] {
            let flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD).expect("getfd"));
            assert!(flags.contains(FdFlag::FD_CLOEXEC), "fd {fd} lacks FD_CLOEXEC");
        }
    }

    #[test]
    fn test_nonblocking_read_on_empty_pipe_would_block() {
        let (r, _w) = cloexec_pipe().expect("pipe");
        set_nonblocking(r.as_raw_fd()).expect("nonblocking");

        let mut buf = [0u8; 4];
        let err = read_some(r.as_raw_fd(), &mut buf).expect_err("empty pipe");
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(!poll_readable(r.as_raw_fd(), 0));
    }

    #[test]
    fn test_send_to_closed_peer_is_an_error_not_a_signal() {
        let (a, b) = socket_pair().expect("socketpair");
        drop(b);
        assert!(send_some(a.as_raw_fd(), b"x").is_err());
    }
}
