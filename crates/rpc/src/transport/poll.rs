//! Readiness helpers built on `poll(2)`.

use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, poll};

/// Flags that count as "something happened" on any descriptor.
const FAILURE: PollFlags = PollFlags::POLLHUP.union(PollFlags::POLLERR);

/// Converts an optional timeout into `poll(2)` milliseconds, rounding up so
/// short waits never turn into busy loops.
fn timeout_millis(timeout: Option<Duration>) -> i32 {
    timeout.map_or(-1, |t| {
        let millis = t.as_micros().div_ceil(1000);
        i32::try_from(millis).unwrap_or(i32::MAX)
    })
}

/// Non-blocking check whether `fd` is ready for `interest`.
///
/// Hang-up and error conditions also report ready, so the following read or
/// write observes them.
///
/// # Errors
///
/// Returns the `poll(2)` error, except `EINTR` which reads as "not ready".
pub fn probe<F: AsFd>(fd: &F, interest: PollFlags) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, interest)];
    match poll(&mut fds, 0) {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(fds[0]
            .revents()
            .is_some_and(|r| r.intersects(interest | FAILURE))),
        Err(errno) => Err(errno.into()),
    }
}

/// Blocks until one of `fds` is ready or `timeout` elapses.
///
/// Returns the number of ready descriptors; zero on timeout or when a signal
/// interrupted the wait.
///
/// # Errors
///
/// Returns any `poll(2)` error other than `EINTR`.
pub fn wait(fds: &mut [PollFd<'_>], timeout: Option<Duration>) -> io::Result<usize> {
    match poll(fds, timeout_millis(timeout)) {
        #[allow(clippy::cast_sign_loss)]
        Ok(n) => Ok(n as usize),
        Err(Errno::EINTR) => Ok(0),
        Err(errno) => Err(errno.into()),
    }
}

/// Whether a polled descriptor reported any of `interest`, or a failure.
#[must_use]
pub fn is_ready(fd: &PollFd<'_>, interest: PollFlags) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(interest | FAILURE))
}

/// Wakes a thread blocked in [`wait`].
///
/// A connected Unix socket pair: the blocked side polls the read end, any
/// other thread writes a byte to the write end.
#[derive(Debug)]
pub struct Waker {
    reader: UnixStream,
    writer: UnixStream,
}

impl Waker {
    /// Creates a waker.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket pair cannot be created.
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    /// Makes the read end readable. Never blocks.
    pub fn wake(&self) {
        // A full pipe already means a wakeup is pending.
        let _ = (&self.writer).write(&[1]);
    }

    /// Consumes pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        while matches!((&self.reader).read(&mut buf), Ok(n) if n > 0) {}
    }
}

impl AsFd for Waker {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}
