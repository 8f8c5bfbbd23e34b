//! Non-blocking descriptor wrapper (spec §3/§4.4 "Descriptor wrapper").
//!
//! [`Fd`] puts an arbitrary file descriptor into non-blocking mode on
//! construction and gives it fiber-blocking `read`/`write` methods: the
//! underlying syscall is retried across `EAGAIN` by parking on
//! [`sched::fdwait`] rather than blocking the OS thread, and across `EINTR`
//! unconditionally. [`Pipe`] is the same wrapper specialised to a connected
//! pair, for the common case of plumbing two fibers (on possibly different
//! scheduler threads, via the raw OS pipe) together.
//!
//! See also [`crate::pipe::Pipe`], which adds record framing and an atomic
//! cross-thread refcount on top of the same non-blocking-fd-plus-`fdwait`
//! substrate; `coio::Pipe` here is the bare byte-stream version with none of
//! that bookkeeping, matching a plain `pipe(2)`.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::poller::Interest;
use crate::sched;

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is a valid, open descriptor owned by the caller.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::Io(io::Error::last_os_error()));
    }
    Ok(())
}

fn deadline_from(timeout: Option<Duration>) -> i64 {
    match timeout {
        Some(d) => crate::clock::deadline_from(d),
        None => -1,
    }
}

/// A non-blocking file descriptor wrapped for fiber-blocking I/O.
pub struct Fd {
    fd: RawFd,
}

impl Fd {
    /// Take ownership of `fd`, switching it to non-blocking mode.
    pub fn new(fd: RawFd) -> Result<Self> {
        set_nonblocking(fd)?;
        Ok(Fd { fd })
    }

    /// Wrap any type that owns a raw descriptor (a `TcpStream`, a
    /// `UnixStream`, ...), taking ownership of it.
    pub fn wrap<T: IntoRawFd>(inner: T) -> Result<Self> {
        Self::new(inner.into_raw_fd())
    }

    /// Suspend until `interest` is ready on this descriptor, or `deadline_ms`
    /// elapses (< 0 = forever). Returns the event mask that fired, empty on
    /// timeout.
    pub fn fdwait(&self, interest: Interest, deadline_ms: i64) -> Result<Interest> {
        sched::fdwait(self.fd, interest, deadline_ms)
    }

    /// Read into `buf`, fiber-blocking on `EAGAIN` until readable or
    /// `timeout` elapses. Returns `0` on timeout, matching the underlying
    /// runtime's "zero bytes means timed out" convention.
    pub fn read_with_timeout(&self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline_ms = deadline_from(timeout);
        loop {
            // SAFETY: `buf` is a valid, exclusively-borrowed slice; `self.fd`
            // is owned by this wrapper.
            let rc = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut _, buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    let fired = self
                        .fdwait(Interest::READABLE, deadline_ms)
                        .map_err(io_err)?;
                    if fired.is_empty() {
                        return Ok(0);
                    }
                }
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }

    /// Write `buf`, fiber-blocking on `EAGAIN` until writable or `timeout`
    /// elapses. Returns `0` on timeout.
    pub fn write_with_timeout(&self, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline_ms = deadline_from(timeout);
        loop {
            // SAFETY: `buf` is a valid slice; `self.fd` is owned by this
            // wrapper.
            let rc = unsafe { libc::write(self.fd, buf.as_ptr() as *const _, buf.len()) };
            if rc >= 0 {
                return Ok(rc as usize);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    let fired = self
                        .fdwait(Interest::WRITABLE, deadline_ms)
                        .map_err(io_err)?;
                    if fired.is_empty() {
                        return Ok(0);
                    }
                }
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err),
            }
        }
    }
}

fn io_err(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::Other, other.to_string()),
    }
}

impl Read for Fd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read_with_timeout(buf, None)
    }
}

impl Write for Fd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_with_timeout(buf, None)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.fd;
        std::mem::forget(self);
        fd
    }
}

impl Drop for Fd {
    fn drop(&mut self) {
        crate::poller::clean(self.fd);
        // SAFETY: `self.fd` is owned exclusively by this wrapper.
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A plain, non-blocking OS pipe wrapped for fiber-blocking byte-stream I/O.
/// Unlike [`crate::pipe::Pipe`] this carries no record framing or refcount;
/// it's the bare primitive for a single producer/single consumer hookup.
pub struct Pipe {
    read_end: Fd,
    write_end: Fd,
}

impl Pipe {
    pub fn new() -> Result<Self> {
        let mut fds = [0 as RawFd; 2];
        // SAFETY: standard pipe(2) call with a valid 2-element out-array.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(Pipe { read_end: Fd::new(fds[0])?, write_end: Fd::new(fds[1])? })
    }

    pub fn read_end(&self) -> &Fd {
        &self.read_end
    }

    pub fn write_end(&self) -> &Fd {
        &self.write_end
    }

    pub fn split(self) -> (Fd, Fd) {
        (self.read_end, self.write_end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;

    #[test]
    fn pipe_round_trips_bytes_across_fibers() {
        let pipe = Pipe::new().unwrap();
        let (read_end, write_end) = pipe.split();
        sched::spawn(move || {
            write_end.write_with_timeout(b"hello", None).unwrap();
        });
        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < buf.len() {
            got += read_end.read_with_timeout(&mut buf[got..], None).unwrap();
        }
        assert_eq!(&buf, b"hello");
        sched::waitall(-1).unwrap();
    }

    #[test]
    fn read_with_timeout_returns_zero_on_timeout() {
        let pipe = Pipe::new().unwrap();
        let mut buf = [0u8; 4];
        let n = pipe
            .read_end()
            .read_with_timeout(&mut buf, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }
}
