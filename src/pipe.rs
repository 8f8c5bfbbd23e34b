//! Inter-thread, record-framed byte-stream pipe (spec §3/§6 "Pipe").
//!
//! A thin wrapper over a non-blocking OS pipe pair that always transfers
//! exactly `record_size` bytes per [`Pipe::send`]/[`Pipe::recv`] call,
//! retrying across short reads/writes and parking the calling fiber on
//! readiness (via [`sched::fdwait`]) rather than blocking the OS thread.
//! This is the substrate the worker pool uses to deliver task completions
//! back to the scheduler thread that submitted them (see `worker.rs`), and
//! is itself exposed as a primitive (spec §6 "Pipes").
//!
//! Unlike channels, a `Pipe` is designed to be shared across OS threads: its
//! refcount is atomic and a spinlock guards each record transfer so that
//! multiple threads calling `send`/`recv` concurrently on the same `Pipe`
//! can't interleave their partial reads/writes into a garbled record.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{ClosedKind, Error, Result};
use crate::poller::Interest;
use crate::sched;

struct Inner {
    read_fd: RawFd,
    write_fd: RawFd,
    record_size: usize,
    read_lock: AtomicBool,
    write_lock: AtomicBool,
    write_closed: AtomicBool,
    refs: AtomicUsize,
}

struct SpinGuard<'a>(&'a AtomicBool);

impl<'a> SpinGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Self {
        while flag
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        SpinGuard(flag)
    }
}

impl<'a> Drop for SpinGuard<'a> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: `fd` is a descriptor we just created.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    // SAFETY: as above.
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// A reference-counted, cross-thread, record-framed pipe.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<Inner>,
}

/// Outcome of a [`Pipe::recv`] call.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// A full record was read into the caller's buffer.
    Record,
    /// The write end is closed and no more records remain.
    Done,
}

impl Pipe {
    /// Create a pipe carrying fixed-size records of `record_size` bytes
    /// (must not exceed the per-fiber value buffer size, [`crate::sched::VALUE_BUF_LEN`]).
    pub fn make(record_size: usize) -> Result<Self> {
        if record_size == 0 || record_size > crate::sched::VALUE_BUF_LEN {
            return Err(Error::invalid_argument(format!(
                "pipe record size {record_size} must be in 1..={}",
                crate::sched::VALUE_BUF_LEN
            )));
        }
        let mut fds = [0 as RawFd; 2];
        // SAFETY: standard pipe(2) with a valid 2-element out-array.
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        set_nonblocking(fds[0])?;
        set_nonblocking(fds[1])?;
        Ok(Pipe {
            inner: Arc::new(Inner {
                read_fd: fds[0],
                write_fd: fds[1],
                record_size,
                read_lock: AtomicBool::new(false),
                write_lock: AtomicBool::new(false),
                write_closed: AtomicBool::new(false),
                refs: AtomicUsize::new(1),
            }),
        })
    }

    pub fn record_size(&self) -> usize {
        self.inner.record_size
    }

    pub fn read_fd(&self) -> RawFd {
        self.inner.read_fd
    }

    pub fn write_fd(&self) -> RawFd {
        self.inner.write_fd
    }

    /// Increment the reference count; `dup` in spec terms.
    pub fn dup(&self) -> Self {
        self.inner.refs.fetch_add(1, Ordering::Relaxed);
        self.clone()
    }

    /// Close this pipe's write end: future [`Self::send`] calls fail with
    /// [`Error::Closed`], and once the reader has drained what's buffered,
    /// [`Self::recv`] reports [`RecvOutcome::Done`].
    pub fn close(&self) {
        if !self.inner.write_closed.swap(true, Ordering::SeqCst) {
            // SAFETY: `write_fd` is owned by this pipe; closing it is what
            // makes the reader observe EOF once buffered bytes are drained.
            unsafe {
                libc::close(self.inner.write_fd);
            }
        }
    }

    /// Send exactly one record of `self.record_size()` bytes, fiber-blocking
    /// (not thread-blocking) while the pipe is full.
    pub fn send(&self, record: &[u8]) -> Result<()> {
        if record.len() != self.inner.record_size {
            return Err(Error::invalid_argument("record length does not match pipe record size"));
        }
        if self.inner.write_closed.load(Ordering::SeqCst) {
            return Err(Error::Closed(ClosedKind::PipeClosed));
        }
        let _guard = SpinGuard::acquire(&self.inner.write_lock);
        let mut sent = 0usize;
        while sent < record.len() {
            // SAFETY: writing into the part of `record` not yet sent, to our
            // own write-end descriptor.
            let rc = unsafe {
                libc::write(
                    self.inner.write_fd,
                    record[sent..].as_ptr() as *const _,
                    record.len() - sent,
                )
            };
            if rc > 0 {
                sent += rc as usize;
                continue;
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock => {
                    sched::fdwait(self.inner.write_fd, Interest::WRITABLE, -1)?;
                }
                std::io::ErrorKind::Interrupted => continue,
                _ => return Err(Error::Io(err)),
            }
        }
        Ok(())
    }

    /// Receive exactly one record into `buf` (which must be
    /// `self.record_size()` bytes), fiber-blocking while the pipe is empty.
    /// Returns [`RecvOutcome::Done`] once the write end is closed and
    /// nothing remains buffered.
    pub fn recv(&self, buf: &mut [u8]) -> Result<RecvOutcome> {
        if buf.len() != self.inner.record_size {
            return Err(Error::invalid_argument("buffer length does not match pipe record size"));
        }
        let _guard = SpinGuard::acquire(&self.inner.read_lock);
        let mut got = 0usize;
        loop {
            // SAFETY: reading into the unread tail of `buf`, from our own
            // read-end descriptor.
            let rc = unsafe {
                libc::read(
                    self.inner.read_fd,
                    buf[got..].as_mut_ptr() as *mut _,
                    buf.len() - got,
                )
            };
            if rc > 0 {
                got += rc as usize;
                if got == buf.len() {
                    return Ok(RecvOutcome::Record);
                }
                continue;
            }
            if rc == 0 {
                // EOF: writer closed, nothing buffered.
                return Ok(RecvOutcome::Done);
            }
            let err = std::io::Error::last_os_error();
            match err.kind() {
                std::io::ErrorKind::WouldBlock => {
                    sched::fdwait(self.inner.read_fd, Interest::READABLE, -1)?;
                }
                std::io::ErrorKind::Interrupted => continue,
                _ => return Err(Error::Io(err)),
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // SAFETY: both descriptors are owned exclusively by this pipe; the
        // write end may already be closed by `Pipe::close`, in which case
        // `close(2)` on an already-closed fd is avoided by the flag check.
        unsafe {
            if !self.write_closed.load(Ordering::SeqCst) {
                libc::close(self.write_fd);
            }
            libc::close(self.read_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;

    #[test]
    fn send_then_recv_round_trips_a_record() {
        let pipe = Pipe::make(8).unwrap();
        let p2 = pipe.clone();
        sched::spawn(move || {
            p2.send(&42u64.to_ne_bytes()).unwrap();
        });
        let mut buf = [0u8; 8];
        assert_eq!(pipe.recv(&mut buf).unwrap(), RecvOutcome::Record);
        assert_eq!(u64::from_ne_bytes(buf), 42);
        sched::waitall(-1).unwrap();
    }

    #[test]
    fn recv_reports_done_once_closed_and_drained() {
        let pipe = Pipe::make(4).unwrap();
        pipe.close();
        let mut buf = [0u8; 4];
        assert_eq!(pipe.recv(&mut buf).unwrap(), RecvOutcome::Done);
    }

    #[test]
    fn send_after_close_fails_closed() {
        let pipe = Pipe::make(4).unwrap();
        pipe.close();
        let err = pipe.send(&[1, 2, 3, 4]).unwrap_err();
        assert!(matches!(err, Error::Closed(ClosedKind::PipeClosed)));
    }
}
