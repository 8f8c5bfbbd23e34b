//! A fiber-friendly binary semaphore backing [`crate::fiber::mutex::Mutex`]
//! (spec §3/§4.6 "Mutex").
//!
//! Implemented as a Linux `eventfd` preloaded with the value `1`: locking is
//! a non-blocking `read` that consumes the counter (falling back to
//! `fdwait`-ing on readability when it's momentarily `0`), unlocking is a
//! `write` of `1` back. The kernel serialises concurrent reads/writes on the
//! same eventfd, so this is safe to share across OS threads without any
//! additional locking on our side — exactly the property the spec calls out
//! ("Multi-threaded contention is safe because the kernel serialises
//! read/write on eventfd/pipe").
//!
//! Non-Linux targets fall back to a single-byte, non-blocking pipe with the
//! same semantics (a spin-locked flag would only be needed to preserve
//! record boundaries for a multi-byte protocol, which a 1-byte payload never
//! has, so it's omitted here).

use std::os::unix::io::RawFd;

use crate::error::Result;
use crate::poller::Interest;
use crate::sched;

pub struct Semaphore {
    fd: RawFd,
    /// Only set on the non-Linux pipe fallback, where reading and writing
    /// happen on different ends of the pipe; the eventfd path writes back to
    /// the same `fd` it reads from.
    write_fd: Option<RawFd>,
}

impl Semaphore {
    /// A semaphore preloaded with `initial` (0 or 1) units.
    pub fn new(initial: u64) -> Result<Self> {
        make_fd(initial)
    }

    /// Consume one unit, fiber-blocking (not thread-blocking) until one is
    /// available.
    pub fn acquire(&self) -> Result<()> {
        loop {
            match try_read(self.fd) {
                Some(()) => return Ok(()),
                None => {
                    sched::fdwait(self.fd, Interest::READABLE, -1)?;
                }
            }
        }
    }

    /// Consume one unit without blocking; `true` if one was available.
    pub fn try_acquire(&self) -> bool {
        try_read(self.fd).is_some()
    }

    /// Return one unit.
    pub fn release(&self) -> Result<()> {
        write_one(self.write_fd.unwrap_or(self.fd))
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        // SAFETY: `self.fd`/`self.write_fd` are owned exclusively by this
        // semaphore.
        unsafe {
            libc::close(self.fd);
            if let Some(wfd) = self.write_fd {
                libc::close(wfd);
            }
        }
    }
}

#[cfg(target_os = "linux")]
fn make_fd(initial: u64) -> Result<Semaphore> {
    // SAFETY: plain eventfd2 syscall, checked below.
    let fd = unsafe { libc::eventfd(initial as u32, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(Semaphore { fd, write_fd: None })
}

#[cfg(target_os = "linux")]
fn try_read(fd: RawFd) -> Option<()> {
    let mut buf = [0u8; 8];
    // SAFETY: `buf` is 8 bytes, the exact eventfd counter width.
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, 8) };
    if rc == 8 {
        Some(())
    } else {
        None
    }
}

#[cfg(target_os = "linux")]
fn write_one(fd: RawFd) -> Result<()> {
    let buf = 1u64.to_ne_bytes();
    // SAFETY: writing the 8-byte counter increment eventfd expects.
    let rc = unsafe { libc::write(fd, buf.as_ptr() as *const _, 8) };
    if rc != 8 {
        return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn make_fd(initial: u64) -> Result<Semaphore> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: standard pipe(2) call with a valid 2-element out-array.
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    if rc != 0 {
        return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
    }
    for &fd in &fds {
        // SAFETY: `fd` was just created by `pipe` above.
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }
    if initial > 0 {
        // SAFETY: preload the single token byte the mutex starts unlocked with.
        unsafe { libc::write(fds[1], [0u8; 1].as_ptr() as *const _, 1) };
    }
    Ok(Semaphore { fd: fds[0], write_fd: Some(fds[1]) })
}

#[cfg(not(target_os = "linux"))]
fn try_read(fd: RawFd) -> Option<()> {
    let mut buf = [0u8; 1];
    // SAFETY: `buf` is 1 byte, matching the pipe's single-token protocol.
    let rc = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut _, 1) };
    if rc == 1 {
        Some(())
    } else {
        None
    }
}

#[cfg(not(target_os = "linux"))]
fn write_one(fd: RawFd) -> Result<()> {
    // SAFETY: writing the single token byte back to the pipe's write end.
    let rc = unsafe { libc::write(fd, [0u8; 1].as_ptr() as *const _, 1) };
    if rc != 1 {
        return Err(crate::error::Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::sched;

    #[test]
    fn acquire_blocks_until_release() {
        let sem = std::rc::Rc::new(Semaphore::new(0).unwrap());
        let order = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let sem1 = sem.clone();
        let order1 = order.clone();
        sched::spawn(move || {
            sem1.acquire().unwrap();
            order1.borrow_mut().push("locked");
        });
        order.borrow_mut().push("before-release");
        sem.release().unwrap();
        sched::waitall(-1).unwrap();
        assert_eq!(*order.borrow(), vec!["before-release", "locked"]);
    }
}
