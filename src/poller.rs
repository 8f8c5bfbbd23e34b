//! Readiness polling: which fiber (if any) is parked waiting for a
//! descriptor to become readable/writable, and the OS-specific mechanism
//! that finds out when it has.
//!
//! Exactly one fiber may wait for a given direction (`IN` or `OUT`) of a
//! given descriptor at a time; a second registration is a misuse of the API
//! severe enough that the scheduler can't safely proceed (the original
//! runtime this crate reimplements panics here too, with the same
//! rationale: silently letting it through means event delivery
//! mis-targets a fiber that never asked for it).
//!
//! The backend is chosen at compile time via `cfg(target_os = ...)`, the
//! same way the original dispatches to `epoll.inc`/`poll.inc`/`kqueue.inc`:
//! `epoll` on Linux, a `poll(2)`-based fallback everywhere else.

use std::os::unix::io::RawFd;

use crate::error::{Error, Result};
use crate::sched::FiberId;

bitflags::bitflags! {
    /// Readiness directions a fiber can wait for on a descriptor.
    pub struct Interest: u32 {
        const READABLE = 0b001;
        const WRITABLE = 0b010;
    }
}

struct FdState {
    reader: Option<FiberId>,
    writer: Option<FiberId>,
}

impl FdState {
    fn empty() -> Self {
        FdState { reader: None, writer: None }
    }

    fn is_empty(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    fn registered(&self) -> Interest {
        let mut i = Interest::empty();
        if self.reader.is_some() {
            i |= Interest::READABLE;
        }
        if self.writer.is_some() {
            i |= Interest::WRITABLE;
        }
        i
    }
}

/// Register `fiber` to be woken when `fd` becomes ready for any direction in
/// `interest`.
///
/// # Panics
/// Panics (via [`Error::program_bug`]) if another fiber is already
/// registered for one of the requested directions on this `fd`.
pub fn add(fd: RawFd, interest: Interest, fiber: FiberId) -> Result<()> {
    backend::with(|b| b.add(fd, interest, fiber))
}

/// Drop `fiber`'s registration on `fd`, if any. Called once the fiber has
/// been resumed, regardless of whether it was resumed by this event or by
/// its deadline.
pub fn remove(fd: RawFd, fiber: FiberId) {
    backend::with(|b| b.remove(fd, fiber))
}

/// Forget everything about `fd` (both directions, whoever is registered).
/// Called when a descriptor wrapper is dropped.
pub fn clean(fd: RawFd) {
    backend::with(|b| b.clean(fd))
}

/// Block for at most `timeout_ms` (`None` = forever, `Some(0)` = return
/// immediately) and return the `(fiber, ready directions)` pairs that became
/// ready. Registrations for the returned pairs are cleared as part of this
/// call.
pub fn wait(timeout_ms: Option<i64>) -> Vec<(FiberId, Interest)> {
    backend::with(|b| b.wait(timeout_ms))
}

#[cfg(target_os = "linux")]
mod backend {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    pub struct Backend {
        epfd: RawFd,
        fds: HashMap<RawFd, FdState>,
        events: Vec<libc::epoll_event>,
    }

    thread_local! {
        static BACKEND: RefCell<Backend> = RefCell::new(Backend::new());
    }

    pub fn with<R>(f: impl FnOnce(&mut Backend) -> R) -> R {
        BACKEND.with(|b| f(&mut b.borrow_mut()))
    }

    fn to_epoll_bits(i: Interest) -> u32 {
        let mut bits = 0u32;
        if i.contains(Interest::READABLE) {
            bits |= libc::EPOLLIN as u32;
        }
        if i.contains(Interest::WRITABLE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    impl Backend {
        fn new() -> Self {
            // SAFETY: a plain epoll_create1(0) call; failure here means the
            // process is out of descriptors, which is unrecoverable for a
            // runtime whose entire I/O story depends on it.
            let epfd = unsafe { libc::epoll_create1(0) };
            assert!(epfd >= 0, "epoll_create1 failed: {}", std::io::Error::last_os_error());
            Backend {
                epfd,
                fds: HashMap::new(),
                events: vec![unsafe { std::mem::zeroed() }; 256],
            }
        }

        pub fn add(&mut self, fd: RawFd, interest: Interest, fiber: FiberId) -> Result<()> {
            let state = self.fds.entry(fd).or_insert_with(FdState::empty);
            if interest.contains(Interest::READABLE) {
                if state.reader.is_some() {
                    Error::program_bug(format!("two fibers waiting to read fd {fd}"));
                }
                state.reader = Some(fiber);
            }
            if interest.contains(Interest::WRITABLE) {
                if state.writer.is_some() {
                    Error::program_bug(format!("two fibers waiting to write fd {fd}"));
                }
                state.writer = Some(fiber);
            }
            let combined = state.registered();
            let op = if combined == interest {
                libc::EPOLL_CTL_ADD
            } else {
                libc::EPOLL_CTL_MOD
            };
            let mut ev = libc::epoll_event {
                events: to_epoll_bits(combined) | libc::EPOLLONESHOT as u32,
                u64: fd as u64,
            };
            // SAFETY: `ev` lives for the duration of the call, `epfd`/`fd`
            // are valid descriptors owned by this backend/the caller.
            let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
            if rc != 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            Ok(())
        }

        pub fn remove(&mut self, fd: RawFd, fiber: FiberId) {
            let Some(state) = self.fds.get_mut(&fd) else { return };
            if state.reader == Some(fiber) {
                state.reader = None;
            }
            if state.writer == Some(fiber) {
                state.writer = None;
            }
            self.sync_registration(fd);
        }

        pub fn clean(&mut self, fd: RawFd) {
            if self.fds.remove(&fd).is_some() {
                // SAFETY: removing a registration for an fd we previously
                // added; epoll_ctl ignores a NULL event pointer for DEL.
                unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
            }
        }

        fn sync_registration(&mut self, fd: RawFd) {
            let empty = match self.fds.get(&fd) {
                Some(state) if state.is_empty() => true,
                Some(_) => false,
                None => return,
            };
            if empty {
                self.fds.remove(&fd);
                // SAFETY: as in `clean`.
                unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
                }
            } else if let Some(state) = self.fds.get(&fd) {
                let mut ev = libc::epoll_event {
                    events: to_epoll_bits(state.registered()) | libc::EPOLLONESHOT as u32,
                    u64: fd as u64,
                };
                // SAFETY: as above, `fd` is still registered.
                unsafe {
                    libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut ev);
                }
            }
        }

        pub fn wait(&mut self, timeout_ms: Option<i64>) -> Vec<(FiberId, Interest)> {
            let timeout = match timeout_ms {
                None => -1,
                Some(ms) => ms.clamp(0, i32::MAX as i64) as i32,
            };
            // SAFETY: `events` buffer and its length are consistent, `epfd`
            // is owned by this backend.
            let n = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    self.events.as_mut_ptr(),
                    self.events.len() as i32,
                    timeout,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Vec::new();
                }
                panic!("epoll_wait failed: {err}");
            }
            let mut fired = Vec::new();
            for ev in &self.events[..n as usize] {
                let fd = ev.u64 as RawFd;
                let mut ready = Interest::empty();
                if ev.events & (libc::EPOLLIN as u32 | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
                    ready |= Interest::READABLE;
                }
                if ev.events & (libc::EPOLLOUT as u32 | libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
                    ready |= Interest::WRITABLE;
                }
                let Some(state) = self.fds.get_mut(&fd) else { continue };
                if ready.contains(Interest::READABLE) {
                    if let Some(fiber) = state.reader.take() {
                        fired.push((fiber, Interest::READABLE));
                    }
                }
                if ready.contains(Interest::WRITABLE) {
                    if let Some(fiber) = state.writer.take() {
                        fired.push((fiber, Interest::WRITABLE));
                    }
                }
                self.sync_registration(fd);
            }
            fired
        }
    }

    impl Drop for Backend {
        fn drop(&mut self) {
            // SAFETY: closing a descriptor this backend owns exclusively.
            unsafe {
                libc::close(self.epfd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod backend {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    pub struct Backend {
        fds: HashMap<RawFd, FdState>,
    }

    thread_local! {
        static BACKEND: RefCell<Backend> = RefCell::new(Backend { fds: HashMap::new() });
    }

    pub fn with<R>(f: impl FnOnce(&mut Backend) -> R) -> R {
        BACKEND.with(|b| f(&mut b.borrow_mut()))
    }

    impl Backend {
        pub fn add(&mut self, fd: RawFd, interest: Interest, fiber: FiberId) -> Result<()> {
            let state = self.fds.entry(fd).or_insert_with(FdState::empty);
            if interest.contains(Interest::READABLE) {
                if state.reader.is_some() {
                    Error::program_bug(format!("two fibers waiting to read fd {fd}"));
                }
                state.reader = Some(fiber);
            }
            if interest.contains(Interest::WRITABLE) {
                if state.writer.is_some() {
                    Error::program_bug(format!("two fibers waiting to write fd {fd}"));
                }
                state.writer = Some(fiber);
            }
            Ok(())
        }

        pub fn remove(&mut self, fd: RawFd, fiber: FiberId) {
            let Some(state) = self.fds.get_mut(&fd) else { return };
            if state.reader == Some(fiber) {
                state.reader = None;
            }
            if state.writer == Some(fiber) {
                state.writer = None;
            }
            if state.is_empty() {
                self.fds.remove(&fd);
            }
        }

        pub fn clean(&mut self, fd: RawFd) {
            self.fds.remove(&fd);
        }

        pub fn wait(&mut self, timeout_ms: Option<i64>) -> Vec<(FiberId, Interest)> {
            if self.fds.is_empty() {
                if let Some(ms) = timeout_ms {
                    if ms > 0 {
                        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
                    }
                }
                return Vec::new();
            }
            let order: Vec<RawFd> = self.fds.keys().copied().collect();
            let mut pollfds: Vec<libc::pollfd> = order
                .iter()
                .map(|&fd| {
                    let state = &self.fds[&fd];
                    let mut events = 0;
                    if state.reader.is_some() {
                        events |= libc::POLLIN;
                    }
                    if state.writer.is_some() {
                        events |= libc::POLLOUT;
                    }
                    libc::pollfd { fd, events, revents: 0 }
                })
                .collect();
            let timeout = match timeout_ms {
                None => -1,
                Some(ms) => ms.clamp(0, i32::MAX as i64) as i32,
            };
            // SAFETY: `pollfds` is a valid, appropriately sized array for
            // the duration of the call.
            let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Vec::new();
                }
                panic!("poll failed: {err}");
            }
            let mut fired = Vec::new();
            for pfd in &pollfds {
                if pfd.revents == 0 {
                    continue;
                }
                let Some(state) = self.fds.get_mut(&pfd.fd) else { continue };
                if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                    if let Some(fiber) = state.reader.take() {
                        fired.push((fiber, Interest::READABLE));
                    }
                }
                if pfd.revents & (libc::POLLOUT | libc::POLLHUP | libc::POLLERR) != 0 {
                    if let Some(fiber) = state.writer.take() {
                        fired.push((fiber, Interest::WRITABLE));
                    }
                }
                if state.is_empty() {
                    self.fds.remove(&pfd.fd);
                }
            }
            fired
        }
    }
}
