//! Error type returned by fallible operations throughout this crate.
//!
//! Every recoverable failure mode described for the scheduler, channels,
//! timers, poller and worker pool maps onto one variant of [`Error`]. The one
//! exception is [`Error::ProgramBug`]: callers never receive it as a
//! `Result::Err`, it is raised directly as a panic at the point of detection
//! (see the variant's own docs), because by definition it indicates a
//! memory-safety-sensitive misuse of the API rather than a recoverable
//! condition.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error as ThisError;

/// Result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The reason a channel or pipe reported [`Error::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedKind {
    /// `done()` was already called on this channel.
    ChannelDone,
    /// The cross-thread pipe's write end was already closed.
    PipeClosed,
}

/// The unified error type for this crate.
///
/// Mirrors the error-kind table of the runtime's public contract: each
/// variant below is an abstract error kind mapped onto a single POSIX errno
/// in the original runtime this crate reimplements; here they are simply the
/// arms of one enum.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Allocation failed: a stack could not be mapped, a timer node could not
    /// be inserted into the heap, or a task record could not be allocated.
    #[error("out of memory")]
    OutOfMemory,

    /// A caller-supplied argument violates a precondition (e.g. a channel
    /// element larger than the per-fiber value buffer, or a negative
    /// duration where none is accepted).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An operation was attempted on a descriptor wrapper whose underlying
    /// fd has already been closed.
    #[error("bad descriptor: {fd}")]
    BadDescriptor {
        /// The raw descriptor the caller tried to operate on.
        fd: RawFd,
    },

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out")]
    Timeout,

    /// The channel (or pipe) this operation targets is permanently closed.
    #[error("{}", closed_message(*.0))]
    Closed(ClosedKind),

    /// The requested operation cannot proceed because the resource has
    /// active waiters (e.g. closing a channel that still has select clauses
    /// registered on it).
    #[error("resource busy")]
    Busy,

    /// A uniqueness invariant was violated: two `deadline`/`otherwise`
    /// branches in one select, or a fiber added to a wait-group it already
    /// belongs to.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// An operation would provably deadlock: the main fiber tried to join a
    /// wait-group, or `wait_all` was called from a fiber other than main.
    #[error("deadlock: {0}")]
    Deadlock(String),

    /// A wait-group or wait-all was explicitly cancelled while a fiber was
    /// parked on it.
    #[error("cancelled")]
    Cancelled,

    /// An I/O syscall failed with something other than `EAGAIN`/`EINTR`.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Detected a violation of an invariant the scheduler depends on for
    /// memory safety — most commonly, two fibers registered to wait on the
    /// same readiness event of the same descriptor. This variant exists so
    /// that `Error` composes with `std::error::Error`, but the runtime never
    /// constructs it as a `Result::Err`; see [`Error::program_bug`].
    #[error("program bug: {0}")]
    ProgramBug(String),
}

fn closed_message(kind: ClosedKind) -> &'static str {
    match kind {
        ClosedKind::ChannelDone => "channel is done",
        ClosedKind::PipeClosed => "pipe is closed",
    }
}

impl Error {
    /// Construct an [`Error::InvalidArgument`] from a formattable message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Log and panic with [`Error::ProgramBug`]. Called at the few sites
    /// where the scheduler detects a misuse that it cannot safely recover
    /// from (e.g. two fibers waiting on the same fd event).
    #[track_caller]
    pub fn program_bug(msg: impl Into<String>) -> ! {
        let msg = msg.into();
        log::error!("program bug: {msg}");
        panic!("program bug: {msg}");
    }

    /// `true` if this error is [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }
}

impl From<Duration> for Error {
    /// Convenience used by call sites that only have a `Duration` on hand
    /// when reporting that a deadline elapsed.
    fn from(_: Duration) -> Self {
        Error::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn error_is_send_sync() {
        assert_send_sync::<Error>();
    }

    #[test]
    fn closed_message_is_readable() {
        assert_eq!(
            Error::Closed(ClosedKind::ChannelDone).to_string(),
            "channel is done"
        );
    }
}
