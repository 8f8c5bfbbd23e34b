//! Cooperative multitasking module.
//!
//! With the fiber module, you can:
//! - spawn and join fibers ([`spawn`], [`defer`], [`Builder`], [`JoinHandle`]),
//! - talk between them over typed [channels](Channel) and a multi-way
//!   [select](Select),
//! - sleep, yield and read the clock ([`sleep`], [`yield_now`], [`time`],
//!   [`clock`]),
//! - guard shared state with a fiber-aware [`Mutex`],
//! - and join a set of fibers together with a [`WaitGroup`].

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::error::Result;
use crate::sched;

pub mod channel;
pub use channel::{channel, Receiver, RecvToken, Select, SelectResult, Sender, SendToken};

pub mod mutex;
pub use mutex::{Mutex, MutexGuard};

mod csw;
pub use csw::check_yield;
pub use csw::csw;
pub use csw::YieldResult;

pub use crate::waitgroup::WaitGroup;

macro_rules! impl_debug_stub {
    ($t:ident $($p:tt)*) => {
        impl $($p)* ::std::fmt::Debug for $t $($p)* {
            fn fmt(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
                f.debug_struct(::std::stringify!($t))
                    .finish_non_exhaustive()
            }
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Configures and spawns a new fiber.
///
/// The [`spawn`] and [`defer`] free functions use a `Builder` with default
/// configuration.
pub struct Builder {
    #[allow(dead_code)] // kept for parity with the runtime's named-fiber API; not yet surfaced anywhere
    name: Option<String>,
    stack_size: Option<usize>,
}

impl_debug_stub! {Builder}

impl Builder {
    /// Generates the base configuration for spawning a fiber, from which
    /// configuration methods can be chained.
    pub fn new() -> Self {
        Builder { name: None, stack_size: None }
    }

    /// Names the fiber-to-be. Currently metadata only.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size == 0 {
            return Err(crate::error::Error::invalid_argument("stack size must be nonzero"));
        }
        self.stack_size = Some(stack_size);
        Ok(self)
    }

    /// Spawns a new fiber by taking ownership of the `Builder`, and returns
    /// a [`JoinHandle`] to it.
    ///
    /// The current fiber performs a **yield** and execution is transferred
    /// to the new fiber immediately.
    pub fn spawn<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let (wg, result) = start_join_bookkeeping();
        let wg_body = wg.clone();
        let result_body = result.clone();
        sched::spawn_with_stack(self.stack_size, move || {
            run_joined_body(wg_body, result_body, f);
        });
        JoinHandle { wg, result, joined: Cell::new(false) }
    }

    /// Spawns a new deferred fiber: the new fiber is appended to the ready
    /// queue and runs the next time the scheduler looks for work, rather
    /// than being switched to immediately. This is a scheduling-order
    /// convenience over [`Builder::spawn`], not a new primitive.
    pub fn defer<F, T>(self, f: F) -> JoinHandle<T>
    where
        F: FnOnce() -> T + 'static,
        T: 'static,
    {
        let (wg, result) = start_join_bookkeeping();
        let wg_body = wg.clone();
        let result_body = result.clone();
        sched::spawn_deferred_with_stack(self.stack_size, move || {
            run_joined_body(wg_body, result_body, f);
        });
        JoinHandle { wg, result, joined: Cell::new(false) }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

fn start_join_bookkeeping<T>() -> (WaitGroup, Rc<RefCell<Option<T>>>) {
    (WaitGroup::new(), Rc::new(RefCell::new(None)))
}

fn run_joined_body<F, T>(wg: WaitGroup, result: Rc<RefCell<Option<T>>>, f: F)
where
    F: FnOnce() -> T,
{
    wg.add().expect("a freshly spawned fiber cannot already belong to a wait-group");
    *result.borrow_mut() = Some(f());
}

////////////////////////////////////////////////////////////////////////////////
// JoinHandle
////////////////////////////////////////////////////////////////////////////////

/// An owned handle to a spawned fiber, allowing the caller to wait for it
/// to finish and collect its return value.
///
/// Dropping a `JoinHandle` without joining it is a bug: it is reported via a
/// panic, matching the runtime's `JoinHandle`/`UnitJoinHandle` contract.
pub struct JoinHandle<T> {
    wg: WaitGroup,
    result: Rc<RefCell<Option<T>>>,
    joined: Cell<bool>,
}

impl_debug_stub! {JoinHandle<T>}

impl<T> JoinHandle<T> {
    /// Blocks the calling fiber until the spawned fiber terminates, then
    /// returns its result.
    pub fn join(self) -> T {
        self.wg.wait(-1).expect("wait on a single-member wait-group cannot fail except via cancel");
        self.joined.set(true);
        self.result.borrow_mut().take().expect("fiber terminated without producing a result")
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if !self.joined.get() && !std::thread::panicking() {
            panic!("JoinHandle dropped before being joined");
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Free functions
////////////////////////////////////////////////////////////////////////////////

/// Creates a new fiber, transferring control to it immediately. Equivalent
/// to `Builder::new().spawn(f)`.
///
/// # Examples
/// ```no_run
/// use millrt::fiber;
///
/// let handle = fiber::spawn(|| 1 + 2);
/// assert_eq!(handle.join(), 3);
/// ```
pub fn spawn<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().spawn(f)
}

/// Creates a new fiber without transferring control to it immediately.
/// Equivalent to `Builder::new().defer(f)`.
pub fn defer<F, T>(f: F) -> JoinHandle<T>
where
    F: FnOnce() -> T + 'static,
    T: 'static,
{
    Builder::new().defer(f)
}

/// Yields control to other fibers, then blocks the calling fiber until
/// monotonic time has advanced by at least `duration`.
pub fn sleep(duration: Duration) {
    let deadline = crate::clock::deadline_from(duration);
    sched::sleep(deadline);
}

/// Appends the calling fiber to the tail of the ready queue and suspends;
/// returns once rescheduled.
pub fn yield_now() {
    sched::yield_now();
}

/// Current wall-clock time, in fractional seconds since the Unix epoch.
pub fn time() -> f64 {
    crate::clock::time()
}

/// Current monotonic time, in fractional seconds.
pub fn clock() -> f64 {
    crate::clock::monotonic()
}

/// Number of fibers spawned (via [`spawn`]/[`defer`]) and not yet
/// terminated on this scheduler thread.
pub fn gocount() -> usize {
    sched::gocount()
}

/// Number of worker-pool tasks currently offloaded from this scheduler
/// thread and not yet completed.
pub fn taskcount() -> usize {
    sched::taskcount()
}

/// Blocks the main fiber until every other fiber on this scheduler thread
/// and every in-flight offloaded task has finished, or `deadline_ms`
/// elapses (<0 = forever). Fails with [`crate::error::Error::Deadlock`] if
/// called from a fiber other than the scheduler's main fiber.
pub fn wait_all(deadline_ms: i64) -> Result<()> {
    sched::waitall(deadline_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_runs_and_joins_with_result() {
        let handle = spawn(|| 1 + 2);
        assert_eq!(handle.join(), 3);
    }

    #[test]
    fn defer_runs_after_caller_yields() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let l = log.clone();
        let handle = defer(move || {
            l.borrow_mut().push("deferred");
        });
        log.borrow_mut().push("caller");
        handle.join();
        assert_eq!(*log.borrow(), vec!["caller", "deferred"]);
    }

    #[test]
    fn gocount_tracks_live_fibers() {
        let before = gocount();
        let handle = spawn(|| yield_now());
        assert_eq!(gocount(), before + 1);
        handle.join();
        wait_all(-1).unwrap();
        assert_eq!(gocount(), before);
    }
}
