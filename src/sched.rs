//! The per-thread scheduler: fiber bookkeeping, the ready queue, and the
//! suspend/resume primitive everything else in this crate is built on.
//!
//! Every OS thread that calls [`Scheduler::init`] (directly or, for the main
//! thread, implicitly on first use) gets its own instance, held in
//! thread-local storage. Fibers never cross scheduler instances: a
//! [`FiberId`] handed out by one thread's scheduler is meaningless on
//! another.
//!
//! The tricky part of this module is that the raw [`context::switch`] must
//! never happen while a [`std::cell::RefCell`] borrow of the [`Scheduler`]
//! itself is live: the switch suspends the *Rust call stack*, borrow guards
//! and all, for as long as the fiber stays parked, which can be arbitrarily
//! long and span many unrelated borrows of the same thread-local from other
//! fibers. Every public entry point below is careful to fetch what it needs
//! from the scheduler, drop the borrow, and only then perform the switch.

use std::cell::{Cell, RefCell, UnsafeCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::clock;
use crate::context::{self, Context};
use crate::error::{Error, Result};
use crate::poller::{self, Interest};
use crate::stack::{Stack, StackCache};
use crate::timer::TimerHeap;

/// Size of the per-fiber scratch buffer channel values are marshalled
/// through. Channel element sizes must not exceed this.
pub const VALUE_BUF_LEN: usize = 128;

/// How often (in number of scheduling decisions) the scheduler forces a
/// non-blocking poll of timers/fds even when the ready queue is non-empty,
/// so a tight ping-pong between two fibers can't starve external events.
/// Spec: any bounded interval >= 1 is behaviorally equivalent.
const EXTERNAL_POLL_INTERVAL: u64 = 103;

/// Default stack size used by [`spawn`] unless overridden by a builder.
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FiberState {
    Ready,
    Running,
    Sleeping,
    WaitingOnFd,
    ReceivingOnChan,
    SendingOnChan,
    InSelect,
    Dead,
}

/// A timer/event callback queued against the scheduler that owns it.
pub type SchedCallback = Box<dyn FnOnce(&mut Scheduler)>;

/// The fiber control block. Always accessed through an `Rc`, never moved or
/// copied; the scheduler's ready queue, the timer heap and endpoint waiter
/// queues all just hold clones of the `Rc`.
pub struct Fcb {
    context: Cell<Context>,
    stack: RefCell<Option<Stack>>,
    state: Cell<FiberState>,
    /// Result value delivered to a fiber's own `suspend()` call by whoever
    /// last called `resume()` on it (a poller event's mask, a timer firing
    /// with 0, a select branch index, ...).
    result: Cell<i64>,
    value_buf: UnsafeCell<[u8; VALUE_BUF_LEN]>,
    is_main: bool,
    alive: Cell<bool>,
    /// Wait-group this fiber is currently a member of, if any.
    wait_group: RefCell<Option<crate::waitgroup::WaitGroupHandle>>,
    /// Number of times this fiber has suspended. Read-only outside `sched`;
    /// exists purely for test instrumentation (`fiber::csw`), per spec §3/§10.4.
    csw: Cell<u64>,
}

/// A handle to a fiber, valid only on the scheduler thread that created it.
/// Cheap to clone (an `Rc` bump); compares and hashes by identity.
#[derive(Clone)]
pub struct FiberId(Rc<Fcb>);

impl PartialEq for FiberId {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for FiberId {}

impl std::hash::Hash for FiberId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl std::fmt::Debug for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FiberId({:p})", Rc::as_ptr(&self.0))
    }
}

impl FiberId {
    pub fn state(&self) -> FiberState {
        self.0.state.get()
    }

    /// Record the reason this fiber is about to suspend itself. Only
    /// meaningful between here and the matching `suspend()` call: whichever
    /// event resumes the fiber (`do_resume`) unconditionally sets the state
    /// back to `Ready`, so callers never need to restore the prior state on
    /// wake.
    pub(crate) fn set_state(&self, state: FiberState) {
        self.0.state.set(state);
    }

    pub fn is_alive(&self) -> bool {
        self.0.alive.get()
    }

    /// Number of times this fiber has suspended so far.
    pub fn csw(&self) -> u64 {
        self.0.csw.get()
    }

    /// Run `f` against this fiber's scratch value buffer.
    ///
    /// # Safety
    /// The caller must ensure no other code concurrently aliases the same
    /// buffer; since fibers run cooperatively on a single OS thread and a
    /// fiber's buffer is only ever touched while it is blocked on the
    /// channel/select operation that owns the transfer, this holds as long
    /// as callers don't stash the reference past the call.
    pub unsafe fn with_value_buf<R>(&self, f: impl FnOnce(&mut [u8; VALUE_BUF_LEN]) -> R) -> R {
        f(&mut *self.0.value_buf.get())
    }

    pub(crate) fn set_wait_group(&self, wg: Option<crate::waitgroup::WaitGroupHandle>) {
        *self.0.wait_group.borrow_mut() = wg;
    }

    pub(crate) fn wait_group(&self) -> Option<crate::waitgroup::WaitGroupHandle> {
        self.0.wait_group.borrow().clone()
    }
}

struct FiberEntryData {
    body: Box<dyn FnOnce()>,
}

pub struct Scheduler {
    current: FiberId,
    #[allow(dead_code)]
    main: FiberId,
    ready: VecDeque<FiberId>,
    stacks: StackCache,
    timers: TimerHeap<SchedCallback>,
    /// Count of spawned, non-service fibers still alive (what `gocount()`
    /// reports).
    fiber_count: usize,
    /// Count of offloaded tasks currently in flight (what `taskcount()`
    /// reports).
    offloaded: usize,
    suspend_counter: u64,
    pending_stack_release: Option<FiberId>,
    /// The main fiber parked in `waitall`, if any.
    waitall_waiter: Option<FiberId>,
    stack_size: usize,
}

thread_local! {
    static SCHED: RefCell<Scheduler> = RefCell::new(Scheduler::new_main());
}

fn with_sched<R>(f: impl FnOnce(&mut Scheduler) -> R) -> R {
    SCHED.with(|s| f(&mut s.borrow_mut()))
}

impl Scheduler {
    fn new_main() -> Self {
        let main = FiberId(Rc::new(Fcb {
            context: Cell::new(Context::invalid()),
            stack: RefCell::new(None),
            state: Cell::new(FiberState::Running),
            result: Cell::new(0),
            value_buf: UnsafeCell::new([0; VALUE_BUF_LEN]),
            is_main: true,
            alive: Cell::new(true),
            wait_group: RefCell::new(None),
            csw: Cell::new(0),
        }));
        Scheduler {
            current: main.clone(),
            main,
            ready: VecDeque::new(),
            stacks: StackCache::new(DEFAULT_STACK_SIZE),
            timers: TimerHeap::new(),
            fiber_count: 0,
            offloaded: 0,
            suspend_counter: 0,
            pending_stack_release: None,
            waitall_waiter: None,
            stack_size: DEFAULT_STACK_SIZE,
        }
    }

    pub fn set_stack_size(&mut self, size: usize) {
        self.stack_size = size;
        self.stacks = StackCache::new(size);
    }

    fn reclaim_pending_stack(&mut self) {
        if let Some(dead) = self.pending_stack_release.take() {
            if let Some(stack) = dead.0.stack.borrow_mut().take() {
                self.stacks.release(stack);
            }
        }
    }

    fn poll_once(&mut self, timeout_ms: Option<i64>) {
        let events = poller::wait(timeout_ms);
        for (fiber, interest) in events {
            self.do_resume(fiber, interest.bits() as i64);
        }
        let now = clock::now_ms();
        let fired = self.timers.fire(now);
        for cb in fired {
            cb(self);
        }
    }

    fn block_for_events(&mut self) {
        let now = clock::now_ms();
        let timeout = self.timers.next_timeout_ms(now);
        self.poll_once(timeout);
    }

    /// Choose the next fiber to run, blocking on timers/poller as needed.
    /// Updates `self.current` to the chosen fiber before returning it.
    fn pick_next(&mut self) -> FiberId {
        self.reclaim_pending_stack();
        self.suspend_counter = self.suspend_counter.wrapping_add(1);
        if self.suspend_counter % EXTERNAL_POLL_INTERVAL == 0 {
            self.poll_once(Some(0));
        }
        loop {
            if let Some(next) = self.ready.pop_front() {
                self.current = next.clone();
                next.0.state.set(FiberState::Running);
                return next;
            }
            self.block_for_events();
        }
    }

    /// Mark `fiber` ready with `result` and append it to the ready queue.
    /// A no-op if the fiber has already terminated.
    fn do_resume(&mut self, fiber: FiberId, result: i64) {
        if !fiber.0.alive.get() {
            return;
        }
        fiber.0.result.set(result);
        fiber.0.state.set(FiberState::Ready);
        self.ready.push_back(fiber);
    }

    fn retire_current(&mut self) {
        let me = self.current.clone();
        me.0.state.set(FiberState::Dead);
        me.0.alive.set(false);
        if !me.0.is_main {
            self.fiber_count -= 1;
        }
        if let Some(wg) = me.wait_group() {
            wg.member_terminated(&me);
        }
        self.maybe_wake_waitall();
    }

    fn maybe_wake_waitall(&mut self) {
        if self.fiber_count == 0 && self.offloaded == 0 {
            if let Some(waiter) = self.waitall_waiter.take() {
                self.do_resume(waiter, 0);
            }
        }
    }

    fn spawn_inner(&mut self, stack_size: Option<usize>, body: Box<dyn FnOnce()>, counted: bool) -> (FiberId, FiberId) {
        let stack = self
            .stacks
            .acquire_sized(stack_size.unwrap_or(self.stack_size))
            .expect("fiber stack allocation failed");
        let data = Box::new(FiberEntryData { body });
        let arg = Box::into_raw(data) as *mut u8;
        // SAFETY: `stack.top()` points to a freshly mapped, exclusively
        // owned region; `fiber_entry_trampoline` matches the `entry`
        // signature `init` expects.
        let ctx = unsafe { context::init(stack.top(), fiber_entry_trampoline, arg) };
        let fcb = Rc::new(Fcb {
            context: Cell::new(ctx),
            stack: RefCell::new(Some(stack)),
            state: Cell::new(FiberState::Ready),
            result: Cell::new(0),
            value_buf: UnsafeCell::new([0; VALUE_BUF_LEN]),
            is_main: false,
            alive: Cell::new(true),
            wait_group: RefCell::new(None),
            csw: Cell::new(0),
        });
        let child = FiberId(fcb);
        if counted {
            self.fiber_count += 1;
        }
        let parent = self.current.clone();
        self.ready.push_back(parent.clone());
        self.current = child.clone();
        child.0.state.set(FiberState::Running);
        (parent, child)
    }

    /// Like `spawn_inner`, but the caller keeps running: the new fiber is
    /// appended to the ready queue instead of being switched to immediately.
    /// Backs `fiber::defer`, a scheduling-order convenience over `spawn`.
    fn spawn_deferred_inner(&mut self, stack_size: Option<usize>, body: Box<dyn FnOnce()>) -> FiberId {
        let stack = self
            .stacks
            .acquire_sized(stack_size.unwrap_or(self.stack_size))
            .expect("fiber stack allocation failed");
        let data = Box::new(FiberEntryData { body });
        let arg = Box::into_raw(data) as *mut u8;
        // SAFETY: as in `spawn_inner`.
        let ctx = unsafe { context::init(stack.top(), fiber_entry_trampoline, arg) };
        let fcb = Rc::new(Fcb {
            context: Cell::new(ctx),
            stack: RefCell::new(Some(stack)),
            state: Cell::new(FiberState::Ready),
            result: Cell::new(0),
            value_buf: UnsafeCell::new([0; VALUE_BUF_LEN]),
            is_main: false,
            alive: Cell::new(true),
            wait_group: RefCell::new(None),
            csw: Cell::new(0),
        });
        let child = FiberId(fcb);
        self.fiber_count += 1;
        self.ready.push_back(child.clone());
        child
    }

    pub fn gocount(&self) -> usize {
        self.fiber_count
    }

    pub fn taskcount(&self) -> usize {
        self.offloaded
    }

    pub(crate) fn inc_offloaded(&mut self) {
        self.offloaded += 1;
    }

    pub(crate) fn dec_offloaded(&mut self) {
        self.offloaded -= 1;
        self.maybe_wake_waitall();
    }

    pub(crate) fn arm_timer(&mut self, deadline_ms: i64, cb: SchedCallback) -> Result<crate::timer::TimerId> {
        self.timers.insert(deadline_ms, cb)
    }

    pub(crate) fn cancel_timer(&mut self, id: crate::timer::TimerId) {
        self.timers.cancel(id);
    }
}

extern "C" fn fiber_entry_trampoline(arg: *mut u8) -> ! {
    // SAFETY: `arg` was produced by `Box::into_raw` in `spawn_inner` and is
    // passed through exactly once, by `context::init`'s contract.
    let data = unsafe { Box::from_raw(arg as *mut FiberEntryData) };
    (data.body)();
    let next = with_sched(|s| {
        s.retire_current();
        let me = s.current.clone();
        let next = s.pick_next();
        s.pending_stack_release = Some(me);
        next
    });
    let restore_from = next.0.context.get();
    let mut discard = Context::invalid();
    // SAFETY: `next` is a live fiber (either previously suspended or freshly
    // spawned); we never return here since this stack is retired.
    unsafe { context::switch(&mut discard, restore_from) };
    unreachable!("a terminated fiber's stack was resumed");
}

/// The currently-running fiber on this scheduler thread.
pub fn current() -> FiberId {
    with_sched(|s| s.current.clone())
}

/// Whether `current()` is the scheduler thread's original (main) fiber.
pub fn is_main() -> bool {
    with_sched(|s| s.current.0.is_main)
}

/// Configure the stack size used for subsequent [`spawn`] calls on this
/// thread. Mirrors the runtime's `init(stack_size, ...)` lifecycle call.
pub fn set_stack_size(size: usize) {
    with_sched(|s| s.set_stack_size(size));
}

/// Create a fiber running `body` and switch to it immediately; the caller
/// becomes Ready and is appended to the ready queue, per spec semantics.
/// Stack allocation failure is fatal, per spec ("Fails only if stack
/// allocation fails, which is fatal").
pub fn spawn<F: FnOnce() + 'static>(body: F) -> FiberId {
    spawn_with_stack(None, body)
}

pub fn spawn_with_stack<F: FnOnce() + 'static>(stack_size: Option<usize>, body: F) -> FiberId {
    let (parent, child) = with_sched(|s| s.spawn_inner(stack_size, Box::new(body), true));
    switch_fibers(&parent, &child);
    child
}

/// Like [`spawn`] but excluded from `gocount()`/`waitall` bookkeeping; used
/// for the per-scheduler "task-wait" service fiber (see `worker.rs`) so it
/// never blocks `waitall` from completing.
pub fn spawn_service<F: FnOnce() + 'static>(body: F) -> FiberId {
    let (parent, child) = with_sched(|s| s.spawn_inner(None, Box::new(body), false));
    switch_fibers(&parent, &child);
    child
}

/// Create a fiber running `body` without switching to it: the caller keeps
/// running and the new fiber is appended to the ready queue, to run the next
/// time the scheduler looks for work. Backs `fiber::defer`.
pub fn spawn_deferred<F: FnOnce() + 'static>(body: F) -> FiberId {
    spawn_deferred_with_stack(None, body)
}

pub fn spawn_deferred_with_stack<F: FnOnce() + 'static>(stack_size: Option<usize>, body: F) -> FiberId {
    with_sched(|s| s.spawn_deferred_inner(stack_size, Box::new(body)))
}

fn switch_fibers(from: &FiberId, to: &FiberId) {
    let mut save_to = from.0.context.get();
    let restore_from = to.0.context.get();
    // SAFETY: `from` is the fiber performing the switch (its context is
    // about to be captured), `to` was either produced by `context::init` or
    // previously saved by an earlier `switch_fibers`/`suspend` call.
    unsafe { context::switch(&mut save_to, restore_from) };
    from.0.context.set(save_to);
}

/// Suspend the calling fiber until it is resumed by [`resume`], a timer, or
/// a readiness event, returning whatever result value the resumer supplied.
pub fn suspend() -> i64 {
    let prev = with_sched(|s| s.current.clone());
    prev.0.csw.set(prev.0.csw.get().wrapping_add(1));
    let next = with_sched(|s| s.pick_next());
    if prev != next {
        switch_fibers(&prev, &next);
    }
    prev.0.result.get()
}

/// Mark `fiber` ready with `result` and enqueue it at the tail of the ready
/// queue. Does not itself yield; the resumer keeps running until it next
/// suspends.
pub fn resume(fiber: FiberId, result: i64) {
    with_sched(|s| s.do_resume(fiber, result));
}

/// Append the current fiber to the ready queue and suspend; returns once
/// rescheduled.
pub fn yield_now() {
    let me = with_sched(|s| {
        let me = s.current.clone();
        s.ready.push_back(me.clone());
        me
    });
    let _ = me;
    suspend();
}

/// Suspend until monotonic time >= `deadline_ms`. A negative deadline means
/// "forever" (only some other event, e.g. a wait-group cancel, can wake it).
pub fn sleep(deadline_ms: i64) {
    let me = current();
    me.0.state.set(FiberState::Sleeping);
    if deadline_ms >= 0 {
        let target = me.clone();
        let _ = with_sched(|s| {
            s.arm_timer(
                deadline_ms,
                Box::new(move |s: &mut Scheduler| s.do_resume(target.clone(), 0)),
            )
        });
    }
    suspend();
}

/// Arm a one-shot timer that resumes `fiber` with `result` at `deadline_ms`.
/// Returns the timer id so the caller can cancel it if the fiber is woken by
/// something else first. `deadline_ms` must be >= 0.
pub fn arm_timer(fiber: FiberId, deadline_ms: i64, result: i64) -> Result<crate::timer::TimerId> {
    with_sched(|s| s.arm_timer(deadline_ms, Box::new(move |s: &mut Scheduler| s.do_resume(fiber, result))))
}

/// Arm a one-shot timer that invokes an arbitrary callback instead of a
/// plain resume; used by select's deadline branch and the worker pool's
/// cancellation protocol.
pub fn arm_timer_with(deadline_ms: i64, cb: SchedCallback) -> Result<crate::timer::TimerId> {
    with_sched(|s| s.arm_timer(deadline_ms, cb))
}

pub fn cancel_timer(id: crate::timer::TimerId) {
    with_sched(|s| s.cancel_timer(id));
}

/// fdwait(fd, events, deadline): suspend until `fd` becomes ready for one of
/// `events`, or `deadline_ms` elapses (<0 = never). Returns the event mask
/// that fired, or an empty mask on timeout.
pub fn fdwait(fd: std::os::unix::io::RawFd, events: Interest, deadline_ms: i64) -> Result<Interest> {
    let me = current();
    let timer = if deadline_ms >= 0 {
        let target = me.clone();
        Some(with_sched(|s| {
            s.arm_timer(
                deadline_ms,
                Box::new(move |s: &mut Scheduler| {
                    poller::remove(fd, target.clone());
                    s.do_resume(target.clone(), 0);
                }),
            )
        })?)
    } else {
        None
    };
    poller::add(fd, events, me.clone())?;
    me.0.state.set(FiberState::WaitingOnFd);
    let result = suspend();
    if let Some(t) = timer {
        cancel_timer(t);
    }
    poller::remove(fd, me);
    Ok(Interest::from_bits_truncate(result as u32))
}

pub fn gocount() -> usize {
    with_sched(|s| s.gocount())
}

pub fn taskcount() -> usize {
    with_sched(|s| s.taskcount())
}

pub(crate) fn inc_offloaded() {
    with_sched(|s| s.inc_offloaded());
}

pub(crate) fn dec_offloaded() {
    with_sched(|s| s.dec_offloaded());
}

/// Resume `fiber` from inside a callback that already holds `&mut
/// Scheduler` (e.g. a timer callback invoked from [`Scheduler::poll_once`]),
/// where calling back into [`with_sched`] would double-borrow the
/// thread-local. Equivalent to [`resume`] otherwise.
pub(crate) fn resume_in(s: &mut Scheduler, fiber: FiberId, result: i64) {
    s.do_resume(fiber, result);
}

/// Block the calling (main) fiber until all other fibers on this scheduler
/// and all in-flight offloaded tasks have finished, or `deadline_ms` elapses.
pub fn waitall(deadline_ms: i64) -> Result<()> {
    if !is_main() {
        return Err(Error::Deadlock("waitall called from a non-main fiber".into()));
    }
    loop {
        let done = with_sched(|s| s.fiber_count == 0 && s.offloaded == 0);
        if done {
            return Ok(());
        }
        let me = current();
        let timer = if deadline_ms >= 0 {
            Some(arm_timer(me.clone(), deadline_ms, -1)?)
        } else {
            None
        };
        with_sched(|s| s.waitall_waiter = Some(me.clone()));
        let result = suspend();
        with_sched(|s| {
            if s.waitall_waiter.as_ref() == Some(&me) {
                s.waitall_waiter = None;
            }
        });
        if let Some(t) = timer {
            cancel_timer(t);
        }
        if result < 0 {
            return Err(Error::Timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    #[test]
    fn spawn_runs_child_before_parent_continues() {
        let log = StdRc::new(StdRefCell::new(Vec::new()));
        let l = log.clone();
        spawn(move || {
            l.borrow_mut().push("child");
        });
        log.borrow_mut().push("parent-after-spawn");
        waitall(-1).unwrap();
        assert_eq!(*log.borrow(), vec!["child", "parent-after-spawn"]);
    }

    #[test]
    fn yield_is_fifo_among_ready_fibers() {
        let log = StdRc::new(StdRefCell::new(Vec::new()));
        let l1 = log.clone();
        spawn(move || {
            l1.borrow_mut().push(1);
            yield_now();
            l1.borrow_mut().push(3);
        });
        let l2 = log.clone();
        spawn(move || {
            l2.borrow_mut().push(2);
            yield_now();
            l2.borrow_mut().push(4);
        });
        waitall(-1).unwrap();
        assert_eq!(*log.borrow(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn gocount_returns_to_zero_after_waitall() {
        for _ in 0..5 {
            spawn(|| yield_now());
        }
        assert_eq!(gocount(), 5);
        waitall(-1).unwrap();
        assert_eq!(gocount(), 0);
    }

    #[test]
    fn sleep_wakes_up_after_deadline() {
        let start = clock::now_ms();
        spawn(move || {
            sleep(clock::now_ms() + 20);
            let elapsed = clock::now_ms() - start;
            assert!(elapsed >= 20, "slept only {elapsed}ms");
        });
        waitall(-1).unwrap();
    }
}
