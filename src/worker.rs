//! Worker pool and offloaded tasks (spec §4.5 "Worker Pool and Cross-Thread
//! Completion").
//!
//! Blocking work (`read`, `write`, `fsync`, arbitrary closures, ...) is
//! handed to a pool of OS threads, each running its own [`crate::sched`]
//! instance, so that a fiber's scheduler thread never blocks on a syscall.
//! The submitting fiber suspends; completion is delivered back across
//! threads through a per-submitting-thread [`Pipe`], drained by a "task
//! wait" service fiber spawned (once, lazily) the first time that thread
//! ever offloads anything.
//!
//! Cancellation races a deadline timer against the worker actually starting
//! the task, using the CAS protocol from spec §4.5/§8: if the deadline wins,
//! the task is left for the worker to silently discard; if the worker wins,
//! the submitter keeps waiting because the task's result storage is still
//! live.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crossbeam_queue::SegQueue;
use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::pipe::{Pipe, RecvOutcome};
use crate::sched::{self, FiberId};
use crate::waitgroup::WaitGroup;

const QUEUED: u8 = 0;
const IN_PROGRESS: u8 = 1;
const TIMEDOUT: u8 = 2;

const DEFAULT_WORKERS: usize = 4;
const MAX_WORKERS: usize = 64;
const COMPLETION_RECORD_SIZE: usize = 8;

trait TaskObject: Send + Sync {
    /// Attempt `Queued -> InProgress`. `false` means the task was already
    /// cancelled (`Timedout`) and must be discarded without running.
    fn begin(&self) -> bool;
    /// Run the task body (possibly as a fiber, for `task_go`) and report
    /// completion on its origin pipe.
    fn run(self: Arc<Self>);
    fn origin_token(&self) -> u64;
}

struct Task<T> {
    state: AtomicU8,
    body: Mutex<Option<Box<dyn FnOnce() -> T + Send>>>,
    result: Arc<Mutex<Option<T>>>,
    as_fiber: bool,
    token: u64,
    pipe: Pipe,
}

impl<T: Send + 'static> TaskObject for Task<T> {
    fn begin(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, IN_PROGRESS, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn run(self: Arc<Self>) {
        let Some(body) = self.body.lock().unwrap().take() else {
            return;
        };
        if self.as_fiber {
            let wg = WaitGroup::new();
            let wg_member = wg.clone();
            let result = self.result.clone();
            sched::spawn(move || {
                wg_member.add().expect("fresh fiber can always join a fresh wait-group");
                let r = body();
                *result.lock().unwrap() = Some(r);
            });
            // The worker thread's own scheduler drives this fiber to
            // completion before moving on to the next queued task; see the
            // module doc for why this trades away intra-worker task
            // concurrency for a straightforward implementation.
            wg.wait(-1).expect("wait-group with no deadline cannot time out or be pre-cancelled");
        } else {
            let r = body();
            *self.result.lock().unwrap() = Some(r);
        }
        // Best-effort: if the submitter's thread is gone (shutdown race),
        // the pipe's read end is closed and this write fails; that's fine,
        // there's nobody left to notify.
        let _ = self.pipe.send(&self.token.to_ne_bytes());
    }

    fn origin_token(&self) -> u64 {
        self.token
    }
}

/// A queue of tasks plus the OS threads draining it, each running its own
/// fiber scheduler.
struct TaskQueue {
    tasks: SegQueue<Arc<dyn TaskObject>>,
    lock: Mutex<()>,
    not_empty: Condvar,
    in_flight: AtomicUsize,
    shutdown: std::sync::atomic::AtomicBool,
}

impl TaskQueue {
    fn new() -> Arc<Self> {
        Arc::new(TaskQueue {
            tasks: SegQueue::new(),
            lock: Mutex::new(()),
            not_empty: Condvar::new(),
            in_flight: AtomicUsize::new(0),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn push(&self, task: Arc<dyn TaskObject>) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.tasks.push(task);
        let _g = self.lock.lock().unwrap();
        self.not_empty.notify_one();
    }

    fn pop_blocking(&self) -> Option<Arc<dyn TaskObject>> {
        loop {
            if let Some(t) = self.tasks.pop() {
                return Some(t);
            }
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            let guard = self.lock.lock().unwrap();
            if !self.tasks.is_empty() || self.shutdown.load(Ordering::SeqCst) {
                continue;
            }
            let _ = self
                .not_empty
                .wait_timeout(guard, std::time::Duration::from_millis(50))
                .unwrap();
        }
    }

    fn task_finished(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            let _g = self.lock.lock().unwrap();
            self.not_empty.notify_all();
        }
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _g = self.lock.lock().unwrap();
        self.not_empty.notify_all();
    }
}

fn worker_thread_main(queue: Arc<TaskQueue>) {
    while let Some(task) = queue.pop_blocking() {
        if task.begin() {
            task.run();
        }
        // Timed-out tasks are simply dropped here: `begin()` returned
        // `false`, so `result`/`pipe` are never touched, matching spec
        // §4.5 ("the task is freed and skipped").
        queue.task_finished();
    }
}

/// An explicitly-created worker: a single dedicated OS thread with its own
/// task queue.
pub struct Worker {
    queue: Arc<TaskQueue>,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn create() -> Self {
        let queue = TaskQueue::new();
        let q = queue.clone();
        let thread = std::thread::Builder::new()
            .name("mill-worker".into())
            .spawn(move || worker_thread_main(q))
            .expect("failed to spawn worker thread");
        Worker {
            queue,
            thread: Some(thread),
        }
    }

    /// Block the calling fiber's OS thread... actually this fiber-blocks:
    /// suspend until this worker's queue and in-flight task count both
    /// reach zero, or `deadline_ms` elapses.
    pub fn await_idle(&self, deadline_ms: i64) -> Result<()> {
        let deadline = if deadline_ms < 0 {
            None
        } else {
            Some(deadline_ms)
        };
        loop {
            if self.queue.in_flight.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            if let Some(d) = deadline {
                if crate::clock::now_ms() >= d {
                    return Err(Error::Timeout);
                }
            }
            sched::sleep(crate::clock::now_ms() + 5);
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.queue.shutdown();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

struct Pool {
    queue: Arc<TaskQueue>,
    _threads: Vec<JoinHandle<()>>,
}

fn worker_count() -> usize {
    std::env::var("MILL_WORKERS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0)
        .unwrap_or(DEFAULT_WORKERS)
        .min(MAX_WORKERS)
}

static GLOBAL_POOL: OnceCell<Pool> = OnceCell::new();

fn global_pool() -> &'static Pool {
    GLOBAL_POOL.get_or_init(|| {
        let queue = TaskQueue::new();
        let n = worker_count();
        let threads = (0..n)
            .map(|i| {
                let q = queue.clone();
                std::thread::Builder::new()
                    .name(format!("mill-worker-{i}"))
                    .spawn(move || worker_thread_main(q))
                    .expect("failed to spawn shared worker thread")
            })
            .collect();
        Pool {
            queue,
            _threads: threads,
        }
    })
}

// --- per-submitting-thread completion plumbing -----------------------------

struct SubmitterState {
    pipe: Pipe,
    pending: RefCell<HashMap<u64, FiberId>>,
    next_token: Cell<u64>,
}

thread_local! {
    static SUBMITTER: RefCell<Option<SubmitterState>> = RefCell::new(None);
}

/// Lazily create this thread's completion pipe and task-wait service fiber
/// (spec: "a dedicated service fiber ... created on first offload").
fn ensure_submitter_ready() -> (Pipe, u64) {
    let needs_init = SUBMITTER.with(|s| s.borrow().is_none());
    if needs_init {
        let pipe = Pipe::make(COMPLETION_RECORD_SIZE).expect("failed to create task completion pipe");
        SUBMITTER.with(|s| {
            *s.borrow_mut() = Some(SubmitterState {
                pipe: pipe.clone(),
                pending: RefCell::new(HashMap::new()),
                next_token: Cell::new(1),
            });
        });
        let reader = pipe.clone();
        sched::spawn_service(move || task_wait_loop(reader));
    }
    SUBMITTER.with(|s| {
        let borrow = s.borrow();
        let state = borrow.as_ref().unwrap();
        let token = state.next_token.get();
        state.next_token.set(token.wrapping_add(1).max(1));
        (state.pipe.clone(), token)
    })
}

fn register_pending(token: u64, fiber: FiberId) {
    SUBMITTER.with(|s| {
        s.borrow()
            .as_ref()
            .unwrap()
            .pending
            .borrow_mut()
            .insert(token, fiber);
    });
}

fn take_pending(token: u64) -> Option<FiberId> {
    SUBMITTER.with(|s| {
        s.borrow()
            .as_ref()
            .and_then(|st| st.pending.borrow_mut().remove(&token))
    })
}

/// Body of the per-thread "task-wait" fiber: drains completion records and
/// resumes the fiber each one belongs to. Excluded from `gocount()` so it
/// never blocks `waitall`.
fn task_wait_loop(pipe: Pipe) {
    let mut buf = [0u8; COMPLETION_RECORD_SIZE];
    loop {
        match pipe.recv(&mut buf) {
            Ok(RecvOutcome::Record) => {
                let token = u64::from_ne_bytes(buf);
                if let Some(fiber) = take_pending(token) {
                    sched::resume(fiber, 1);
                }
                sched::dec_offloaded();
            }
            Ok(RecvOutcome::Done) | Err(_) => return,
        }
    }
}

fn submit<T, F>(queue: &Arc<TaskQueue>, f: F, deadline_ms: i64, as_fiber: bool) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (pipe, token) = ensure_submitter_ready();
    let result: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let task = Arc::new(Task {
        state: AtomicU8::new(QUEUED),
        body: Mutex::new(Some(Box::new(f) as Box<dyn FnOnce() -> T + Send>)),
        result: result.clone(),
        as_fiber,
        token,
        pipe,
    });

    let me = sched::current();
    register_pending(token, me.clone());
    sched::inc_offloaded();
    queue.push(task.clone());

    let timer = if deadline_ms >= 0 {
        let t = task.clone();
        let origin = me.clone();
        Some(sched::arm_timer_with(
            deadline_ms,
            Box::new(move |s| {
                if t
                    .state
                    .compare_exchange(QUEUED, TIMEDOUT, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    take_pending(t.origin_token());
                    crate::sched::resume_in(s, origin.clone(), -1);
                }
                // CAS failure means the worker already claimed the task;
                // the submitter keeps waiting for the real completion.
            }),
        )?)
    } else {
        None
    };

    let result_code = sched::suspend();
    if let Some(t) = timer {
        sched::cancel_timer(t);
    }
    if result_code < 0 {
        sched::dec_offloaded();
        return Err(Error::Timeout);
    }
    Ok(result.lock().unwrap().take().expect("completed task always stores its result"))
}

/// Offload `f` to run on `worker` (or the shared global pool if `None`),
/// suspending the calling fiber until it completes or `deadline_ms` elapses.
pub fn task_run<T, F>(worker: Option<&Worker>, f: F, deadline_ms: i64) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let queue = match worker {
        Some(w) => &w.queue,
        None => &global_pool().queue,
    };
    submit(queue, f, deadline_ms, false)
}

/// Like [`task_run`], but the worker runs `f` as a fiber on its own
/// scheduler instead of calling it inline, so `f` may itself perform further
/// cooperative fiber operations.
pub fn task_go<T, F>(worker: Option<&Worker>, f: F, deadline_ms: i64) -> Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let queue = match worker {
        Some(w) => &w.queue,
        None => &global_pool().queue,
    };
    submit(queue, f, deadline_ms, true)
}

// --- filesystem helpers (spec §6) ------------------------------------------
//
// Thin `task_run` wrappers around the blocking libc calls, so a fiber never
// stalls its scheduler thread on disk I/O.

fn errno_result(rc: libc::c_int) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::Io(std::io::Error::last_os_error()))
    }
}

pub fn open_a(path: &std::ffi::CString, flags: i32, mode: libc::mode_t, deadline_ms: i64) -> Result<RawFd> {
    let path = path.clone();
    task_run(
        None,
        move || {
            // SAFETY: `path` is a valid, NUL-terminated C string for the
            // duration of this blocking call.
            let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
            if fd < 0 {
                Err(Error::Io(std::io::Error::last_os_error()))
            } else {
                Ok(fd)
            }
        },
        deadline_ms,
    )?
}

pub fn close_a(fd: RawFd, deadline_ms: i64) -> Result<()> {
    task_run(None, move || errno_result(unsafe { libc::close(fd) }), deadline_ms)?
}

pub fn pread_a(fd: RawFd, len: usize, offset: i64, deadline_ms: i64) -> Result<Vec<u8>> {
    task_run(
        None,
        move || {
            let mut buf = vec![0u8; len];
            // SAFETY: `buf` has exactly `len` writable bytes.
            let rc = unsafe {
                libc::pread(fd, buf.as_mut_ptr() as *mut _, len, offset as libc::off_t)
            };
            if rc < 0 {
                Err(Error::Io(std::io::Error::last_os_error()))
            } else {
                buf.truncate(rc as usize);
                Ok(buf)
            }
        },
        deadline_ms,
    )?
}

pub fn pwrite_a(fd: RawFd, data: Vec<u8>, offset: i64, deadline_ms: i64) -> Result<usize> {
    task_run(
        None,
        move || {
            // SAFETY: `data` is valid for `data.len()` bytes for the call.
            let rc = unsafe {
                libc::pwrite(fd, data.as_ptr() as *const _, data.len(), offset as libc::off_t)
            };
            if rc < 0 {
                Err(Error::Io(std::io::Error::last_os_error()))
            } else {
                Ok(rc as usize)
            }
        },
        deadline_ms,
    )?
}

pub fn readv_a(fd: RawFd, lens: Vec<usize>, offset: i64, deadline_ms: i64) -> Result<Vec<Vec<u8>>> {
    task_run(
        None,
        move || {
            let mut bufs: Vec<Vec<u8>> = lens.into_iter().map(|len| vec![0u8; len]).collect();
            let mut iovecs: Vec<libc::iovec> = bufs
                .iter_mut()
                .map(|b| libc::iovec { iov_base: b.as_mut_ptr() as *mut _, iov_len: b.len() })
                .collect();
            // SAFETY: each iovec points at a live, exclusively-borrowed buffer
            // for the duration of this call.
            let rc = unsafe {
                libc::preadv(fd, iovecs.as_mut_ptr(), iovecs.len() as libc::c_int, offset as libc::off_t)
            };
            if rc < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
            let mut remaining = rc as usize;
            for buf in &mut bufs {
                let take = remaining.min(buf.len());
                buf.truncate(take);
                remaining -= take;
            }
            Ok(bufs)
        },
        deadline_ms,
    )?
}

pub fn writev_a(fd: RawFd, data: Vec<Vec<u8>>, offset: i64, deadline_ms: i64) -> Result<usize> {
    task_run(
        None,
        move || {
            let iovecs: Vec<libc::iovec> = data
                .iter()
                .map(|b| libc::iovec { iov_base: b.as_ptr() as *mut _, iov_len: b.len() })
                .collect();
            // SAFETY: each iovec points at a live buffer owned by `data` for
            // the duration of this call.
            let rc = unsafe {
                libc::pwritev(fd, iovecs.as_ptr(), iovecs.len() as libc::c_int, offset as libc::off_t)
            };
            if rc < 0 {
                Err(Error::Io(std::io::Error::last_os_error()))
            } else {
                Ok(rc as usize)
            }
        },
        deadline_ms,
    )?
}

pub fn fsync_a(fd: RawFd, deadline_ms: i64) -> Result<()> {
    task_run(None, move || errno_result(unsafe { libc::fsync(fd) }), deadline_ms)?
}

pub fn unlink_a(path: &std::ffi::CString, deadline_ms: i64) -> Result<()> {
    let path = path.clone();
    task_run(
        None,
        move || errno_result(unsafe { libc::unlink(path.as_ptr()) }),
        deadline_ms,
    )?
}

pub fn fstat_a(fd: RawFd, deadline_ms: i64) -> Result<libc::stat> {
    task_run(
        None,
        move || {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            // SAFETY: `st` is a valid out-pointer for the duration of the call.
            let rc = unsafe { libc::fstat(fd, &mut st) };
            if rc != 0 {
                Err(Error::Io(std::io::Error::last_os_error()))
            } else {
                Ok(st)
            }
        },
        deadline_ms,
    )?
}

pub fn stat_a(path: &std::ffi::CString, deadline_ms: i64) -> Result<libc::stat> {
    let path = path.clone();
    task_run(
        None,
        move || {
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            // SAFETY: as `fstat_a`, `path` is NUL-terminated and live for the call.
            let rc = unsafe { libc::stat(path.as_ptr(), &mut st) };
            if rc != 0 {
                Err(Error::Io(std::io::Error::last_os_error()))
            } else {
                Ok(st)
            }
        },
        deadline_ms,
    )?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn task_run_returns_the_closures_value() {
        let result = task_run(None, || 2 + 2, -1).unwrap();
        assert_eq!(result, 4);
    }

    #[test]
    fn task_run_on_explicit_worker() {
        let w = Worker::create();
        let result = task_run(Some(&w), || "hello".to_string(), -1).unwrap();
        assert_eq!(result, "hello");
        w.await_idle(-1).unwrap();
    }

    #[test]
    fn task_deadline_fires_before_slow_task_completes() {
        let deadline = crate::clock::now_ms() + 10;
        let result: Result<()> = task_run(
            None,
            || {
                std::thread::sleep(Duration::from_millis(200));
            },
            deadline,
        );
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn readv_writev_round_trip() {
        let path = std::ffi::CString::new(format!("/tmp/millrt-readv-{}", std::process::id())).unwrap();
        let fd = open_a(&path, libc::O_CREAT | libc::O_RDWR | libc::O_TRUNC, 0o600, -1).unwrap();
        let written = writev_a(fd, vec![b"hello ".to_vec(), b"world".to_vec()], 0, -1).unwrap();
        assert_eq!(written, 11);
        let chunks = readv_a(fd, vec![6, 5], 0, -1).unwrap();
        assert_eq!(chunks, vec![b"hello ".to_vec(), b"world".to_vec()]);
        close_a(fd, -1).unwrap();
        unlink_a(&path, -1).unwrap();
    }

    #[test]
    fn task_go_runs_body_as_a_fiber() {
        let result = task_go(
            None,
            || {
                assert!(sched::current().state() == sched::FiberState::Running);
                99
            },
            -1,
        )
        .unwrap();
        assert_eq!(result, 99);
    }
}
