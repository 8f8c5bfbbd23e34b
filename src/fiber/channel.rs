//! Typed fiber channels and the multi-way select engine (spec §3/§4.2).
//!
//! A channel is a fixed-capacity ring buffer of `T` plus a pair of waiter
//! queues: fibers parked wanting to send when the ring is full, and fibers
//! parked wanting to receive when it's empty. `Sender`/`Receiver` are
//! reference-counted handles over the same `Rc<RefCell<Inner<T>>>`; a
//! capacity of 0 makes every send/receive a rendezvous (no buffering at
//! all, a waiter on one side is required for the other to proceed).
//!
//! `send`/`recv` are themselves implemented as single-clause selects, so
//! [`Select`] is the one true engine in this module; everything else is a
//! convenience built on top of it.
//!
//! Channel handles are deliberately `!Send`/`!Sync`: fibers never cross
//! scheduler threads, so neither do the channels that connect them (spec
//! §5, §9).

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::sched::{self, FiberId};

////////////////////////////////////////////////////////////////////////////////
// Channel
////////////////////////////////////////////////////////////////////////////////

struct ClauseGroup<T> {
    fiber: FiberId,
    select: Rc<SelectState>,
    /// Branch indices within the owning select that all target this same
    /// (channel, direction) pair; one is picked uniformly at random when the
    /// group is woken, per spec §4.2 point 4. Parallel to `slots`: `indices[i]`
    /// is the select branch that owns `slots[i]`.
    indices: RefCell<Vec<usize>>,
    /// Each duplicate branch's own value slot (the same `Rc` its
    /// `RecvToken`/`SendToken` holds), so that whichever one is picked
    /// delivers into, or reclaims from, the slot the caller can actually see.
    slots: RefCell<Vec<Rc<RefCell<Option<T>>>>>,
}

impl<T> ClauseGroup<T> {
    /// Pick one registered branch uniformly at random and return its index
    /// together with its own value slot.
    fn pick(&self) -> (usize, Rc<RefCell<Option<T>>>) {
        let indices = self.indices.borrow();
        let slots = self.slots.borrow();
        let i = if indices.len() == 1 { 0 } else { rand::random::<usize>() % indices.len() };
        (indices[i], slots[i].clone())
    }
}

struct SelectState {
    resolved: std::cell::Cell<bool>,
}

impl SelectState {
    fn new() -> Self {
        SelectState { resolved: std::cell::Cell::new(false) }
    }

    /// Claim this select for a single winning clause. Returns `false` if
    /// another clause already won the race (possible because `resume` only
    /// enqueues the fiber; it doesn't run cleanup until the fiber is
    /// actually scheduled, so two different channels can both find a match
    /// for the same parked select before it wakes).
    fn claim(&self) -> bool {
        !self.resolved.replace(true)
    }

    /// True if no clause has claimed this select yet. Unlike [`claim`], this
    /// doesn't consume the race: it's a peek used to tell a live queue entry
    /// apart from a stale one left behind by a select that already resolved
    /// through a different channel.
    fn is_live(&self) -> bool {
        !self.resolved.get()
    }
}

/// True if `queue` holds at least one entry belonging to a select that
/// hasn't resolved yet. A multi-branch select that wins through one channel
/// leaves its other registrations sitting in their channels' waiter queues;
/// those are stale and must not make `is_available()` report readiness, or
/// `commit_now()` would either find nothing left to commit or violate the
/// channel's capacity invariant. Doesn't pop anything itself — `pop_live_group`
/// still does that lazily once a branch actually commits.
fn queue_has_live<T>(queue: &VecDeque<Rc<ClauseGroup<T>>>) -> bool {
    queue.iter().any(|group| group.select.is_live())
}

pub(super) struct Inner<T> {
    buf: VecDeque<T>,
    cap: usize,
    done: bool,
    terminal: Option<T>,
    send_waiters: VecDeque<Rc<ClauseGroup<T>>>,
    recv_waiters: VecDeque<Rc<ClauseGroup<T>>>,
    tx_count: usize,
    rx_count: usize,
}

pub(super) struct Channel<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Channel<T> {
    fn new(cap: usize) -> Self {
        Channel {
            inner: Rc::new(RefCell::new(Inner {
                buf: VecDeque::with_capacity(cap.min(64)),
                cap,
                done: false,
                terminal: None,
                send_waiters: VecDeque::new(),
                recv_waiters: VecDeque::new(),
                tx_count: 1,
                rx_count: 1,
            })),
        }
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel { inner: self.inner.clone() }
    }
}

/// Pop queue entries until a live (not-yet-resolved) one is found, silently
/// discarding any that lost a cross-channel race in the meantime.
fn pop_live_group<T>(queue: &mut VecDeque<Rc<ClauseGroup<T>>>) -> Option<Rc<ClauseGroup<T>>> {
    while let Some(group) = queue.pop_front() {
        if group.select.claim() {
            return Some(group);
        }
    }
    None
}

/// Object-safe view over one channel endpoint (a send or a receive branch)
/// so [`Select`] can hold branches of different element types in one
/// builder.
trait Endpoint {
    /// True if this branch could proceed right now without blocking.
    fn is_available(&self) -> bool;
    /// Perform the transfer for an immediately-available branch.
    fn commit_now(&self);
    /// Park this branch on its channel's waiter queue, merging with any
    /// earlier branch from the same select on the same (channel,
    /// direction) pair.
    fn register(&self, fiber: FiberId, state: &Rc<SelectState>, index: usize, dedup: &mut DedupMap);
    /// Which of the two spec §3 fiber states a fiber parked on only this
    /// branch should report; used by `Select::wait()` to pick between the
    /// specific `ReceivingOnChan`/`SendingOnChan` states and the generic
    /// `InSelect` one for a genuine multi-branch wait.
    fn direction(&self) -> Direction;
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Recv,
    Send,
}

type DedupMap = HashMap<(usize, u8), Box<dyn Any>>;

struct RecvBranch<T: Clone + 'static> {
    chan: Rc<RefCell<Inner<T>>>,
    slot: Rc<RefCell<Option<T>>>,
}

impl<T: Clone + 'static> Endpoint for RecvBranch<T> {
    fn is_available(&self) -> bool {
        let inner = self.chan.borrow();
        !inner.buf.is_empty() || inner.done || queue_has_live(&inner.send_waiters)
    }

    fn commit_now(&self) {
        let value = {
            let mut inner = self.chan.borrow_mut();
            if let Some(v) = inner.buf.pop_front() {
                if let Some(group) = pop_live_group(&mut inner.send_waiters) {
                    let (idx, slot) = group.pick();
                    let sent = slot.borrow_mut().take().expect("send clause with no value");
                    inner.buf.push_back(sent);
                    sched::resume(group.fiber.clone(), idx as i64);
                }
                v
            } else if let Some(group) = pop_live_group(&mut inner.send_waiters) {
                let (idx, slot) = group.pick();
                let sent = slot.borrow_mut().take().expect("send clause with no value");
                sched::resume(group.fiber.clone(), idx as i64);
                sent
            } else if inner.done {
                inner.terminal.clone().expect("done channel missing terminal value")
            } else {
                unreachable!("commit_now called on an unavailable receive branch")
            }
        };
        *self.slot.borrow_mut() = Some(value);
    }

    fn register(&self, fiber: FiberId, state: &Rc<SelectState>, index: usize, dedup: &mut DedupMap) {
        let key = (Rc::as_ptr(&self.chan) as *const () as usize, 0u8);
        let group = match dedup.get(&key) {
            Some(existing) => existing.downcast_ref::<Rc<ClauseGroup<T>>>().unwrap().clone(),
            None => {
                let g = Rc::new(ClauseGroup {
                    fiber,
                    select: state.clone(),
                    indices: RefCell::new(Vec::new()),
                    slots: RefCell::new(Vec::new()),
                });
                self.chan.borrow_mut().recv_waiters.push_back(g.clone());
                dedup.insert(key, Box::new(g.clone()));
                g
            }
        };
        group.indices.borrow_mut().push(index);
        group.slots.borrow_mut().push(self.slot.clone());
    }

    fn direction(&self) -> Direction {
        Direction::Recv
    }
}

struct SendBranch<T: 'static> {
    chan: Rc<RefCell<Inner<T>>>,
    slot: Rc<RefCell<Option<T>>>,
}

impl<T: 'static> Endpoint for SendBranch<T> {
    fn is_available(&self) -> bool {
        let inner = self.chan.borrow();
        if inner.done {
            return false;
        }
        queue_has_live(&inner.recv_waiters) || inner.buf.len() < inner.cap
    }

    fn commit_now(&self) {
        let value = self.slot.borrow_mut().take().expect("send branch with no value");
        let mut inner = self.chan.borrow_mut();
        if let Some(group) = pop_live_group(&mut inner.recv_waiters) {
            let (idx, slot) = group.pick();
            *slot.borrow_mut() = Some(value);
            sched::resume(group.fiber.clone(), idx as i64);
        } else {
            debug_assert!(inner.buf.len() < inner.cap);
            inner.buf.push_back(value);
        }
    }

    fn register(&self, fiber: FiberId, state: &Rc<SelectState>, index: usize, dedup: &mut DedupMap) {
        let key = (Rc::as_ptr(&self.chan) as *const () as usize, 1u8);
        let group = match dedup.get(&key) {
            Some(existing) => existing.downcast_ref::<Rc<ClauseGroup<T>>>().unwrap().clone(),
            None => {
                let g = Rc::new(ClauseGroup {
                    fiber,
                    select: state.clone(),
                    indices: RefCell::new(Vec::new()),
                    slots: RefCell::new(Vec::new()),
                });
                self.chan.borrow_mut().send_waiters.push_back(g.clone());
                dedup.insert(key, Box::new(g.clone()));
                g
            }
        };
        group.indices.borrow_mut().push(index);
        group.slots.borrow_mut().push(self.slot.clone());
    }

    fn direction(&self) -> Direction {
        Direction::Send
    }
}

////////////////////////////////////////////////////////////////////////////////
// Select
////////////////////////////////////////////////////////////////////////////////

/// Outcome of a [`Select::wait`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectResult {
    /// The branch at this index fired.
    Branch(usize),
    /// The deadline elapsed before any branch became available.
    Deadline,
    /// No branch was immediately available and an `otherwise` branch exists.
    Otherwise,
}

/// A multi-way wait over any number of channel send/receive branches, plus
/// an optional deadline or `otherwise` branch (spec §4.2).
pub struct Select<'a> {
    branches: Vec<Box<dyn Endpoint + 'a>>,
    deadline_ms: Option<i64>,
    otherwise: bool,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Select { branches: Vec::new(), deadline_ms: None, otherwise: false }
    }

    /// Register a receive branch; returns a token to retrieve the value
    /// with once [`Select::wait`] reports this branch's index as chosen.
    pub fn recv<T: Clone + 'static>(&mut self, rx: &Receiver<T>) -> RecvToken<T> {
        let slot = Rc::new(RefCell::new(None));
        let index = self.branches.len();
        self.branches.push(Box::new(RecvBranch { chan: rx.chan.inner.clone(), slot: slot.clone() }));
        RecvToken { index, slot }
    }

    /// Register a send branch carrying `value`; if this branch isn't
    /// chosen, the value can be reclaimed from the returned token.
    pub fn send<T: 'static>(&mut self, tx: &Sender<T>, value: T) -> SendToken<T> {
        let slot = Rc::new(RefCell::new(Some(value)));
        let index = self.branches.len();
        self.branches.push(Box::new(SendBranch { chan: tx.chan.inner.clone(), slot: slot.clone() }));
        SendToken { index, slot }
    }

    /// At most one deadline branch is allowed, and it's mutually exclusive
    /// with [`Select::otherwise`].
    pub fn deadline(mut self, deadline_ms: i64) -> Result<Self> {
        if self.deadline_ms.is_some() {
            return Err(Error::AlreadyExists("select already has a deadline branch".into()));
        }
        if self.otherwise {
            return Err(Error::InvalidArgument("deadline and otherwise are mutually exclusive".into()));
        }
        self.deadline_ms = Some(deadline_ms);
        Ok(self)
    }

    pub fn otherwise(mut self) -> Result<Self> {
        if self.otherwise {
            return Err(Error::AlreadyExists("select already has an otherwise branch".into()));
        }
        if self.deadline_ms.is_some() {
            return Err(Error::InvalidArgument("deadline and otherwise are mutually exclusive".into()));
        }
        self.otherwise = true;
        Ok(self)
    }

    /// Drive the select to completion: execute an immediately-available
    /// branch, fall back to `otherwise`, or park and wait.
    pub fn wait(self) -> Result<SelectResult> {
        let available: Vec<usize> =
            (0..self.branches.len()).filter(|&i| self.branches[i].is_available()).collect();
        if !available.is_empty() {
            let chosen = if available.len() == 1 {
                available[0]
            } else {
                available[rand::random::<usize>() % available.len()]
            };
            self.branches[chosen].commit_now();
            return Ok(SelectResult::Branch(chosen));
        }
        if self.otherwise {
            return Ok(SelectResult::Otherwise);
        }

        let me = sched::current();
        let state = Rc::new(SelectState::new());
        let mut dedup: DedupMap = HashMap::new();
        for (index, branch) in self.branches.iter().enumerate() {
            branch.register(me.clone(), &state, index, &mut dedup);
        }
        let timer = match self.deadline_ms {
            Some(ms) => Some(sched::arm_timer(me.clone(), ms, -1)?),
            None => None,
        };
        // A select parked on exactly one branch reports the specific
        // Receiving/SendingOnChan state from spec §3's fiber data model; a
        // genuine multi-branch wait reports the generic InSelect. `do_resume`
        // (driven by a winning peer, a timer, or `done()`) sets the fiber
        // back to `Ready` itself, so there's nothing to restore here on wake.
        let parked_state = match self.branches.as_slice() {
            [one] => match one.direction() {
                Direction::Recv => sched::FiberState::ReceivingOnChan,
                Direction::Send => sched::FiberState::SendingOnChan,
            },
            _ => sched::FiberState::InSelect,
        };
        me.set_state(parked_state);
        let result = sched::suspend();
        if let Some(t) = timer {
            sched::cancel_timer(t);
        }
        // Whichever clause won already set `state.resolved`; claim it here
        // too so any clause that wasn't actually picked (the losing half of
        // a same-select duplicate, or every clause on a timeout) is treated
        // as stale and lazily dropped the next time something scans its
        // channel's waiter queue.
        state.resolved.set(true);
        if result < 0 {
            return Ok(SelectResult::Deadline);
        }
        Ok(SelectResult::Branch(result as usize))
    }
}

impl<'a> Default for Select<'a> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RecvToken<T> {
    index: usize,
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> RecvToken<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Takes the delivered value. Only meaningful after `wait()` reports
    /// this token's index as the chosen branch.
    pub fn take(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

pub struct SendToken<T> {
    index: usize,
    slot: Rc<RefCell<Option<T>>>,
}

impl<T> SendToken<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// If this branch wasn't chosen, hands the value back to the caller.
    pub fn reclaim(&self) -> Option<T> {
        self.slot.borrow_mut().take()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Sender / Receiver
////////////////////////////////////////////////////////////////////////////////

/// Create a channel with buffer capacity `cap` (0 = rendezvous, every send
/// must meet a waiting receiver).
pub fn channel<T: Clone + 'static>(cap: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Channel::new(cap);
    (Sender { chan: chan.clone(), _not_send: PhantomData }, Receiver { chan, _not_send: PhantomData })
}

/// The sending half of a channel. Cloning increments the reference count;
/// the channel's send side is considered closed once the last clone drops.
pub struct Sender<T: 'static> {
    chan: Channel<T>,
    _not_send: PhantomData<Rc<()>>,
}

impl<T: Clone + 'static> Sender<T> {
    /// Send a value, parking the fiber if the channel is full and has no
    /// waiting receiver. Fails with [`Error::Closed`] if `done()` has
    /// already been called on this channel.
    pub fn send(&self, value: T) -> Result<()> {
        self.send_deadline(value, -1)
    }

    /// Like [`Self::send`], failing with [`Error::Timeout`] if `deadline_ms`
    /// (≥0) elapses first.
    pub fn send_deadline(&self, value: T, deadline_ms: i64) -> Result<()> {
        if self.chan.inner.borrow().done {
            return Err(Error::Closed(crate::error::ClosedKind::ChannelDone));
        }
        let mut sel = Select::new();
        let token = sel.send(self, value);
        let sel = if deadline_ms >= 0 { sel.deadline(deadline_ms)? } else { sel };
        match sel.wait()? {
            SelectResult::Branch(_) => Ok(()),
            SelectResult::Deadline => {
                token.reclaim();
                Err(Error::Timeout)
            }
            SelectResult::Otherwise => unreachable!("send select never registers otherwise"),
        }
    }

    /// Mark the channel done: wakes every pending receiver with `value`,
    /// and all future (and the currently-pending, if empty) receives
    /// immediately return `value`. Fails if a sender is currently parked or
    /// the channel is already done.
    pub fn done(&self, value: T) -> Result<()> {
        let mut inner = self.chan.inner.borrow_mut();
        if inner.done {
            return Err(Error::AlreadyExists("channel is already done".into()));
        }
        if !inner.send_waiters.is_empty() {
            return Err(Error::Busy);
        }
        inner.done = true;
        inner.terminal = Some(value.clone());
        let receivers: Vec<_> = inner.recv_waiters.drain(..).collect();
        drop(inner);
        for group in receivers {
            if !group.select.claim() {
                continue;
            }
            let (idx, slot) = group.pick();
            *slot.borrow_mut() = Some(value.clone());
            sched::resume(group.fiber.clone(), idx as i64);
        }
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.inner.borrow_mut().tx_count += 1;
        Sender { chan: self.chan.clone(), _not_send: PhantomData }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        let mut inner = self.chan.inner.borrow_mut();
        inner.tx_count -= 1;
    }
}

/// The receiving half of a channel. Cloning increments the reference
/// count; supports the usual `Iter`/`IntoIterator` adapters.
pub struct Receiver<T: 'static> {
    chan: Channel<T>,
    _not_send: PhantomData<Rc<()>>,
}

impl<T: Clone + 'static> Receiver<T> {
    pub fn recv(&self) -> Result<T> {
        self.recv_deadline(-1)
    }

    pub fn recv_deadline(&self, deadline_ms: i64) -> Result<T> {
        let mut sel = Select::new();
        let token = sel.recv(self);
        let sel = if deadline_ms >= 0 { sel.deadline(deadline_ms)? } else { sel };
        match sel.wait()? {
            SelectResult::Branch(_) => Ok(token.take().expect("winning recv branch left no value")),
            SelectResult::Deadline => Err(Error::Timeout),
            SelectResult::Otherwise => unreachable!("recv select never registers otherwise"),
        }
    }

    /// Non-blocking receive: `Ok(None)` if nothing is immediately available.
    pub fn try_recv(&self) -> Result<Option<T>> {
        let mut sel = Select::new();
        let token = sel.recv(self);
        let sel = sel.otherwise()?;
        match sel.wait()? {
            SelectResult::Branch(_) => Ok(Some(token.take().expect("winning recv branch left no value"))),
            SelectResult::Otherwise => Ok(None),
            SelectResult::Deadline => unreachable!("no deadline branch was registered"),
        }
    }

    pub fn iter(&self) -> Iter<'_, T> {
        Iter { receiver: self }
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.chan.inner.borrow_mut().rx_count += 1;
        Receiver { chan: self.chan.clone(), _not_send: PhantomData }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        let mut inner = self.chan.inner.borrow_mut();
        inner.rx_count -= 1;
    }
}

pub struct Iter<'a, T: 'a> {
    receiver: &'a Receiver<T>,
}

impl<'a, T: Clone + 'static> Iterator for Iter<'a, T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

impl<'a, T: Clone + 'static> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver").finish_non_exhaustive()
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;

    #[test]
    fn rendezvous_send_wakes_waiting_receiver() {
        let (tx, rx) = channel::<i32>(0);
        sched::spawn(move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv().unwrap(), 42);
        sched::waitall(-1).unwrap();
    }

    #[test]
    fn buffered_send_does_not_block() {
        let (tx, rx) = channel::<i32>(2);
        tx.send(1).unwrap();
        tx.send(2).unwrap();
        assert_eq!(rx.recv().unwrap(), 1);
        assert_eq!(rx.recv().unwrap(), 2);
    }

    #[test]
    fn done_wakes_pending_receivers_with_terminal_value() {
        let (tx, rx) = channel::<i32>(0);
        let rx2 = rx.clone();
        let got = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let g1 = got.clone();
        sched::spawn(move || g1.borrow_mut().push(rx.recv().unwrap()));
        let g2 = got.clone();
        sched::spawn(move || g2.borrow_mut().push(rx2.recv().unwrap()));
        tx.done(99).unwrap();
        sched::waitall(-1).unwrap();
        assert_eq!(*got.borrow(), vec![99, 99]);
    }

    #[test]
    fn try_recv_returns_none_when_empty() {
        let (_tx, rx) = channel::<i32>(1);
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[test]
    fn select_picks_the_available_branch() {
        let (tx_a, rx_a) = channel::<i32>(1);
        let (_tx_b, rx_b) = channel::<i32>(1);
        tx_a.send(7).unwrap();
        let mut sel = Select::new();
        let a = sel.recv(&rx_a);
        let b = sel.recv(&rx_b);
        match sel.wait().unwrap() {
            SelectResult::Branch(i) if i == a.index() => assert_eq!(a.take(), Some(7)),
            SelectResult::Branch(i) if i == b.index() => panic!("rx_b had nothing queued"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parked_send_select_reclaims_value_on_deadline() {
        let (tx, _rx) = channel::<i32>(0); // never read from, so send can only park
        let mut sel = Select::new();
        let token = sel.send(&tx, 7);
        let sel = sel.deadline(crate::clock::now_ms() + 5).unwrap();
        assert_eq!(sel.wait().unwrap(), SelectResult::Deadline);
        assert_eq!(token.reclaim(), Some(7));
    }

    #[test]
    fn send_to_done_channel_fails_closed() {
        let (tx, rx) = channel::<i32>(0);
        tx.done(1).unwrap();
        let err = tx.send(2).unwrap_err();
        assert!(matches!(err, Error::Closed(crate::error::ClosedKind::ChannelDone)));
        let _ = rx;
    }

    /// A select resolved through one of its branches leaves its other
    /// registrations sitting, stale, in their channels' waiter queues. A
    /// later, unrelated select on that other channel must not treat the
    /// stale entry as a live waiter.
    #[test]
    fn stale_multi_branch_registration_does_not_make_other_channel_falsely_available() {
        let (tx_a, rx_a) = channel::<i32>(0);
        let (tx_b, rx_b) = channel::<i32>(0);

        sched::spawn(move || {
            let mut sel = Select::new();
            let a = sel.recv(&rx_a);
            let _b = sel.recv(&rx_b);
            match sel.wait().unwrap() {
                SelectResult::Branch(i) if i == a.index() => assert_eq!(a.take(), Some(1)),
                other => panic!("unexpected {other:?}"),
            }
        });

        // Wakes the parked select through channel A only; its rx_b
        // registration is now stale in chan_b's recv_waiters queue.
        tx_a.send(1).unwrap();
        sched::waitall(-1).unwrap();

        // A plain send on the rendezvous channel B, with no live receiver,
        // must park and eventually time out rather than treat the stale
        // queue entry as an available receiver (which would either panic
        // on the cap invariant assert or silently overfill the buffer).
        let err = tx_b.send_deadline(2, crate::clock::now_ms() + 5).unwrap_err();
        assert!(matches!(err, Error::Timeout));
        let _ = rx_b;
    }

    /// A fiber parked inside a single-branch select reports the specific
    /// Receiving/SendingOnChan state; a genuine multi-branch select reports
    /// the generic InSelect state (spec §3's fiber data model).
    #[test]
    fn parked_select_reports_the_right_fiber_state() {
        let (_tx_a, rx_a) = channel::<i32>(0);
        let single_fiber = sched::spawn(move || {
            let _ = rx_a.recv();
        });
        assert_eq!(single_fiber.state(), sched::FiberState::ReceivingOnChan);

        let (_tx_b, rx_b) = channel::<i32>(0);
        let (_tx_c, rx_c) = channel::<i32>(0);
        let multi_fiber = sched::spawn(move || {
            let mut sel = Select::new();
            let _a = sel.recv(&rx_b);
            let _b = sel.recv(&rx_c);
            let _ = sel.wait();
        });
        assert_eq!(multi_fiber.state(), sched::FiberState::InSelect);
    }
}
