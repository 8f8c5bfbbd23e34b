//! Join synchroniser over a set of fibers (spec §4.6 "Wait-Group").
//!
//! A fiber may belong to at most one wait-group at a time. `wait()` parks
//! the caller (at most one waiter is supported, mirroring the C contract)
//! until the member count drops to zero; `cancel()` forcibly empties the
//! group and wakes the waiter with [`Error::Cancelled`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::sched::{self, FiberId};

struct Inner {
    members: RefCell<Vec<FiberId>>,
    waiter: RefCell<Option<FiberId>>,
    cancelled: RefCell<bool>,
}

/// A reference-counted handle installed on a member fiber so its
/// termination hook can find its way back to the group without the
/// scheduler knowing anything about wait-groups.
#[derive(Clone)]
pub struct WaitGroupHandle(Rc<Inner>);

impl WaitGroupHandle {
    pub(crate) fn member_terminated(&self, fiber: &FiberId) {
        let mut members = self.0.members.borrow_mut();
        if let Some(pos) = members.iter().position(|m| m == fiber) {
            members.remove(pos);
        }
        if members.is_empty() {
            if let Some(waiter) = self.0.waiter.borrow_mut().take() {
                drop(members);
                sched::resume(waiter, 0);
            }
        }
    }
}

/// A wait-group: attach running fibers to it with [`WaitGroup::add`], then
/// have one other fiber [`WaitGroup::wait`] for all of them to finish.
#[derive(Clone)]
pub struct WaitGroup(Rc<Inner>);

impl WaitGroup {
    pub fn new() -> Self {
        WaitGroup(Rc::new(Inner {
            members: RefCell::new(Vec::new()),
            waiter: RefCell::new(None),
            cancelled: RefCell::new(false),
        }))
    }

    /// Attach the calling fiber to this group. Forbidden for the main fiber
    /// and for a fiber that already belongs to a group.
    pub fn add(&self) -> Result<()> {
        let me = sched::current();
        if sched::is_main() {
            return Err(Error::Deadlock("main fiber cannot join a wait-group".into()));
        }
        if me.wait_group().is_some() {
            return Err(Error::AlreadyExists("fiber already belongs to a wait-group".into()));
        }
        let handle = WaitGroupHandle(self.0.clone());
        me.set_wait_group(Some(handle));
        self.0.members.borrow_mut().push(me);
        Ok(())
    }

    /// Number of members currently attached.
    pub fn len(&self) -> usize {
        self.0.members.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Suspend the calling fiber until every member has terminated, or
    /// `deadline_ms` elapses (<0 = forever). At most one fiber may be
    /// parked in `wait` at a time.
    pub fn wait(&self, deadline_ms: i64) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if *self.0.cancelled.borrow() {
            return Err(Error::Cancelled);
        }
        if self.0.waiter.borrow().is_some() {
            return Err(Error::AlreadyExists("wait-group already has a waiter".into()));
        }
        let me = sched::current();
        *self.0.waiter.borrow_mut() = Some(me.clone());
        let timer = if deadline_ms >= 0 {
            Some(sched::arm_timer(me.clone(), deadline_ms, -1)?)
        } else {
            None
        };
        let result = sched::suspend();
        *self.0.waiter.borrow_mut() = None;
        if let Some(t) = timer {
            sched::cancel_timer(t);
        }
        if *self.0.cancelled.borrow() {
            return Err(Error::Cancelled);
        }
        if result < 0 {
            return Err(Error::Timeout);
        }
        Ok(())
    }

    /// Detach all members and wake the waiter (if any) with
    /// [`Error::Cancelled`]; zeroes the member count.
    pub fn cancel(&self) {
        *self.0.cancelled.borrow_mut() = true;
        for member in self.0.members.borrow_mut().drain(..) {
            member.set_wait_group(None);
        }
        if let Some(waiter) = self.0.waiter.borrow_mut().take() {
            sched::resume(waiter, -1);
        }
    }
}

impl Default for WaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched;

    #[test]
    fn wait_returns_once_all_members_finish() {
        let wg = WaitGroup::new();
        // `spawn` switches to the child immediately, so it would already have
        // run `add()` by the time the call returns; `spawn_deferred` leaves
        // both fibers queued so the assertion below observes zero members.
        let wg1 = wg.clone();
        sched::spawn_deferred(move || {
            wg1.add().unwrap();
            sched::yield_now();
        });
        let wg2 = wg.clone();
        sched::spawn_deferred(move || {
            wg2.add().unwrap();
            sched::yield_now();
            sched::yield_now();
        });
        assert_eq!(wg.len(), 0); // neither deferred fiber has run yet
        wg.wait(-1).unwrap();
        assert!(wg.is_empty());
        sched::waitall(-1).unwrap();
    }

    #[test]
    fn cancel_wakes_waiter_with_cancelled_and_empties_group() {
        let wg = WaitGroup::new();
        let wg1 = wg.clone();
        sched::spawn(move || {
            wg1.add().unwrap();
            sched::sleep(-1); // parks forever unless cancelled
        });
        let wg2 = wg.clone();
        let waiter_result = std::rc::Rc::new(std::cell::RefCell::new(None));
        let waiter_result2 = waiter_result.clone();
        sched::spawn(move || {
            *waiter_result2.borrow_mut() = Some(wg2.wait(-1));
        });
        sched::yield_now();
        wg.cancel();
        assert!(wg.is_empty());
        sched::yield_now();
        assert!(matches!(*waiter_result.borrow(), Some(Err(Error::Cancelled))));
    }
}
