//! Generic synchronization object
//!
//! A wait queue ordered so the next thread to wake is O(1) to find,
//! plus an optional owner reference for objects implementing mutual
//! exclusion. When priority inheritance is enabled, the owner carries
//! one boost source per contested object; its effective priority is
//! the maximum of its base and all boosts, so nested ownership cannot
//! open priority-inversion gaps.

use crate::core::nucleus::Kernel;
use crate::core::sched::{Priority, ThreadId, ThreadInfo, ThreadState};
use crate::core::{Error, Result, Timeout};
use crate::utils::arena::Handle;
use alloc::vec::Vec;
use bitflags::bitflags;

/// Handle to a [`SyncObject`].
pub type SyncId = Handle<SyncObject>;

/// Longest inheritance chain walked when boosts propagate through
/// nested ownership. Deeper chains indicate a cycle, which is a
/// locking-protocol defect of the caller.
const MAX_PI_DEPTH: usize = 16;

bitflags! {
    /// Queuing and protocol selection, fixed at creation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SyncFlags: u32 {
        /// Wake by priority (FIFO within a priority)
        const PRIO = 1 << 0;
        /// Wake strictly in arrival order
        const FIFO = 1 << 1;
        /// Priority inheritance protocol on the owner
        const PIP  = 1 << 2;
    }
}

/// Priority-ordered wait queue with optional ownership.
pub struct SyncObject {
    pub(crate) flags: SyncFlags,
    /// Waiting threads; head is the next to wake
    pub(crate) waiters: Vec<ThreadId>,
    pub(crate) owner: Option<ThreadId>,
}

impl SyncObject {
    pub fn new(flags: SyncFlags) -> Self {
        Self {
            flags,
            waiters: Vec::new(),
            owner: None,
        }
    }

    pub fn nsleepers(&self) -> usize {
        self.waiters.len()
    }
}

impl Kernel {
    pub(crate) fn sync_create(&mut self, flags: SyncFlags) -> SyncId {
        self.syncs.insert(SyncObject::new(flags))
    }

    /// Destroy an object with no waiters. Callers that must tear down
    /// a contended object flush it first.
    pub(crate) fn sync_destroy(&mut self, sid: SyncId) -> Result<()> {
        let s = self.syncs.get(sid).ok_or(Error::InvalidHandle)?;
        if !s.waiters.is_empty() {
            return Err(Error::Busy);
        }
        if let Some(owner) = s.owner {
            if let Some(th) = self.threads.get_mut(owner) {
                th.set_boost(sid, None);
            }
        }
        self.syncs.remove(sid);
        Ok(())
    }

    pub(crate) fn sync_nsleepers(&self, sid: SyncId) -> Result<usize> {
        self.syncs
            .get(sid)
            .map(|s| s.nsleepers())
            .ok_or(Error::InvalidHandle)
    }

    pub(crate) fn sync_owner(&self, sid: SyncId) -> Result<Option<ThreadId>> {
        self.syncs.get(sid).map(|s| s.owner).ok_or(Error::InvalidHandle)
    }

    /// Atomically (under the nucleus lock) unready the calling thread,
    /// link it into the wait queue at its priority position, and arm
    /// the timeout. The caller triggers the reschedule.
    pub(crate) fn sleep_on(&mut self, sid: SyncId, tid: ThreadId, timeout: Timeout) -> Result<()> {
        if !self.syncs.contains(sid) || !self.threads.contains(tid) {
            return Err(Error::InvalidHandle);
        }
        if let Some(th) = self.threads.get_mut(tid) {
            th.wait_on = Some(sid);
        }
        self.insert_waiter(sid, tid);
        self.refresh_boost(sid);
        self.suspend_thread(tid, ThreadState::PEND, timeout);
        Ok(())
    }

    /// Queue `tid` at its wake position: priority order with FIFO
    /// fairness among equals, or pure FIFO if the object says so.
    fn insert_waiter(&mut self, sid: SyncId, tid: ThreadId) {
        let prio = self.eff_prio(tid);
        let threads = &self.threads;
        let Some(s) = self.syncs.get_mut(sid) else { return };
        let pos = if s.flags.contains(SyncFlags::PRIO) {
            s.waiters
                .iter()
                .position(|&w| {
                    threads
                        .get(w)
                        .map(|t| t.effective_priority())
                        .unwrap_or(Priority::MIN)
                        < prio
                })
                .unwrap_or(s.waiters.len())
        } else {
            s.waiters.len()
        };
        s.waiters.insert(pos, tid);
    }

    /// Re-sort one waiter after its effective priority changed.
    pub(crate) fn reorder_waiter(&mut self, sid: SyncId, tid: ThreadId) {
        let Some(s) = self.syncs.get_mut(sid) else { return };
        if !s.flags.contains(SyncFlags::PRIO) {
            return;
        }
        if let Some(pos) = s.waiters.iter().position(|&w| w == tid) {
            s.waiters.remove(pos);
            self.insert_waiter(sid, tid);
            self.refresh_boost(sid);
        }
    }

    /// Unlink `tid` from whatever it pends on, updating the owner's
    /// inherited priority.
    pub(crate) fn unlink_waiter(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get_mut(tid) else { return };
        let Some(sid) = th.wait_on.take() else { return };
        if let Some(s) = self.syncs.get_mut(sid) {
            if let Some(pos) = s.waiters.iter().position(|&w| w == tid) {
                s.waiters.remove(pos);
            }
        }
        self.refresh_boost(sid);
    }

    /// Install `tid` as owner, inheriting from any remaining waiters.
    pub(crate) fn sync_set_owner(&mut self, sid: SyncId, tid: ThreadId) {
        if let Some(s) = self.syncs.get_mut(sid) {
            s.owner = Some(tid);
        }
        self.refresh_boost(sid);
    }

    /// Drop ownership, reverting the old owner to its base priority or
    /// to the next boost it still inherits elsewhere.
    pub(crate) fn sync_clear_owner(&mut self, sid: SyncId) {
        let old = self.syncs.get_mut(sid).and_then(|s| s.owner.take());
        if let Some(old) = old {
            if let Some(th) = self.threads.get_mut(old) {
                th.set_boost(sid, None);
            }
            self.requeue_and_propagate(old);
        }
    }

    /// Recompute the boost the owner inherits from this object's wait
    /// queue, then walk the ownership chain so nested inheritance
    /// stays gap-free.
    pub(crate) fn refresh_boost(&mut self, sid: SyncId) {
        let Some(s) = self.syncs.get(sid) else { return };
        if !s.flags.contains(SyncFlags::PIP) {
            return;
        }
        let Some(owner) = s.owner else { return };
        let threads = &self.threads;
        let top = s
            .waiters
            .iter()
            .filter_map(|&w| threads.get(w).map(|t| t.effective_priority()))
            .max();
        let Some(th) = self.threads.get_mut(owner) else { return };
        let before = th.effective_priority();
        // Inherit only what actually exceeds the owner's base.
        th.set_boost(sid, top.filter(|&p| p > th.base_prio));
        if th.effective_priority() != before {
            self.requeue_and_propagate(owner);
        }
    }

    /// After `tid`'s effective priority changed: reposition it in its
    /// queue, and if it pends on an inheriting object, push the change
    /// up the ownership chain.
    pub(crate) fn requeue_and_propagate(&mut self, tid: ThreadId) {
        let mut cursor = tid;
        for _ in 0..MAX_PI_DEPTH {
            self.reposition(cursor);
            let Some(th) = self.threads.get(cursor) else { break };
            let Some(sid) = th.wait_on else { break };
            let Some(s) = self.syncs.get(sid) else { break };
            if !s.flags.contains(SyncFlags::PIP) {
                break;
            }
            let Some(owner) = s.owner else { break };
            let threads = &self.threads;
            let top = s
                .waiters
                .iter()
                .filter_map(|&w| threads.get(w).map(|t| t.effective_priority()))
                .max();
            let Some(oth) = self.threads.get_mut(owner) else { break };
            let before = oth.effective_priority();
            let base = oth.base_prio;
            oth.set_boost(sid, top.filter(|&p| p > base));
            if oth.effective_priority() == before {
                break;
            }
            cursor = owner;
        }
    }

    /// Conclude one waiter's wait. Info bits describing the cause are
    /// already set; a thread inside a condition wait is diverted into
    /// the mutex-reacquisition protocol instead of being readied.
    pub(crate) fn wake_waiter(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get(tid) else { return };
        let intercept = th.cond_wait.is_some_and(|c| c.outcome.is_none());
        if intercept {
            self.cond_conclude(tid);
        } else {
            self.resume_thread(tid, ThreadState::PEND | ThreadState::DELAY);
        }
    }

    /// Wake the head waiter, returning it so the caller decides
    /// whether a reschedule is warranted.
    pub(crate) fn sync_wakeup_one(&mut self, sid: SyncId) -> Result<Option<ThreadId>> {
        let s = self.syncs.get(sid).ok_or(Error::InvalidHandle)?;
        let Some(&head) = s.waiters.first() else {
            return Ok(None);
        };
        self.wake_waiter(head);
        Ok(Some(head))
    }

    /// Wake every waiter (broadcast semantics).
    pub(crate) fn sync_wakeup_all(&mut self, sid: SyncId) -> Result<bool> {
        self.sync_flush(sid, ThreadInfo::empty())
    }

    /// Wake every waiter tagged with `reason` (object-deletion paths
    /// pass DELETED). Returns whether anything woke, i.e. whether the
    /// caller should reschedule.
    pub(crate) fn sync_flush(&mut self, sid: SyncId, reason: ThreadInfo) -> Result<bool> {
        let s = self.syncs.get(sid).ok_or(Error::InvalidHandle)?;
        let batch = s.waiters.clone();
        for tid in &batch {
            if let Some(th) = self.threads.get_mut(*tid) {
                th.info.insert(reason);
            }
            self.wake_waiter(*tid);
        }
        Ok(!batch.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::nucleus::test::{spawn, test_kernel};
    use crate::core::sched::{ThreadAttrs, ThreadState};
    use crate::core::sync::object::SyncFlags;
    use crate::core::{Error, Timeout, WaitOutcome};

    #[test]
    fn test_wakeup_order_by_priority_then_fifo() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO);
        let low = spawn(&mut k, 1);
        let hi = spawn(&mut k, 9);
        let mid_a = spawn(&mut k, 5);
        let mid_b = spawn(&mut k, 5);
        for t in [low, mid_a, hi, mid_b] {
            k.sleep_on(sid, t, Timeout::Infinite).unwrap();
        }
        assert_eq!(k.sync_nsleepers(sid), Ok(4));
        // Highest priority first; equal priorities in arrival order.
        assert_eq!(k.sync_wakeup_one(sid), Ok(Some(hi)));
        assert_eq!(k.sync_wakeup_one(sid), Ok(Some(mid_a)));
        assert_eq!(k.sync_wakeup_one(sid), Ok(Some(mid_b)));
        assert_eq!(k.sync_wakeup_one(sid), Ok(Some(low)));
        assert_eq!(k.sync_wakeup_one(sid), Ok(None));
    }

    #[test]
    fn test_sleep_and_normal_wakeup_outcome() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO);
        let tid = k.thread_create(&ThreadAttrs::default()).unwrap();
        k.thread_start(tid).unwrap();
        k.sleep_on(sid, tid, Timeout::Infinite).unwrap();
        assert!(k.threads.get(tid).unwrap().state.contains(ThreadState::PEND));
        k.sync_wakeup_one(sid).unwrap();
        let th = k.threads.get(tid).unwrap();
        assert!(th.state.contains(ThreadState::READY));
        assert_eq!(th.wait_result, WaitOutcome::Normal);
    }

    #[test]
    fn test_timeout_outcome_and_unlink() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO);
        let tid = k.thread_create(&ThreadAttrs::default()).unwrap();
        k.thread_start(tid).unwrap();
        k.sleep_on(sid, tid, Timeout::Rel(10)).unwrap();
        k.test_advance_and_fire(10);
        let th = k.threads.get(tid).unwrap();
        assert_eq!(th.wait_result, WaitOutcome::TimedOut);
        assert!(th.state.contains(ThreadState::READY));
        assert_eq!(k.sync_nsleepers(sid), Ok(0));
    }

    #[test]
    fn test_signal_timeout_race_is_exclusive() {
        // A wakeup just before the deadline must not also report a
        // timeout: the armed timer is cancelled under the same lock.
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO);
        let tid = k.thread_create(&ThreadAttrs::default()).unwrap();
        k.thread_start(tid).unwrap();
        k.sleep_on(sid, tid, Timeout::Rel(10)).unwrap();
        k.sync_wakeup_one(sid).unwrap();
        k.test_advance_and_fire(20);
        let th = k.threads.get(tid).unwrap();
        assert_eq!(th.wait_result, WaitOutcome::Normal);
    }

    #[test]
    fn test_flush_tags_reason() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO);
        let a = k.thread_create(&ThreadAttrs::default()).unwrap();
        let b = k.thread_create(&ThreadAttrs::default()).unwrap();
        for t in [a, b] {
            k.thread_start(t).unwrap();
            k.sleep_on(sid, t, Timeout::Infinite).unwrap();
        }
        assert_eq!(
            k.sync_flush(sid, crate::core::sched::ThreadInfo::DELETED),
            Ok(true)
        );
        for t in [a, b] {
            assert_eq!(k.threads.get(t).unwrap().wait_result, WaitOutcome::Deleted);
        }
        // Nothing left to wake.
        assert_eq!(
            k.sync_flush(sid, crate::core::sched::ThreadInfo::DELETED),
            Ok(false)
        );
    }

    #[test]
    fn test_destroy_refused_with_waiters() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO);
        let tid = k.thread_create(&ThreadAttrs::default()).unwrap();
        k.thread_start(tid).unwrap();
        k.sleep_on(sid, tid, Timeout::Infinite).unwrap();
        assert_eq!(k.sync_destroy(sid), Err(Error::Busy));
        k.sync_wakeup_one(sid).unwrap();
        assert_eq!(k.sync_destroy(sid), Ok(()));
    }

    #[test]
    fn test_forced_break_outcome() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO);
        let tid = k.thread_create(&ThreadAttrs::default()).unwrap();
        k.thread_start(tid).unwrap();
        k.sleep_on(sid, tid, Timeout::Rel(100)).unwrap();
        assert_eq!(k.thread_unblock(tid), Ok(true));
        let th = k.threads.get(tid).unwrap();
        assert_eq!(th.wait_result, WaitOutcome::Interrupted);
        assert_eq!(k.sync_nsleepers(sid), Ok(0));
        // The timeout must not fire afterwards.
        k.test_advance_and_fire(200);
        assert_eq!(
            k.threads.get(tid).unwrap().wait_result,
            WaitOutcome::Interrupted
        );
    }

    #[test]
    fn test_priority_inheritance_basic() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO | SyncFlags::PIP);
        let owner = spawn(&mut k, 10);
        let waiter = spawn(&mut k, 90);
        k.sync_set_owner(sid, owner);
        assert_eq!(k.eff_prio(owner), 10);
        k.sleep_on(sid, waiter, Timeout::Infinite).unwrap();
        assert!(k.eff_prio(owner) >= 90);
        // Release: the boost reverts.
        k.sync_clear_owner(sid);
        assert_eq!(k.eff_prio(owner), 10);
    }

    #[test]
    fn test_renice_repositions_waiter_and_boost() {
        let mut k = test_kernel();
        let sid = k.sync_create(SyncFlags::PRIO | SyncFlags::PIP);
        let owner = spawn(&mut k, 10);
        let a = spawn(&mut k, 3);
        let b = spawn(&mut k, 4);
        k.sync_set_owner(sid, owner);
        k.sleep_on(sid, a, Timeout::Infinite).unwrap();
        k.sleep_on(sid, b, Timeout::Infinite).unwrap();
        // Raising a past b moves it to the head and re-boosts the
        // owner to the new top waiter.
        k.thread_set_priority(a, 42).unwrap();
        assert_eq!(k.eff_prio(owner), 42);
        assert_eq!(k.sync_wakeup_one(sid), Ok(Some(a)));
        assert_eq!(k.sync_wakeup_one(sid), Ok(Some(b)));
    }

    #[test]
    fn test_nested_inheritance_chain() {
        // owner_a owns S1 and pends on S2 owned by owner_b; a high
        // waiter on S1 must boost both owners transitively.
        let mut k = test_kernel();
        let s1 = k.sync_create(SyncFlags::PRIO | SyncFlags::PIP);
        let s2 = k.sync_create(SyncFlags::PRIO | SyncFlags::PIP);
        let owner_a = spawn(&mut k, 10);
        let owner_b = spawn(&mut k, 5);
        let hot = spawn(&mut k, 80);
        k.sync_set_owner(s1, owner_a);
        k.sync_set_owner(s2, owner_b);
        k.sleep_on(s2, owner_a, Timeout::Infinite).unwrap();
        k.sleep_on(s1, hot, Timeout::Infinite).unwrap();
        assert!(k.eff_prio(owner_a) >= 80);
        assert!(k.eff_prio(owner_b) >= 80);
        // Waiter leaves: both revert.
        k.thread_unblock(hot).unwrap();
        assert_eq!(k.eff_prio(owner_a), 10);
        assert_eq!(k.eff_prio(owner_b), 10);
    }
}
