//! Condition variable layer
//!
//! Implements the atomic "release mutex and wait, reacquire on wake"
//! protocol over one synchronization object per condition variable.
//! The binding between a condition variable and the mutex its waiters
//! name is dynamic: formed by the first waiter, dissolved when the
//! last one leaves, and a concurrent wait naming a different mutex is
//! rejected outright.
//!
//! A woken waiter always leaves the wait owning its mutex again, with
//! the recursion count it entered with, whatever concluded the wait
//! (signal, timeout or forced break). Pending cancellation becomes
//! deliverable only at that point, so cancellation cleanup observes
//! the mutex held.

use crate::core::nucleus::Kernel;
use crate::core::sched::thread::CondWaitCtx;
use crate::core::sched::{scheduler::classify, ThreadId, ThreadState};
use crate::core::sync::mutex::MutexId;
use crate::core::sync::object::{SyncFlags, SyncId};
use crate::core::{Error, Result, Timeout, WaitOutcome};
use crate::utils::arena::Handle;

/// Handle to a [`CondVar`].
pub type CondId = Handle<CondVar>;

/// Clock against which absolute timed-wait deadlines are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClockKind {
    /// The nucleus clock of the active timing mode
    #[default]
    Monotonic,
    /// Wall clock: nucleus clock shifted by the settable offset
    Realtime,
}

/// Creation attributes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CondAttr {
    pub clock: ClockKind,
}

/// Condition variable.
pub struct CondVar {
    pub(crate) sync: SyncId,
    /// Mutex bound by the current waiters, if any
    pub(crate) mutex: Option<MutexId>,
    pub(crate) clock: ClockKind,
}

impl Kernel {
    pub(crate) fn cond_create(&mut self, attr: &CondAttr) -> CondId {
        let sync = self.sync_create(SyncFlags::PRIO);
        self.conds.insert(CondVar {
            sync,
            mutex: None,
            clock: attr.clock,
        })
    }

    /// Destroy a condition variable nobody waits on.
    pub(crate) fn cond_destroy(&mut self, cid: CondId) -> Result<()> {
        let c = self.conds.get(cid).ok_or(Error::InvalidHandle)?;
        let sid = c.sync;
        if self.sync_nsleepers(sid)? > 0 {
            return Err(Error::Busy);
        }
        // A stale binding without waiters can only remain if waiters
        // left through deletion; drop it with the object.
        if let Some(mid) = self.conds.get(cid).and_then(|c| c.mutex) {
            if let Some(m) = self.mutexes.get_mut(mid) {
                m.condvars = m.condvars.saturating_sub(1);
            }
        }
        self.sync_destroy(sid)?;
        self.conds.remove(cid);
        Ok(())
    }

    /// Resolve a deadline read on the condvar's clock into the
    /// monotonic nucleus clock.
    fn cond_adjust_timeout(&self, cid: CondId, timeout: Timeout) -> Timeout {
        let Some(c) = self.conds.get(cid) else {
            return timeout;
        };
        match (c.clock, timeout) {
            (ClockKind::Realtime, Timeout::Abs(wall)) => {
                Timeout::Abs(wall.saturating_sub(self.wall_offset))
            }
            (_, other) => other,
        }
    }

    /// Atomically release `mid` and block `tid` on `cid`.
    ///
    /// The recursion count is saved and zeroed, ownership is handed to
    /// the next thread contending for the mutex itself (no reschedule
    /// yet), the binding is formed if this is the first waiter, and
    /// the caller then blocks. The caller triggers the reschedule.
    pub(crate) fn cond_wait(
        &mut self,
        cid: CondId,
        mid: MutexId,
        tid: ThreadId,
        timeout: Timeout,
    ) -> Result<()> {
        if !self.threads.contains(tid) {
            return Err(Error::InvalidHandle);
        }
        let c = self.conds.get(cid).ok_or(Error::InvalidHandle)?;
        if c.mutex.is_some_and(|m| m != mid) {
            return Err(Error::BindingConflict);
        }
        let sid = c.sync;
        let m = self.mutexes.get(mid).ok_or(Error::InvalidHandle)?;
        if self.sync_owner(m.sync)? != Some(tid) || m.count == 0 {
            return Err(Error::NotOwner);
        }

        // Save and zero the recursion count, then let ownership move
        // on. Suspension and the release happen under one critical
        // section, so no signal can slip between them.
        let saved_count = {
            let m = self.mutexes.get_mut(mid).ok_or(Error::InvalidHandle)?;
            let saved = m.count;
            m.count = 0;
            saved
        };
        self.grant_next(mid);

        if self.conds.get(cid).is_some_and(|c| c.mutex.is_none()) {
            if let Some(c) = self.conds.get_mut(cid) {
                c.mutex = Some(mid);
            }
            if let Some(m) = self.mutexes.get_mut(mid) {
                m.condvars += 1;
            }
        }

        if let Some(th) = self.threads.get_mut(tid) {
            th.cond_wait = Some(CondWaitCtx {
                cond: cid,
                mutex: mid,
                saved_count,
                outcome: None,
            });
        }
        let timeout = self.cond_adjust_timeout(cid, timeout);
        self.sleep_on(sid, tid, timeout)
    }

    /// Conclude a condition wait that just woke, still under the lock
    /// of whatever woke it: classify the outcome, dissolve the binding
    /// if this was the last waiter, and reacquire the mutex, possibly
    /// re-blocking on it.
    pub(crate) fn cond_conclude(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get(tid) else { return };
        let Some(mut ctx) = th.cond_wait else { return };
        let outcome = classify(th.info);
        ctx.outcome = Some(outcome);

        let delay_timer = th.delay_timer;
        self.unlink_waiter(tid);
        if let Some(timer) = delay_timer {
            let _ = self.engine.stop(&mut self.timers, timer);
        }
        if let Some(th) = self.threads.get_mut(tid) {
            th.state.remove(ThreadState::DELAY);
            th.cond_wait = Some(ctx);
        }

        // Last one out dissolves the binding.
        let cond_sync = self.conds.get(ctx.cond).map(|c| c.sync);
        let empty = cond_sync
            .and_then(|s| self.sync_nsleepers(s).ok())
            .map(|n| n == 0)
            .unwrap_or(true);
        if empty {
            if let Some(c) = self.conds.get_mut(ctx.cond) {
                if c.mutex == Some(ctx.mutex) {
                    c.mutex = None;
                    if let Some(m) = self.mutexes.get_mut(ctx.mutex) {
                        m.condvars = m.condvars.saturating_sub(1);
                    }
                }
            }
        }

        // Reacquire: immediately if free, else queue on the mutex with
        // no timeout. The recursion count is restored on handoff.
        let mutex_sync = self.mutexes.get(ctx.mutex).map(|m| m.sync);
        let Some(msid) = mutex_sync else {
            self.finish_cond_wait(tid, outcome);
            return;
        };
        let owner = self.sync_owner(msid).ok().flatten();
        if owner.is_none() {
            self.sync_set_owner(msid, tid);
            if let Some(m) = self.mutexes.get_mut(ctx.mutex) {
                m.count = ctx.saved_count;
            }
            self.finish_cond_wait(tid, outcome);
        } else {
            let _ = self.sleep_on(msid, tid, Timeout::Infinite);
        }
    }

    /// The wait is over and the mutex is held again: restore the
    /// caller-visible outcome and make any pending cancellation
    /// deliverable now, with the mutex held.
    pub(crate) fn finish_cond_wait(&mut self, tid: ThreadId, outcome: WaitOutcome) {
        let Some(th) = self.threads.get_mut(tid) else { return };
        th.cond_wait = None;
        if th.cancel_pending {
            th.cancel_deliverable = true;
        }
        self.resume_thread(tid, ThreadState::PEND | ThreadState::DELAY);
        if let Some(th) = self.threads.get_mut(tid) {
            th.wait_result = outcome;
        }
    }

    /// Drop a deleted thread out of any condition bookkeeping.
    pub(crate) fn cond_forget_waiter(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get(tid) else { return };
        let Some(ctx) = th.cond_wait else { return };
        if ctx.outcome.is_some() {
            return;
        }
        self.unlink_waiter(tid);
        let remaining = self
            .conds
            .get(ctx.cond)
            .map(|c| c.sync)
            .and_then(|s| self.sync_nsleepers(s).ok())
            .unwrap_or(0);
        if remaining == 0 {
            if let Some(c) = self.conds.get_mut(ctx.cond) {
                if c.mutex == Some(ctx.mutex) {
                    c.mutex = None;
                    if let Some(m) = self.mutexes.get_mut(ctx.mutex) {
                        m.condvars = m.condvars.saturating_sub(1);
                    }
                }
            }
        }
        if let Some(th) = self.threads.get_mut(tid) {
            th.cond_wait = None;
        }
    }

    /// Wake the highest-priority waiter, if any. Signalling an empty
    /// condition variable is a success no-op.
    pub(crate) fn cond_signal(&mut self, cid: CondId) -> Result<bool> {
        let c = self.conds.get(cid).ok_or(Error::InvalidHandle)?;
        let sid = c.sync;
        Ok(self.sync_wakeup_one(sid)?.is_some())
    }

    /// Wake every waiter.
    pub(crate) fn cond_broadcast(&mut self, cid: CondId) -> Result<bool> {
        let c = self.conds.get(cid).ok_or(Error::InvalidHandle)?;
        let sid = c.sync;
        self.sync_wakeup_all(sid)
    }
}
