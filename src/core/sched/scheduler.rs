//! Ready queues, state transitions and the reschedule point
//!
//! The scheduler owns one ready queue per processor, ordered by
//! effective priority with arrival order breaking ties. All methods
//! here run on the kernel state with the nucleus lock held; the
//! [`Kernel::schedule`] method is the single place a processor's
//! current thread changes.

use crate::core::nucleus::Kernel;
use crate::core::sched::{Priority, ThreadAttrs, ThreadId, ThreadInfo, ThreadMode, ThreadState};
use crate::core::sched::thread::Thread;
use crate::core::timer::{Timer, TimerAction, TIMER_HIPRIO};
use crate::core::{Error, Result, Timeout, WaitOutcome};
use alloc::vec::Vec;

/// Per-processor scheduling context.
pub struct CpuState {
    /// Ready queue: effective priority descending, FIFO within a class
    pub(crate) run: Vec<ThreadId>,
    /// Thread occupying this processor, if any
    pub(crate) current: Option<ThreadId>,
}

impl CpuState {
    fn new() -> Self {
        Self {
            run: Vec::new(),
            current: None,
        }
    }
}

/// Scheduler state across processors.
pub struct SchedState {
    pub(crate) cpus: Vec<CpuState>,
    pub(crate) switches: u64,
}

impl SchedState {
    pub(crate) fn new(num_cpus: usize) -> Self {
        let mut cpus = Vec::with_capacity(num_cpus);
        cpus.resize_with(num_cpus, CpuState::new);
        Self { cpus, switches: 0 }
    }
}

/// Map concluded-wait info bits to the outcome the waiter observes.
/// A forced break outranks a timeout that raced it.
pub(crate) fn classify(info: ThreadInfo) -> WaitOutcome {
    if info.contains(ThreadInfo::BROKEN) {
        WaitOutcome::Interrupted
    } else if info.contains(ThreadInfo::TIMEDOUT) {
        WaitOutcome::TimedOut
    } else if info.contains(ThreadInfo::DELETED) {
        WaitOutcome::Deleted
    } else {
        WaitOutcome::Normal
    }
}

impl Kernel {
    /// Effective priority of `tid`; stale handles sort last.
    pub(crate) fn eff_prio(&self, tid: ThreadId) -> Priority {
        self.threads
            .get(tid)
            .map(|t| t.effective_priority())
            .unwrap_or(Priority::MIN)
    }

    /// Nucleus clock for `cpu` in the active timing mode.
    pub(crate) fn now(&self, cpu: usize) -> u64 {
        self.engine.now(cpu, self.hal.cycles())
    }

    /// Admit `tid` behind its priority peers (arrival order, and the
    /// round-robin re-append point).
    pub(crate) fn enqueue_ready(&mut self, tid: ThreadId) {
        self.enqueue_ready_at(tid, false);
    }

    /// Re-admit a preempted thread ahead of its peers: it did not
    /// exhaust its slice and resumes before later arrivals.
    pub(crate) fn enqueue_ready_front(&mut self, tid: ThreadId) {
        self.enqueue_ready_at(tid, true);
    }

    fn enqueue_ready_at(&mut self, tid: ThreadId, front: bool) {
        let Some(th) = self.threads.get(tid) else { return };
        if th.state.contains(ThreadState::READY) {
            return;
        }
        let prio = th.effective_priority();
        let cpu = th.cpu;
        let threads = &self.threads;
        let run = &mut self.sched.cpus[cpu].run;
        let pos = run
            .iter()
            .position(|&t| {
                let p = threads
                    .get(t)
                    .map(|x| x.effective_priority())
                    .unwrap_or(Priority::MIN);
                if front {
                    p <= prio
                } else {
                    p < prio
                }
            })
            .unwrap_or(run.len());
        run.insert(pos, tid);
        if let Some(th) = self.threads.get_mut(tid) {
            th.state.insert(ThreadState::READY);
        }
    }

    pub(crate) fn remove_from_ready(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get_mut(tid) else { return };
        if !th.state.contains(ThreadState::READY) {
            return;
        }
        th.state.remove(ThreadState::READY);
        let cpu = th.cpu;
        let run = &mut self.sched.cpus[cpu].run;
        if let Some(pos) = run.iter().position(|&t| t == tid) {
            run.remove(pos);
        }
    }

    /// Head of the ready queue; ties cannot occur because insertion
    /// order disambiguates.
    pub(crate) fn pick_next(&self, cpu: usize) -> Option<ThreadId> {
        self.sched.cpus[cpu].run.first().copied()
    }

    /// Reposition `tid` after an effective-priority change, keeping
    /// whichever queue holds it sorted.
    pub(crate) fn reposition(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get(tid) else { return };
        if th.state.contains(ThreadState::READY) {
            self.remove_from_ready(tid);
            self.enqueue_ready(tid);
        } else if th.state.contains(ThreadState::PEND) {
            if let Some(sid) = th.wait_on {
                self.reorder_waiter(sid, tid);
            }
        }
    }

    /// The reschedule point. Decides what runs next on `cpu`, performs
    /// the logical switch and fires thread-switch hooks. Returns the
    /// new current thread.
    pub(crate) fn schedule(&mut self, cpu: usize) -> Option<ThreadId> {
        let cur = self.sched.cpus[cpu].current;
        let cur_ok = cur
            .and_then(|t| self.threads.get(t))
            .map(|t| t.is_runnable())
            .unwrap_or(false);
        let head = self.pick_next(cpu);

        let switch = match (cur.filter(|_| cur_ok), head) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(c), Some(h)) => self.eff_prio(h) > self.eff_prio(c),
        };
        if !switch {
            return cur;
        }

        // Preempted current keeps its slice and goes back in front of
        // its priority peers.
        if let Some(c) = cur {
            if let Some(th) = self.threads.get_mut(c) {
                th.state.remove(ThreadState::RUNNING);
            }
            if cur_ok {
                self.enqueue_ready_front(c);
            }
        }

        let next = self.pick_next(cpu);
        if let Some(n) = next {
            self.remove_from_ready(n);
            if let Some(th) = self.threads.get_mut(n) {
                th.state.insert(ThreadState::RUNNING);
            }
        }
        self.sched.cpus[cpu].current = next;
        if next != cur {
            self.sched.switches += 1;
            if let Some(n) = next {
                self.fire_switch_hooks(n);
            }
        }
        next
    }

    /// Remove `tid` from the running/ready set, tag it with the block
    /// reasons in `mask`, and arm the timeout timer when finite.
    pub(crate) fn suspend_thread(&mut self, tid: ThreadId, mask: ThreadState, timeout: Timeout) {
        let Some(th) = self.threads.get(tid) else { return };
        let cpu = th.cpu;
        let deadline = timeout.deadline(self.now(cpu));

        let Some(th) = self.threads.get_mut(tid) else { return };
        if !th.is_blocked() {
            // A fresh wait: stale info from the previous one must not
            // leak into its classification.
            th.info
                .remove(ThreadInfo::TIMEDOUT | ThreadInfo::BROKEN | ThreadInfo::DELETED);
        }
        th.state.insert(mask);
        if deadline.is_some() {
            th.state.insert(ThreadState::DELAY);
        }
        let delay_timer = th.delay_timer;
        if th.state.contains(ThreadState::READY) {
            self.remove_from_ready(tid);
        }
        if let (Some(d), Some(timer)) = (deadline, delay_timer) {
            let _ = self.engine.start(&mut self.timers, timer, d, 0);
            self.reprogram_alarm(cpu);
        }
    }

    /// Clear the block reasons in `mask`; the thread re-enters the
    /// ready queue once no reasons remain. Cancels the timeout timer
    /// and drops any wait-queue linkage tied to the cleared reasons.
    /// Returns whether the thread became ready.
    pub(crate) fn resume_thread(&mut self, tid: ThreadId, mask: ThreadState) -> bool {
        let Some(th) = self.threads.get(tid) else {
            return false;
        };
        let clearing = th.state & (mask & ThreadState::BLOCKED);
        if clearing.is_empty() {
            return false;
        }
        if clearing.contains(ThreadState::DELAY) {
            if let Some(timer) = th.delay_timer {
                let _ = self.engine.stop(&mut self.timers, timer);
            }
        }
        if clearing.contains(ThreadState::PEND) {
            self.unlink_waiter(tid);
        }
        let Some(th) = self.threads.get_mut(tid) else {
            return false;
        };
        th.state.remove(clearing);
        th.waiting_period &= !clearing.contains(ThreadState::DELAY);
        if th.is_blocked() || th.state.intersects(ThreadState::DORMANT | ThreadState::ZOMBIE) {
            return false;
        }
        if th.state.intersects(ThreadState::READY | ThreadState::RUNNING) {
            return false;
        }
        th.wait_result = classify(th.info);
        self.enqueue_ready(tid);
        true
    }

    /// The per-thread timeout timer fired.
    pub(crate) fn timeout_fired(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get_mut(tid) else { return };
        if !th.is_blocked() {
            return;
        }
        th.info.insert(ThreadInfo::TIMEDOUT);
        if th.state.contains(ThreadState::PEND) {
            self.wake_waiter(tid);
        } else {
            self.resume_thread(tid, ThreadState::DELAY);
        }
    }

    /// The periodic release timer fired.
    pub(crate) fn period_fired(&mut self, tid: ThreadId) {
        let Some(th) = self.threads.get_mut(tid) else { return };
        if th.waiting_period && th.state.contains(ThreadState::DELAY) {
            th.waiting_period = false;
            self.resume_thread(tid, ThreadState::DELAY);
        } else {
            // Released again before the thread came back to wait: an
            // overrun, reported by the next wait_period call.
            th.period_overruns += 1;
        }
    }

    fn perform_timer_action(&mut self, action: TimerAction) {
        match action {
            TimerAction::WakeDelay(tid) => self.timeout_fired(tid),
            TimerAction::WakePeriodic(tid) => self.period_fired(tid),
            TimerAction::Callback(f, cookie) => f(cookie),
        }
    }

    /// Pop and run every timer due at or before `now` on `cpu`, in
    /// total firing order.
    pub(crate) fn fire_due(&mut self, cpu: usize, now: u64) {
        while let Some(id) = self.engine.pop_due(&mut self.timers, cpu, now) {
            let Some(action) = self.timers.get(id).map(|t| t.action) else {
                continue;
            };
            self.perform_timer_action(action);
        }
    }

    /// Charge the running thread's round-robin budget for one tick.
    pub(crate) fn rr_tick(&mut self, cpu: usize) {
        let Some(cur) = self.sched.cpus[cpu].current else {
            return;
        };
        let Some(th) = self.threads.get_mut(cur) else {
            return;
        };
        if !th.mode.contains(ThreadMode::RRB) || !th.is_runnable() || th.rr_quantum == 0 {
            return;
        }
        th.time_slice = th.time_slice.saturating_sub(1);
        if th.time_slice == 0 {
            th.time_slice = th.rr_quantum;
            th.state.remove(ThreadState::RUNNING);
            self.sched.cpus[cpu].current = None;
            // Behind its peers: round-robin rotation.
            self.enqueue_ready(cur);
        }
    }

    // --- thread lifecycle ---------------------------------------------

    pub(crate) fn thread_create(&mut self, attrs: &ThreadAttrs) -> Result<ThreadId> {
        if attrs.cpu >= self.sched.cpus.len() {
            return Err(Error::InvalidHandle);
        }
        let rr = self.config.time_slice;
        let tid = self.threads.insert(Thread::new(attrs, rr));
        let timer = self
            .timers
            .insert(Timer::new(TimerAction::WakeDelay(tid), TIMER_HIPRIO, attrs.cpu));
        if let Some(th) = self.threads.get_mut(tid) {
            th.delay_timer = Some(timer);
        }
        log::debug!("thread {:?} ({}) created", tid, attrs.name);
        Ok(tid)
    }

    pub(crate) fn thread_start(&mut self, tid: ThreadId) -> Result<()> {
        let th = self.threads.get_mut(tid).ok_or(Error::InvalidHandle)?;
        if !th.state.contains(ThreadState::DORMANT) {
            return Err(Error::Busy);
        }
        th.state.remove(ThreadState::DORMANT);
        self.enqueue_ready(tid);
        Ok(())
    }

    pub(crate) fn thread_delete(&mut self, tid: ThreadId) -> Result<()> {
        if !self.threads.contains(tid) {
            return Err(Error::InvalidHandle);
        }
        // Ownership must not evaporate with the owner.
        self.force_release_owned(tid);
        self.cond_forget_waiter(tid);
        if self
            .threads
            .get(tid)
            .is_some_and(|t| t.state.contains(ThreadState::PEND))
        {
            self.unlink_waiter(tid);
        }
        self.remove_from_ready(tid);

        let Some(th) = self.threads.get_mut(tid) else {
            return Err(Error::InvalidHandle);
        };
        th.state.insert(ThreadState::ZOMBIE);
        let cpu = th.cpu;
        let timers = [th.delay_timer.take(), th.period_timer.take()];
        for timer in timers.into_iter().flatten() {
            let _ = self.engine.stop(&mut self.timers, timer);
            self.timers.remove(timer);
        }
        if self.sched.cpus[cpu].current == Some(tid) {
            self.sched.cpus[cpu].current = None;
        }
        self.fire_delete_hooks(tid);
        let name = self.threads.remove(tid).map(|t| t.name);
        log::debug!("thread {:?} ({:?}) deleted", tid, name);
        Ok(())
    }

    pub(crate) fn thread_set_priority(&mut self, tid: ThreadId, prio: Priority) -> Result<()> {
        let th = self.threads.get_mut(tid).ok_or(Error::InvalidHandle)?;
        th.base_prio = prio;
        self.requeue_and_propagate(tid);
        Ok(())
    }

    pub(crate) fn thread_suspend(&mut self, tid: ThreadId) -> Result<()> {
        if !self.threads.contains(tid) {
            return Err(Error::InvalidHandle);
        }
        self.suspend_thread(tid, ThreadState::SUSP, Timeout::Infinite);
        Ok(())
    }

    pub(crate) fn thread_resume(&mut self, tid: ThreadId) -> Result<()> {
        if !self.threads.contains(tid) {
            return Err(Error::InvalidHandle);
        }
        self.resume_thread(tid, ThreadState::SUSP);
        Ok(())
    }

    pub(crate) fn thread_sleep(&mut self, tid: ThreadId, timeout: Timeout) -> Result<()> {
        if !self.threads.contains(tid) {
            return Err(Error::InvalidHandle);
        }
        self.suspend_thread(tid, ThreadState::DELAY, timeout);
        Ok(())
    }

    /// Forcibly unblock: the wait concludes as Interrupted, distinct
    /// from both timeout and genuine wakeup.
    pub(crate) fn thread_unblock(&mut self, tid: ThreadId) -> Result<bool> {
        let th = self.threads.get_mut(tid).ok_or(Error::InvalidHandle)?;
        if th.state.contains(ThreadState::PEND) {
            // A concluded condition wait reacquiring its mutex is past
            // the point of interruption: ownership is already promised
            // and the saved recursion count must be restored.
            if th.cond_wait.is_some_and(|c| c.outcome.is_some()) {
                return Ok(false);
            }
            th.info.insert(ThreadInfo::BROKEN);
            self.wake_waiter(tid);
            Ok(true)
        } else if th.state.intersects(ThreadState::DELAY | ThreadState::SUSP) {
            th.info.insert(ThreadInfo::BROKEN);
            self.resume_thread(tid, ThreadState::DELAY | ThreadState::SUSP);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Mark a cancellation request. A blocked thread is forcibly
    /// woken; delivery is deferred until the thread holds its mutex
    /// again if it was inside a condition wait.
    pub(crate) fn thread_cancel(&mut self, tid: ThreadId) -> Result<()> {
        let th = self.threads.get_mut(tid).ok_or(Error::InvalidHandle)?;
        th.cancel_pending = true;
        if th.is_blocked() {
            self.thread_unblock(tid)?;
        }
        Ok(())
    }

    pub(crate) fn thread_set_periodic(
        &mut self,
        tid: ThreadId,
        start: Timeout,
        period: u64,
    ) -> Result<()> {
        let th = self.threads.get(tid).ok_or(Error::InvalidHandle)?;
        let cpu = th.cpu;
        if period == 0 {
            // Drop periodicity.
            if let Some(timer) = th.period_timer {
                self.engine.stop(&mut self.timers, timer)?;
            }
            if let Some(th) = self.threads.get_mut(tid) {
                th.period_overruns = 0;
            }
            return Ok(());
        }
        let timer = match th.period_timer {
            Some(t) => t,
            None => {
                let t = self.timers.insert(Timer::new(
                    TimerAction::WakePeriodic(tid),
                    TIMER_HIPRIO,
                    cpu,
                ));
                self.threads
                    .get_mut(tid)
                    .ok_or(Error::InvalidHandle)?
                    .period_timer = Some(t);
                t
            }
        };
        let now = self.now(cpu);
        let date = match start {
            Timeout::Infinite => now.saturating_add(period),
            Timeout::Rel(r) => now.saturating_add(r),
            Timeout::Abs(a) => a,
        };
        if let Some(th) = self.threads.get_mut(tid) {
            th.period_overruns = 0;
        }
        self.engine.start(&mut self.timers, timer, date, period)
    }

    /// Block until the next periodic release. Returns immediately with
    /// the number of missed releases if the thread overran.
    pub(crate) fn thread_wait_period(&mut self, tid: ThreadId) -> Result<u64> {
        let th = self.threads.get_mut(tid).ok_or(Error::InvalidHandle)?;
        let armed = th
            .period_timer
            .and_then(|t| self.timers.get(t))
            .is_some_and(|t| t.is_queued());
        if !armed {
            return Err(Error::NotPeriodic);
        }
        let th = self.threads.get_mut(tid).ok_or(Error::InvalidHandle)?;
        if th.period_overruns > 0 {
            let missed = th.period_overruns;
            th.period_overruns = 0;
            return Ok(missed);
        }
        th.waiting_period = true;
        self.suspend_thread(tid, ThreadState::DELAY, Timeout::Infinite);
        Ok(0)
    }

    /// Move a thread (and its timers) to another processor.
    pub(crate) fn thread_migrate(&mut self, tid: ThreadId, cpu: usize) -> Result<()> {
        if cpu >= self.sched.cpus.len() {
            return Err(Error::InvalidHandle);
        }
        let th = self.threads.get(tid).ok_or(Error::InvalidHandle)?;
        if th.state.contains(ThreadState::RUNNING) {
            return Err(Error::Busy);
        }
        let was_ready = th.state.contains(ThreadState::READY);
        let timers = [th.delay_timer, th.period_timer];
        if was_ready {
            self.remove_from_ready(tid);
        }
        if let Some(th) = self.threads.get_mut(tid) {
            th.cpu = cpu;
        }
        for timer in timers.into_iter().flatten() {
            self.engine.set_cpu(&mut self.timers, timer, cpu)?;
        }
        if was_ready {
            self.enqueue_ready(tid);
        }
        Ok(())
    }
}
