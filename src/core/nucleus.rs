//! Kernel state and the locked facade
//!
//! [`Kernel`] aggregates every nucleus object table and subsystem; all
//! of its methods assume the nucleus lock is held. [`Nucleus`] is the
//! public facade: each entry point acquires the lock once, performs
//! the operation, triggers the reschedule where the operation may have
//! changed who should run, and returns.

use crate::config::NucleusConfig;
use crate::core::lock::GlobalLock;
use crate::core::sched::thread::Thread;
use crate::core::sched::{
    Priority, SchedState, ThreadAttrs, ThreadId, ThreadInfo, ThreadState,
};
use crate::core::sync::cond::{CondAttr, CondId, CondVar};
use crate::core::sync::mutex::{LockStatus, Mutex, MutexAttr, MutexId};
use crate::core::sync::object::{SyncFlags, SyncId, SyncObject};
use crate::core::timer::{
    Timer, TimerAction, TimerEngine, TimerId, TimingMode,
};
use crate::core::{Error, Result, Timeout, WaitOutcome};
use crate::hal::Hal;
use crate::utils::arena::Arena;
use alloc::vec::Vec;

/// Events external layers may subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    /// A thread was deleted; skins release per-thread bookkeeping here
    ThreadDelete,
    /// A processor switched to a new current thread
    ThreadSwitch,
}

/// Registered event callbacks.
#[derive(Default)]
pub(crate) struct HookRegistry {
    delete: Vec<fn(ThreadId)>,
    switch: Vec<fn(ThreadId)>,
}

/// All nucleus state; single-threaded under the nucleus lock.
pub struct Kernel {
    pub(crate) hal: &'static dyn Hal,
    pub(crate) config: NucleusConfig,
    pub(crate) threads: Arena<Thread>,
    pub(crate) timers: Arena<Timer>,
    pub(crate) syncs: Arena<SyncObject>,
    pub(crate) mutexes: Arena<Mutex>,
    pub(crate) conds: Arena<CondVar>,
    pub(crate) sched: SchedState,
    pub(crate) engine: TimerEngine,
    pub(crate) hooks: HookRegistry,
    /// Wall-clock minus nucleus-clock, for Realtime deadline reads
    pub(crate) wall_offset: u64,
}

impl Kernel {
    pub(crate) fn new(hal: &'static dyn Hal, config: NucleusConfig) -> Self {
        Self {
            hal,
            config,
            threads: Arena::new(),
            timers: Arena::new(),
            syncs: Arena::new(),
            mutexes: Arena::new(),
            conds: Arena::new(),
            sched: SchedState::new(config.num_cpus),
            engine: TimerEngine::new(&config),
            hooks: HookRegistry::default(),
            wall_offset: 0,
        }
    }

    pub(crate) fn add_hook(&mut self, event: HookEvent, hook: fn(ThreadId)) {
        let list = match event {
            HookEvent::ThreadDelete => &mut self.hooks.delete,
            HookEvent::ThreadSwitch => &mut self.hooks.switch,
        };
        if !list.contains(&hook) {
            list.push(hook);
        }
    }

    pub(crate) fn remove_hook(&mut self, event: HookEvent, hook: fn(ThreadId)) -> bool {
        let list = match event {
            HookEvent::ThreadDelete => &mut self.hooks.delete,
            HookEvent::ThreadSwitch => &mut self.hooks.switch,
        };
        if let Some(pos) = list.iter().position(|&h| h == hook) {
            list.remove(pos);
            true
        } else {
            false
        }
    }

    pub(crate) fn fire_delete_hooks(&mut self, tid: ThreadId) {
        for hook in self.hooks.delete.clone() {
            hook(tid);
        }
    }

    pub(crate) fn fire_switch_hooks(&mut self, tid: ThreadId) {
        for hook in self.hooks.switch.clone() {
            hook(tid);
        }
    }

    pub(crate) fn thread_wait_result(&self, tid: ThreadId) -> Result<WaitOutcome> {
        self.threads
            .get(tid)
            .map(|t| t.wait_result)
            .ok_or(Error::InvalidHandle)
    }

    /// Reschedule every processor. Facade operations run this after
    /// any state change that may alter who should run.
    pub(crate) fn reschedule_all(&mut self) {
        for cpu in 0..self.sched.cpus.len() {
            self.schedule(cpu);
        }
    }

    /// Keep the one-shot alarm tracking the earliest armed timer.
    pub(crate) fn reprogram_alarm(&mut self, cpu: usize) {
        if self.engine.mode() != TimingMode::Aperiodic {
            return;
        }
        let now = self.hal.cycles();
        let delay = self
            .engine
            .head_key(cpu)
            .map(|k| k.saturating_sub(now))
            .unwrap_or(u64::MAX);
        self.hal.program_alarm(delay);
    }
}

/// The nucleus facade handed to skins and the platform port.
///
/// Every method acquires the nucleus lock once with interrupts
/// disabled, so each call is one atomic critical section.
pub struct Nucleus {
    hal: &'static dyn Hal,
    kernel: GlobalLock<Kernel>,
}

impl Nucleus {
    pub fn new(hal: &'static dyn Hal, config: NucleusConfig) -> Self {
        log::info!(
            "nucleus starting: {} cpu(s), {:?} timing, {:?} timer queue",
            config.num_cpus,
            config.timing_mode,
            config.timer_queue
        );
        Self {
            hal,
            kernel: GlobalLock::new(Kernel::new(hal, config)),
        }
    }

    fn k(&self) -> crate::core::lock::GlobalGuard<'_, Kernel> {
        self.kernel.lock(self.hal)
    }

    // --- thread lifecycle ---------------------------------------------

    pub fn thread_create(&self, attrs: &ThreadAttrs) -> Result<ThreadId> {
        self.k().thread_create(attrs)
    }

    pub fn thread_start(&self, tid: ThreadId) -> Result<()> {
        let mut k = self.k();
        k.thread_start(tid)?;
        k.reschedule_all();
        Ok(())
    }

    pub fn thread_suspend(&self, tid: ThreadId) -> Result<()> {
        let mut k = self.k();
        k.thread_suspend(tid)?;
        k.reschedule_all();
        Ok(())
    }

    pub fn thread_resume(&self, tid: ThreadId) -> Result<()> {
        let mut k = self.k();
        k.thread_resume(tid)?;
        k.reschedule_all();
        Ok(())
    }

    /// Delay the calling thread; `Timeout::Infinite` sleeps until a
    /// forced unblock.
    pub fn thread_sleep(&self, tid: ThreadId, timeout: Timeout) -> Result<()> {
        let mut k = self.k();
        k.thread_sleep(tid, timeout)?;
        k.reschedule_all();
        Ok(())
    }

    pub fn thread_delete(&self, tid: ThreadId) -> Result<()> {
        let mut k = self.k();
        k.thread_delete(tid)?;
        k.reschedule_all();
        Ok(())
    }

    pub fn thread_unblock(&self, tid: ThreadId) -> Result<bool> {
        let mut k = self.k();
        let woken = k.thread_unblock(tid)?;
        if woken {
            k.reschedule_all();
        }
        Ok(woken)
    }

    pub fn thread_cancel(&self, tid: ThreadId) -> Result<()> {
        let mut k = self.k();
        k.thread_cancel(tid)?;
        k.reschedule_all();
        Ok(())
    }

    pub fn thread_set_priority(&self, tid: ThreadId, prio: Priority) -> Result<()> {
        let mut k = self.k();
        k.thread_set_priority(tid, prio)?;
        k.reschedule_all();
        Ok(())
    }

    pub fn thread_set_periodic(&self, tid: ThreadId, start: Timeout, period: u64) -> Result<()> {
        let mut k = self.k();
        let r = k.thread_set_periodic(tid, start, period);
        let cpu = k.threads.get(tid).map(|t| t.cpu).unwrap_or(0);
        k.reprogram_alarm(cpu);
        r
    }

    /// Wait for the next periodic release; returns immediately with
    /// the count of missed releases when overrun.
    pub fn thread_wait_period(&self, tid: ThreadId) -> Result<u64> {
        let mut k = self.k();
        let missed = k.thread_wait_period(tid)?;
        k.reschedule_all();
        Ok(missed)
    }

    pub fn thread_migrate(&self, tid: ThreadId, cpu: usize) -> Result<()> {
        let mut k = self.k();
        k.thread_migrate(tid, cpu)?;
        k.reschedule_all();
        Ok(())
    }

    // --- thread queries -----------------------------------------------

    pub fn thread_state(&self, tid: ThreadId) -> Result<ThreadState> {
        self.k()
            .threads
            .get(tid)
            .map(|t| t.state)
            .ok_or(Error::InvalidHandle)
    }

    /// Effective (possibly boosted) priority.
    pub fn thread_priority(&self, tid: ThreadId) -> Result<Priority> {
        self.k()
            .threads
            .get(tid)
            .map(|t| t.effective_priority())
            .ok_or(Error::InvalidHandle)
    }

    pub fn thread_wait_result(&self, tid: ThreadId) -> Result<WaitOutcome> {
        self.k().thread_wait_result(tid)
    }

    /// Whether a pending cancellation may be acted on now.
    pub fn thread_cancel_deliverable(&self, tid: ThreadId) -> Result<bool> {
        self.k()
            .threads
            .get(tid)
            .map(|t| t.cancel_deliverable)
            .ok_or(Error::InvalidHandle)
    }

    /// Current thread of `cpu`.
    pub fn current(&self, cpu: usize) -> Option<ThreadId> {
        self.k().sched.cpus.get(cpu).and_then(|c| c.current)
    }

    /// Context switches performed since start.
    pub fn context_switches(&self) -> u64 {
        self.k().sched.switches
    }

    // --- timers -------------------------------------------------------

    pub fn timer_create(&self, action: TimerAction, prio: i32, cpu: usize) -> TimerId {
        self.k().timers.insert(Timer::new(action, prio, cpu))
    }

    /// Create a timer usable only in one timing mode.
    pub fn timer_create_bound(
        &self,
        action: TimerAction,
        prio: i32,
        cpu: usize,
        mode: TimingMode,
    ) -> TimerId {
        let mut k = self.k();
        let mut timer = Timer::new(action, prio, cpu);
        timer.required_mode = Some(mode);
        k.timers.insert(timer)
    }

    pub fn timer_start(&self, id: TimerId, date: u64, interval: u64) -> Result<()> {
        let mut k = self.k();
        let k = &mut *k;
        k.engine.start(&mut k.timers, id, date, interval)?;
        let cpu = k.timers.get(id).map(|t| t.cpu).unwrap_or(0);
        k.reprogram_alarm(cpu);
        Ok(())
    }

    pub fn timer_stop(&self, id: TimerId) -> Result<()> {
        let mut k = self.k();
        let k = &mut *k;
        let cpu = k.timers.get(id).map(|t| t.cpu).unwrap_or(0);
        k.engine.stop(&mut k.timers, id)?;
        k.reprogram_alarm(cpu);
        Ok(())
    }

    pub fn timer_destroy(&self, id: TimerId) -> Result<()> {
        let mut k = self.k();
        let k = &mut *k;
        k.engine.stop(&mut k.timers, id)?;
        if let Some(t) = k.timers.get_mut(id) {
            t.status.insert(crate::core::timer::TimerStatus::KILLED);
        }
        k.timers.remove(id).ok_or(Error::InvalidHandle)?;
        Ok(())
    }

    /// Absolute expiry key; valid after `stop` until the next `start`.
    pub fn timer_get_date(&self, id: TimerId) -> Result<u64> {
        self.k()
            .timers
            .get(id)
            .map(|t| t.key)
            .ok_or(Error::InvalidHandle)
    }

    /// Ticks until expiry, measured on the timer's processor clock;
    /// answers from the preserved key when the timer is stopped.
    pub fn timer_get_timeout(&self, id: TimerId) -> Result<u64> {
        let k = self.k();
        let t = k.timers.get(id).ok_or(Error::InvalidHandle)?;
        let now = k.now(t.cpu);
        Ok(t.key.saturating_sub(now))
    }

    pub fn timing_mode(&self) -> TimingMode {
        self.k().engine.mode()
    }

    /// Whole-subsystem timing mode switch; refused while timers are
    /// armed.
    pub fn set_timing_mode(&self, mode: TimingMode) -> Result<()> {
        self.k().engine.set_mode(mode)
    }

    // --- interrupt-path entry points ----------------------------------

    /// Periodic tick interrupt: advance the wheel, fire due timers,
    /// charge the round-robin budget, then reschedule.
    pub fn clock_tick(&self, cpu: usize) {
        let mut k = self.k();
        let now = k.engine.advance_tick(cpu);
        k.fire_due(cpu, now);
        k.rr_tick(cpu);
        k.schedule(cpu);
    }

    /// One-shot alarm interrupt: fire due timers against the cycle
    /// counter, rearm the alarm, then reschedule.
    pub fn clock_event(&self, cpu: usize) {
        let mut k = self.k();
        let now = k.hal.cycles();
        k.fire_due(cpu, now);
        k.reprogram_alarm(cpu);
        k.schedule(cpu);
    }

    /// Explicit reschedule point for skins that batched state changes.
    pub fn reschedule(&self, cpu: usize) -> Option<ThreadId> {
        self.k().schedule(cpu)
    }

    // --- synchronization objects --------------------------------------

    pub fn sync_create(&self, flags: SyncFlags) -> SyncId {
        self.k().sync_create(flags)
    }

    pub fn sync_destroy(&self, sid: SyncId) -> Result<()> {
        self.k().sync_destroy(sid)
    }

    pub fn sync_sleep_on(&self, sid: SyncId, tid: ThreadId, timeout: Timeout) -> Result<()> {
        let mut k = self.k();
        k.sleep_on(sid, tid, timeout)?;
        k.reschedule_all();
        Ok(())
    }

    /// Wake the highest-priority waiter; the caller decides whether to
    /// reschedule.
    pub fn sync_wakeup_one(&self, sid: SyncId) -> Result<Option<ThreadId>> {
        self.k().sync_wakeup_one(sid)
    }

    pub fn sync_wakeup_all(&self, sid: SyncId) -> Result<bool> {
        self.k().sync_wakeup_all(sid)
    }

    /// Wake all waiters tagged with `reason`; returns whether a
    /// reschedule is warranted.
    pub fn sync_flush(&self, sid: SyncId, reason: ThreadInfo) -> Result<bool> {
        self.k().sync_flush(sid, reason)
    }

    pub fn sync_owner(&self, sid: SyncId) -> Result<Option<ThreadId>> {
        self.k().sync_owner(sid)
    }

    pub fn sync_nsleepers(&self, sid: SyncId) -> Result<usize> {
        self.k().sync_nsleepers(sid)
    }

    // --- mutex / condition variable -----------------------------------

    pub fn mutex_create(&self, attr: &MutexAttr) -> MutexId {
        self.k().mutex_create(attr)
    }

    pub fn mutex_destroy(&self, mid: MutexId) -> Result<()> {
        self.k().mutex_destroy(mid)
    }

    pub fn mutex_lock(&self, mid: MutexId, tid: ThreadId) -> Result<LockStatus> {
        self.mutex_timed_lock(mid, tid, Timeout::Infinite)
    }

    pub fn mutex_timed_lock(
        &self,
        mid: MutexId,
        tid: ThreadId,
        timeout: Timeout,
    ) -> Result<LockStatus> {
        let mut k = self.k();
        let status = k.mutex_lock(mid, tid, timeout)?;
        if status == LockStatus::Blocked {
            k.reschedule_all();
        }
        Ok(status)
    }

    pub fn mutex_unlock(&self, mid: MutexId, tid: ThreadId) -> Result<()> {
        let mut k = self.k();
        if k.mutex_unlock(mid, tid)? {
            k.reschedule_all();
        }
        Ok(())
    }

    pub fn mutex_owner(&self, mid: MutexId) -> Result<Option<ThreadId>> {
        self.k().mutex_owner(mid)
    }

    pub fn cond_create(&self, attr: &CondAttr) -> CondId {
        self.k().cond_create(attr)
    }

    pub fn cond_destroy(&self, cid: CondId) -> Result<()> {
        self.k().cond_destroy(cid)
    }

    pub fn cond_wait(&self, cid: CondId, mid: MutexId, tid: ThreadId) -> Result<()> {
        self.cond_timed_wait(cid, mid, tid, Timeout::Infinite)
    }

    pub fn cond_timed_wait(
        &self,
        cid: CondId,
        mid: MutexId,
        tid: ThreadId,
        timeout: Timeout,
    ) -> Result<()> {
        let mut k = self.k();
        k.cond_wait(cid, mid, tid, timeout)?;
        k.reschedule_all();
        Ok(())
    }

    pub fn cond_signal(&self, cid: CondId) -> Result<()> {
        let mut k = self.k();
        if k.cond_signal(cid)? {
            k.reschedule_all();
        }
        Ok(())
    }

    pub fn cond_broadcast(&self, cid: CondId) -> Result<()> {
        let mut k = self.k();
        if k.cond_broadcast(cid)? {
            k.reschedule_all();
        }
        Ok(())
    }

    // --- hooks & clocks -----------------------------------------------

    pub fn add_hook(&self, event: HookEvent, hook: fn(ThreadId)) {
        self.k().add_hook(event, hook)
    }

    pub fn remove_hook(&self, event: HookEvent, hook: fn(ThreadId)) -> bool {
        self.k().remove_hook(event, hook)
    }

    /// Offset added to the nucleus clock to obtain the wall clock,
    /// consumed by Realtime condvar deadlines.
    pub fn set_wall_offset(&self, offset: u64) {
        self.k().wall_offset = offset;
    }
}

#[cfg(test)]
pub(crate) mod test {
    //! Shared helpers for the kernel-level test suites.

    use super::*;
    use crate::hal::mock::{self, MockHal};
    use core::ops::{Deref, DerefMut};

    /// A kernel plus the mock clock driving it.
    pub(crate) struct TestKernel {
        pub kernel: Kernel,
        pub hal: &'static MockHal,
    }

    impl Deref for TestKernel {
        type Target = Kernel;

        fn deref(&self) -> &Kernel {
            &self.kernel
        }
    }

    impl DerefMut for TestKernel {
        fn deref_mut(&mut self) -> &mut Kernel {
            &mut self.kernel
        }
    }

    impl TestKernel {
        /// Move the clock forward and service due timers on cpu 0.
        pub fn test_advance_and_fire(&mut self, delta: u64) {
            self.hal.advance(delta);
            let now = self.hal.cycles();
            self.kernel.fire_due(0, now);
        }
    }

    pub(crate) fn test_kernel() -> TestKernel {
        let hal = mock::leak();
        TestKernel {
            kernel: Kernel::new(hal, NucleusConfig::default()),
            hal,
        }
    }

    /// Create and start a thread at `prio`.
    pub(crate) fn spawn(k: &mut TestKernel, prio: Priority) -> ThreadId {
        let tid = k
            .thread_create(&ThreadAttrs {
                priority: prio,
                ..ThreadAttrs::default()
            })
            .unwrap();
        k.thread_start(tid).unwrap();
        tid
    }
}
