//! Thread control block

use crate::config::MAX_BOOSTS;
use crate::core::sched::{Priority, ThreadInfo, ThreadMode, ThreadState};
use crate::core::sync::object::SyncId;
use crate::core::timer::TimerId;
use crate::core::WaitOutcome;
use alloc::string::String;

/// One priority boost inherited from an owned synchronization object
/// with pending higher-priority waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BoostSource {
    pub sync: SyncId,
    pub prio: Priority,
}

/// Saved context of a condition-variable wait, alive from the unlock
/// of the bound mutex until that mutex is reacquired.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CondWaitCtx {
    pub cond: crate::core::sync::cond::CondId,
    pub mutex: crate::core::sync::mutex::MutexId,
    /// Recursion count to restore on reacquisition
    pub saved_count: u32,
    /// Set once the condition wait itself has concluded; the thread is
    /// then blocked reacquiring the mutex.
    pub outcome: Option<WaitOutcome>,
}

/// Creation attributes.
#[derive(Debug, Clone)]
pub struct ThreadAttrs {
    pub name: String,
    pub priority: Priority,
    /// Stack budget the port should reserve, in bytes. Bookkeeping
    /// only: the nucleus does not allocate stacks.
    pub stack_size: usize,
    /// Save/restore FPU state across switches
    pub fpu: bool,
    /// Owning processor
    pub cpu: usize,
}

impl Default for ThreadAttrs {
    fn default() -> Self {
        Self {
            name: String::new(),
            priority: 0,
            stack_size: 8192,
            fpu: false,
            cpu: 0,
        }
    }
}

/// Schedulable unit.
#[derive(Debug)]
pub struct Thread {
    pub(crate) name: String,
    pub(crate) base_prio: Priority,
    pub(crate) state: ThreadState,
    pub(crate) info: ThreadInfo,
    pub(crate) mode: ThreadMode,
    pub(crate) cpu: usize,
    /// Remaining round-robin budget, in ticks
    pub(crate) time_slice: u32,
    /// Reload value for the budget; 0 disables slicing
    pub(crate) rr_quantum: u32,
    pub(crate) stack_size: usize,
    pub(crate) cancel_pending: bool,
    /// True once a pending cancellation may be acted on by the skin
    /// (set only while the thread holds the relevant mutex again).
    pub(crate) cancel_deliverable: bool,
    /// Inherited priorities, one per owned inheriting object
    pub(crate) boosts: heapless::Vec<BoostSource, MAX_BOOSTS>,
    /// Synchronization object this thread pends on, if any
    pub(crate) wait_on: Option<SyncId>,
    /// Per-thread timeout timer, armed by finite-timeout suspensions
    pub(crate) delay_timer: Option<TimerId>,
    /// Periodic release timer
    pub(crate) period_timer: Option<TimerId>,
    /// Releases that arrived while the thread was not waiting
    pub(crate) period_overruns: u64,
    /// Thread is inside wait-for-next-period
    pub(crate) waiting_period: bool,
    /// In-flight condition-variable wait, if any
    pub(crate) cond_wait: Option<CondWaitCtx>,
    /// Outcome of the most recently concluded wait
    pub(crate) wait_result: WaitOutcome,
}

impl Thread {
    pub(crate) fn new(attrs: &ThreadAttrs, rr_quantum: u32) -> Self {
        let mut mode = ThreadMode::empty();
        if attrs.fpu {
            mode.insert(ThreadMode::FPU);
        }
        if rr_quantum > 0 {
            mode.insert(ThreadMode::RRB);
        }
        Self {
            name: attrs.name.clone(),
            base_prio: attrs.priority,
            state: ThreadState::DORMANT,
            info: ThreadInfo::empty(),
            mode,
            cpu: attrs.cpu,
            time_slice: rr_quantum,
            rr_quantum,
            stack_size: attrs.stack_size,
            cancel_pending: false,
            cancel_deliverable: false,
            boosts: heapless::Vec::new(),
            wait_on: None,
            delay_timer: None,
            period_timer: None,
            period_overruns: 0,
            waiting_period: false,
            cond_wait: None,
            wait_result: WaitOutcome::Normal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stack budget the port reserved for this thread.
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    pub fn uses_fpu(&self) -> bool {
        self.mode.contains(ThreadMode::FPU)
    }

    /// Effective priority: base raised by every active boost source.
    pub fn effective_priority(&self) -> Priority {
        self.boosts
            .iter()
            .map(|b| b.prio)
            .fold(self.base_prio, Priority::max)
    }

    pub fn is_blocked(&self) -> bool {
        self.state.intersects(ThreadState::BLOCKED)
    }

    /// Eligible to occupy a processor.
    pub fn is_runnable(&self) -> bool {
        !self
            .state
            .intersects(ThreadState::BLOCKED | ThreadState::DORMANT | ThreadState::ZOMBIE)
    }

    /// Record or update the boost contributed by `sync`; removes it
    /// when `prio` is `None`.
    pub(crate) fn set_boost(&mut self, sync: SyncId, prio: Option<Priority>) {
        match (self.boosts.iter().position(|b| b.sync == sync), prio) {
            (Some(i), Some(p)) => self.boosts[i].prio = p,
            (Some(i), None) => {
                self.boosts.swap_remove(i);
            }
            (None, Some(p)) => {
                // Capacity overflow would mean more simultaneously
                // contested objects than MAX_BOOSTS; drop the lowest
                // rather than lose the new, likely-higher boost.
                if self.boosts.push(BoostSource { sync, prio: p }).is_err() {
                    if let Some((i, low)) = self
                        .boosts
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, b)| b.prio)
                        .map(|(i, b)| (i, b.prio))
                    {
                        if low < p {
                            self.boosts[i] = BoostSource { sync, prio: p };
                        }
                    }
                }
            }
            (None, None) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sync::object::SyncObject;
    use crate::core::sync::object::SyncFlags;
    use crate::utils::arena::Arena;

    fn sync_ids(n: usize) -> Vec<SyncId> {
        let mut arena: Arena<SyncObject> = Arena::new();
        (0..n)
            .map(|_| arena.insert(SyncObject::new(SyncFlags::PRIO)))
            .collect()
    }

    #[test]
    fn test_effective_priority_tracks_boosts() {
        let ids = sync_ids(2);
        let mut th = Thread::new(
            &ThreadAttrs {
                priority: 10,
                ..ThreadAttrs::default()
            },
            0,
        );
        assert_eq!(th.effective_priority(), 10);

        th.set_boost(ids[0], Some(90));
        assert_eq!(th.effective_priority(), 90);

        // Second simultaneous source; dropping the higher one falls
        // back to the next level, not to base.
        th.set_boost(ids[1], Some(50));
        th.set_boost(ids[0], None);
        assert_eq!(th.effective_priority(), 50);

        th.set_boost(ids[1], None);
        assert_eq!(th.effective_priority(), 10);
    }

    #[test]
    fn test_boost_update_in_place() {
        let ids = sync_ids(1);
        let mut th = Thread::new(&ThreadAttrs::default(), 0);
        th.set_boost(ids[0], Some(5));
        th.set_boost(ids[0], Some(8));
        assert_eq!(th.boosts.len(), 1);
        assert_eq!(th.effective_priority(), 8);
    }
}
