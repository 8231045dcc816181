//! Mutex layer
//!
//! A recursive mutex over a priority-inheriting synchronization
//! object. Unlock hands ownership directly to the highest-priority
//! waiter, so a contended release is a strict priority-ordered
//! transfer with no re-acquisition race.

use crate::core::nucleus::Kernel;
use crate::core::sched::{ThreadId, ThreadState};
use crate::core::sync::object::{SyncFlags, SyncId};
use crate::core::{Error, Result, Timeout};
use crate::utils::arena::Handle;
use alloc::vec::Vec;

/// Handle to a [`Mutex`].
pub type MutexId = Handle<Mutex>;

/// Creation attributes.
#[derive(Debug, Clone, Copy)]
pub struct MutexAttr {
    /// Apply the priority-inheritance protocol to the owner
    pub pip: bool,
}

impl Default for MutexAttr {
    fn default() -> Self {
        Self { pip: true }
    }
}

/// Recursive, priority-inheriting mutex.
pub struct Mutex {
    pub(crate) sync: SyncId,
    /// Recursion depth; 0 means unlocked
    pub(crate) count: u32,
    /// Condition variables currently bound to this mutex
    pub(crate) condvars: u32,
}

/// Immediate result of a lock attempt. A blocked caller owns the
/// mutex once it is next scheduled after the handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockStatus {
    Acquired,
    Blocked,
}

impl Kernel {
    pub(crate) fn mutex_create(&mut self, attr: &MutexAttr) -> MutexId {
        let mut flags = SyncFlags::PRIO;
        if attr.pip {
            flags.insert(SyncFlags::PIP);
        }
        let sync = self.sync_create(flags);
        self.mutexes.insert(Mutex {
            sync,
            count: 0,
            condvars: 0,
        })
    }

    /// Destroy an idle mutex. Owned, contended or condvar-bound
    /// mutexes are busy.
    pub(crate) fn mutex_destroy(&mut self, mid: MutexId) -> Result<()> {
        let m = self.mutexes.get(mid).ok_or(Error::InvalidHandle)?;
        let sid = m.sync;
        if m.condvars > 0 || self.sync_owner(sid)?.is_some() || self.sync_nsleepers(sid)? > 0 {
            return Err(Error::Busy);
        }
        self.sync_destroy(sid)?;
        self.mutexes.remove(mid);
        Ok(())
    }

    pub(crate) fn mutex_owner(&self, mid: MutexId) -> Result<Option<ThreadId>> {
        let m = self.mutexes.get(mid).ok_or(Error::InvalidHandle)?;
        self.sync_owner(m.sync)
    }

    pub(crate) fn mutex_count(&self, mid: MutexId) -> Result<u32> {
        self.mutexes
            .get(mid)
            .map(|m| m.count)
            .ok_or(Error::InvalidHandle)
    }

    /// Acquire, recursing if already owned by `tid`, blocking
    /// otherwise. The caller reschedules after a `Blocked` result.
    pub(crate) fn mutex_lock(
        &mut self,
        mid: MutexId,
        tid: ThreadId,
        timeout: Timeout,
    ) -> Result<LockStatus> {
        if !self.threads.contains(tid) {
            return Err(Error::InvalidHandle);
        }
        let m = self.mutexes.get(mid).ok_or(Error::InvalidHandle)?;
        let sid = m.sync;
        match self.sync_owner(sid)? {
            None => {
                self.sync_set_owner(sid, tid);
                self.mutexes.get_mut(mid).ok_or(Error::InvalidHandle)?.count = 1;
                Ok(LockStatus::Acquired)
            }
            Some(owner) if owner == tid => {
                self.mutexes.get_mut(mid).ok_or(Error::InvalidHandle)?.count += 1;
                Ok(LockStatus::Acquired)
            }
            Some(_) => {
                self.sleep_on(sid, tid, timeout)?;
                Ok(LockStatus::Blocked)
            }
        }
    }

    /// Release one recursion level; the last level transfers ownership
    /// to the next waiter. Returns whether a thread was woken.
    pub(crate) fn mutex_unlock(&mut self, mid: MutexId, tid: ThreadId) -> Result<bool> {
        let m = self.mutexes.get(mid).ok_or(Error::InvalidHandle)?;
        if self.sync_owner(m.sync)? != Some(tid) {
            return Err(Error::NotOwner);
        }
        let m = self.mutexes.get_mut(mid).ok_or(Error::InvalidHandle)?;
        m.count -= 1;
        if m.count > 0 {
            return Ok(false);
        }
        Ok(self.grant_next(mid))
    }

    /// Hand the mutex to the head waiter, or leave it free. The woken
    /// thread resumes already owning the mutex: either with a fresh
    /// recursion count of one, or, for a thread returning from a
    /// condition wait, with its saved count restored.
    pub(crate) fn grant_next(&mut self, mid: MutexId) -> bool {
        let Some(m) = self.mutexes.get(mid) else {
            return false;
        };
        let sid = m.sync;
        self.sync_clear_owner(sid);
        let Some(s) = self.syncs.get(sid) else {
            return false;
        };
        let Some(&next) = s.waiters.first() else {
            return false;
        };
        self.unlink_waiter(next);
        self.sync_set_owner(sid, next);

        let concluded = self
            .threads
            .get(next)
            .and_then(|t| t.cond_wait)
            .filter(|c| c.mutex == mid)
            .and_then(|c| c.outcome.map(|o| (c.saved_count, o)));
        if let Some((saved_count, outcome)) = concluded {
            if let Some(m) = self.mutexes.get_mut(mid) {
                m.count = saved_count;
            }
            self.finish_cond_wait(next, outcome);
        } else {
            if let Some(m) = self.mutexes.get_mut(mid) {
                m.count = 1;
            }
            self.resume_thread(next, ThreadState::PEND | ThreadState::DELAY);
        }
        true
    }

    /// Release every mutex `tid` owns, as part of deleting it.
    pub(crate) fn force_release_owned(&mut self, tid: ThreadId) {
        let owned: Vec<MutexId> = self
            .mutexes
            .iter()
            .filter(|(_, m)| {
                self.syncs
                    .get(m.sync)
                    .is_some_and(|s| s.owner == Some(tid))
            })
            .map(|(id, _)| id)
            .collect();
        for mid in owned {
            if let Some(m) = self.mutexes.get_mut(mid) {
                m.count = 0;
            }
            self.grant_next(mid);
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::core::nucleus::test::{spawn, test_kernel};
    use crate::core::sync::mutex::{LockStatus, MutexAttr};
    use crate::core::{Error, Timeout, WaitOutcome};

    #[test]
    fn test_lock_unlock_uncontended() {
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let t = spawn(&mut k, 5);
        assert_eq!(k.mutex_lock(m, t, Timeout::Infinite), Ok(LockStatus::Acquired));
        assert_eq!(k.mutex_owner(m), Ok(Some(t)));
        assert_eq!(k.mutex_unlock(m, t), Ok(false));
        assert_eq!(k.mutex_owner(m), Ok(None));
    }

    #[test]
    fn test_recursive_lock_counts() {
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let t = spawn(&mut k, 5);
        k.mutex_lock(m, t, Timeout::Infinite).unwrap();
        k.mutex_lock(m, t, Timeout::Infinite).unwrap();
        assert_eq!(k.mutex_count(m), Ok(2));
        assert_eq!(k.mutex_unlock(m, t), Ok(false));
        assert_eq!(k.mutex_owner(m), Ok(Some(t)));
        assert_eq!(k.mutex_unlock(m, t), Ok(false));
        assert_eq!(k.mutex_owner(m), Ok(None));
    }

    #[test]
    fn test_unlock_by_non_owner_rejected() {
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let a = spawn(&mut k, 5);
        let b = spawn(&mut k, 5);
        k.mutex_lock(m, a, Timeout::Infinite).unwrap();
        assert_eq!(k.mutex_unlock(m, b), Err(Error::NotOwner));
        assert_eq!(k.mutex_owner(m), Ok(Some(a)));
    }

    #[test]
    fn test_priority_ordered_handoff() {
        // Three waiters of priority 1, 5, 9 against a priority-1
        // holder: each release hands the mutex to the highest waiter.
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let holder = spawn(&mut k, 1);
        let w1 = spawn(&mut k, 1);
        let w5 = spawn(&mut k, 5);
        let w9 = spawn(&mut k, 9);
        k.mutex_lock(m, holder, Timeout::Infinite).unwrap();
        for w in [w1, w5, w9] {
            assert_eq!(k.mutex_lock(m, w, Timeout::Infinite), Ok(LockStatus::Blocked));
        }
        assert_eq!(k.mutex_unlock(m, holder), Ok(true));
        assert_eq!(k.mutex_owner(m), Ok(Some(w9)));
        assert_eq!(k.mutex_unlock(m, w9), Ok(true));
        assert_eq!(k.mutex_owner(m), Ok(Some(w5)));
        assert_eq!(k.mutex_unlock(m, w5), Ok(true));
        assert_eq!(k.mutex_owner(m), Ok(Some(w1)));
        assert_eq!(k.mutex_unlock(m, w1), Ok(false));
    }

    #[test]
    fn test_priority_inheritance_through_lock() {
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let owner = spawn(&mut k, 10);
        let hot = spawn(&mut k, 90);
        k.mutex_lock(m, owner, Timeout::Infinite).unwrap();
        k.mutex_lock(m, hot, Timeout::Infinite).unwrap();
        assert!(k.eff_prio(owner) >= 90);
        k.mutex_unlock(m, owner).unwrap();
        assert_eq!(k.eff_prio(owner), 10);
        assert_eq!(k.mutex_owner(m), Ok(Some(hot)));
    }

    #[test]
    fn test_timed_lock_expiry_leaves_queue() {
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let owner = spawn(&mut k, 5);
        let w = spawn(&mut k, 5);
        k.mutex_lock(m, owner, Timeout::Infinite).unwrap();
        assert_eq!(k.mutex_lock(m, w, Timeout::Rel(10)), Ok(LockStatus::Blocked));
        k.test_advance_and_fire(10);
        assert_eq!(k.thread_wait_result(w), Ok(WaitOutcome::TimedOut));
        // Release now finds no waiter.
        assert_eq!(k.mutex_unlock(m, owner), Ok(false));
        assert_eq!(k.mutex_owner(m), Ok(None));
    }

    #[test]
    fn test_destroy_busy_cases() {
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let t = spawn(&mut k, 5);
        k.mutex_lock(m, t, Timeout::Infinite).unwrap();
        assert_eq!(k.mutex_destroy(m), Err(Error::Busy));
        k.mutex_unlock(m, t).unwrap();
        assert_eq!(k.mutex_destroy(m), Ok(()));
        assert_eq!(k.mutex_lock(m, t, Timeout::Infinite), Err(Error::InvalidHandle));
    }

    #[test]
    fn test_thread_delete_releases_owned_mutex() {
        let mut k = test_kernel();
        let m = k.mutex_create(&MutexAttr::default());
        let owner = spawn(&mut k, 5);
        let w = spawn(&mut k, 3);
        k.mutex_lock(m, owner, Timeout::Infinite).unwrap();
        k.mutex_lock(m, w, Timeout::Infinite).unwrap();
        k.thread_delete(owner).unwrap();
        assert_eq!(k.mutex_owner(m), Ok(Some(w)));
        assert_eq!(k.mutex_count(m), Ok(1));
    }
}
