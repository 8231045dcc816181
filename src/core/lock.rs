//! The nucleus lock domain
//!
//! One lock protects every piece of nucleus state. It is acquired with
//! interrupts disabled on the local processor and held for short,
//! non-blocking critical sections only. There is no second lock
//! anywhere in the crate, which rules out lock-ordering deadlocks by
//! construction.
//!
//! Re-entering the lock on the processor that already holds it is a
//! programming defect of the caller and panics: continuing would
//! corrupt scheduling state.

use crate::hal::Hal;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::mutex::SpinMutex;

const NO_OWNER: usize = usize::MAX;

/// Interrupt-disabling lock wrapper around the nucleus state.
pub struct GlobalLock<T> {
    inner: SpinMutex<T>,
    owner_cpu: AtomicUsize,
}

impl<T> GlobalLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: SpinMutex::new(value),
            owner_cpu: AtomicUsize::new(NO_OWNER),
        }
    }

    /// Acquire the lock with interrupts masked.
    ///
    /// The returned guard restores the interrupt state on every exit
    /// path, including early returns and panics of the caller.
    pub fn lock<'a>(&'a self, hal: &'a dyn Hal) -> GlobalGuard<'a, T> {
        let irq_state = hal.irq_save();
        let cpu = hal.cpu_id();
        if self.owner_cpu.load(Ordering::Acquire) == cpu {
            panic!("nucleus lock re-entered on cpu {}", cpu);
        }
        let guard = self.inner.lock();
        self.owner_cpu.store(cpu, Ordering::Release);
        GlobalGuard {
            lock: self,
            guard: Some(guard),
            hal,
            irq_state,
        }
    }
}

/// Scoped acquisition of the nucleus lock.
pub struct GlobalGuard<'a, T> {
    lock: &'a GlobalLock<T>,
    guard: Option<spin::mutex::SpinMutexGuard<'a, T>>,
    hal: &'a dyn Hal,
    irq_state: usize,
}

impl<T> Deref for GlobalGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for GlobalGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for GlobalGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.owner_cpu.store(NO_OWNER, Ordering::Release);
        self.guard.take();
        self.hal.irq_restore(self.irq_state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::mock;

    #[test]
    fn test_lock_roundtrip() {
        let hal = mock::leak();
        let lock = GlobalLock::new(5u32);
        {
            let mut g = lock.lock(hal);
            *g += 1;
        }
        assert_eq!(*lock.lock(hal), 6);
    }

    #[test]
    #[should_panic(expected = "re-entered")]
    fn test_reentry_is_fatal() {
        let hal = mock::leak();
        let lock = GlobalLock::new(());
        let _g = lock.lock(hal);
        let _g2 = lock.lock(hal);
    }
}
