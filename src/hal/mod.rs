//! Hardware abstraction consumed by the nucleus
//!
//! The nucleus does not touch hardware directly. The platform port
//! hands it a [`Hal`] implementation providing the monotonic cycle
//! counter, one-shot alarm programming, and the interrupt masking
//! primitives backing the global lock.

/// Platform services the nucleus consumes.
///
/// Implementations must be safe to call from interrupt context; the
/// nucleus holds its global lock around every call except `cycles`.
pub trait Hal: Sync {
    /// Identifier of the processor executing the call.
    fn cpu_id(&self) -> usize;

    /// Monotonic hardware cycle counter (aperiodic mode clock source).
    fn cycles(&self) -> u64;

    /// Disable interrupts on the local processor, returning the state
    /// to pass back to [`Hal::irq_restore`].
    fn irq_save(&self) -> usize;

    /// Restore the interrupt state saved by [`Hal::irq_save`].
    fn irq_restore(&self, state: usize);

    /// Program the one-shot hardware alarm to fire in `delay` cycles.
    /// A `delay` of `u64::MAX` means "no outstanding timeout".
    fn program_alarm(&self, delay: u64);
}

#[cfg(test)]
pub mod mock {
    //! Deterministic HAL used by the test suites.

    use super::Hal;
    use alloc::boxed::Box;
    use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Software clock: the tests advance it by hand.
    pub struct MockHal {
        now: AtomicU64,
        pub alarms_programmed: AtomicUsize,
        pub last_alarm: AtomicU64,
    }

    impl MockHal {
        pub const fn new() -> Self {
            Self {
                now: AtomicU64::new(0),
                alarms_programmed: AtomicUsize::new(0),
                last_alarm: AtomicU64::new(u64::MAX),
            }
        }

        pub fn advance(&self, cycles: u64) {
            self.now.fetch_add(cycles, Ordering::Relaxed);
        }

        pub fn set(&self, now: u64) {
            self.now.store(now, Ordering::Relaxed);
        }
    }

    impl Hal for MockHal {
        fn cpu_id(&self) -> usize {
            0
        }

        fn cycles(&self) -> u64 {
            self.now.load(Ordering::Relaxed)
        }

        fn irq_save(&self) -> usize {
            0
        }

        fn irq_restore(&self, _state: usize) {}

        fn program_alarm(&self, delay: u64) {
            self.alarms_programmed.fetch_add(1, Ordering::Relaxed);
            self.last_alarm.store(delay, Ordering::Relaxed);
        }
    }

    /// Leak a fresh mock so tests can hold a `&'static` like a real port.
    pub fn leak() -> &'static MockHal {
        Box::leak(Box::new(MockHal::new()))
    }
}
