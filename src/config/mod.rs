//! Nucleus configuration
//!
//! Everything that is resolved once at start-of-day lives here: the
//! timing mode, the timer queue representation, the catch-up policy for
//! overdue periodic timers, and the static sizing limits.

use crate::core::timer::{CatchUp, QueueKind, TimingMode};

/// Number of buckets in the periodic timing wheel. Must be a power of two.
pub const WHEEL_SIZE: usize = 64;

/// Mask used to map an expiry key onto a wheel bucket.
pub const WHEEL_MASK: u64 = (WHEEL_SIZE as u64) - 1;

/// Capacity of the bounded timer heap (heap representation only).
pub const TIMER_HEAP_CAPACITY: usize = 256;

/// Maximum number of simultaneous priority-boost sources per thread.
///
/// One slot is consumed per inheriting object a thread owns while it has
/// waiters of higher priority.
pub const MAX_BOOSTS: usize = 8;

/// Default round-robin quantum, in ticks. 0 disables slicing.
pub const DEFAULT_TIME_SLICE: u32 = 10;

/// Nucleus-wide configuration, consumed once by [`crate::Nucleus::new`].
#[derive(Debug, Clone, Copy)]
pub struct NucleusConfig {
    /// Number of processors the scheduler manages.
    pub num_cpus: usize,
    /// Initial timing mode (periodic tick wheel vs aperiodic queue).
    pub timing_mode: TimingMode,
    /// Timer queue representation used in aperiodic mode.
    pub timer_queue: QueueKind,
    /// Catch-up policy applied to overdue periodic timers.
    pub catch_up: CatchUp,
    /// Round-robin quantum handed to new threads, in ticks.
    pub time_slice: u32,
}

impl Default for NucleusConfig {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            timing_mode: TimingMode::Aperiodic,
            timer_queue: QueueKind::List,
            catch_up: CatchUp::SkipToFuture,
            time_slice: DEFAULT_TIME_SLICE,
        }
    }
}
