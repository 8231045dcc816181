//! Core nucleus modules
//!
//! This module contains the nucleus proper: the scheduler, the timer
//! engine, the synchronization core, and the mutex/condvar layer built
//! on top of them, all serialized by the single lock in [`lock`].

pub mod lock;
pub mod nucleus;
pub mod sched;
pub mod sync;
pub mod timer;

/// Core error type.
///
/// Usage errors and resource exhaustion are reported here; timing
/// outcomes (timeout, forced break, object deletion) are not errors
/// and travel as [`WaitOutcome`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Stale or never-valid object handle
    InvalidHandle,
    /// Object busy (destroy with waiters, mode switch with armed timers)
    Busy,
    /// Condition variable already bound to a different mutex
    BindingConflict,
    /// Caller does not own the mutex
    NotOwner,
    /// Out of arena or bookkeeping memory
    NoMemory,
    /// Timer requires the other timing mode
    WrongMode,
    /// Bounded timer heap is full
    QueueFull,
    /// Thread has no periodic release configured
    NotPeriodic,
}

/// Convenience alias used throughout the nucleus.
pub type Result<T> = core::result::Result<T, Error>;

/// How a concluded wait ended.
///
/// Exactly one of these is recorded per wait; a signal racing a timeout
/// resolves to a single outcome under the nucleus lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitOutcome {
    /// Woken by signal/handoff
    #[default]
    Normal,
    /// The wait's timeout fired first
    TimedOut,
    /// Forcibly unblocked
    Interrupted,
    /// The waited-on object was deleted
    Deleted,
}

/// How long a blocking operation may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait forever
    Infinite,
    /// Expire `ticks` from now (nucleus clock of the active mode)
    Rel(u64),
    /// Expire at an absolute nucleus clock value
    Abs(u64),
}

impl Timeout {
    /// Resolve to an absolute expiry key against `now`.
    pub fn deadline(self, now: u64) -> Option<u64> {
        match self {
            Timeout::Infinite => None,
            Timeout::Rel(t) => Some(now.saturating_add(t)),
            Timeout::Abs(t) => Some(t),
        }
    }
}
