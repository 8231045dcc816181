//! Scheduler
//!
//! Per-processor priority scheduling: ready queues ordered by
//! effective priority with FIFO fairness among equals, thread state
//! transitions with composable block reasons, delayed wakeups through
//! the timer engine, and round-robin slicing.

pub mod scheduler;
pub mod thread;

pub use scheduler::{CpuState, SchedState};
pub use thread::{Thread, ThreadAttrs};

use crate::utils::arena::Handle;
use bitflags::bitflags;

/// Thread priority: signed, larger is more urgent.
pub type Priority = i32;

/// Handle to a [`Thread`].
pub type ThreadId = Handle<Thread>;

bitflags! {
    /// Thread state bits.
    ///
    /// READY and RUNNING are positional (in the ready queue / the
    /// processor's current thread). PEND, DELAY and SUSP are block
    /// reasons; any combination may be set, and the thread re-enters
    /// the ready queue only when all of them clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadState: u32 {
        /// Created but never started
        const DORMANT = 1 << 0;
        /// Linked in a ready queue
        const READY   = 1 << 1;
        /// Current thread of its processor
        const RUNNING = 1 << 2;
        /// Blocked on a synchronization object
        const PEND    = 1 << 3;
        /// Delayed until a timer fires
        const DELAY   = 1 << 4;
        /// Forcibly suspended
        const SUSP    = 1 << 5;
        /// Terminal; slot about to be reclaimed
        const ZOMBIE  = 1 << 6;
    }
}

impl ThreadState {
    /// All block reasons.
    pub const BLOCKED: ThreadState = ThreadState::PEND
        .union(ThreadState::DELAY)
        .union(ThreadState::SUSP);
}

bitflags! {
    /// Wakeup information bits, reset when a new wait begins.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadInfo: u32 {
        /// The wait's timeout fired
        const TIMEDOUT = 1 << 0;
        /// Forcibly unblocked
        const BROKEN = 1 << 1;
        /// The waited-on object was deleted
        const DELETED = 1 << 2;
    }
}

bitflags! {
    /// Thread mode bits, stable across waits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadMode: u32 {
        /// Thread uses the FPU; the switch path must save/restore it
        const FPU = 1 << 0;
        /// Round-robin slicing applies
        const RRB = 1 << 1;
    }
}
