#![cfg_attr(not(test), no_std)]

//! Ferrokern - A Rust real-time scheduling nucleus
//!
//! This library provides the execution core on top of which RTOS API
//! emulation layers ("skins") are built: a per-CPU priority scheduler,
//! a dual-mode timer engine (periodic tick wheel or aperiodic one-shot
//! queue), and priority-inheriting synchronization objects composed
//! into mutexes and condition variables.
//!
//! All nucleus state lives behind a single lock domain acquired with
//! interrupts disabled. Skins reach the nucleus through the [`Nucleus`]
//! facade; the platform port supplies a [`hal::Hal`] implementation.

extern crate alloc;

// Core modules
pub mod config;
pub mod utils;

// Hardware abstraction consumed from the platform port
pub mod hal;

// Core nucleus modules
pub mod core;

// Re-export key types for convenience
pub use crate::config::NucleusConfig;
pub use crate::core::nucleus::{HookEvent, Nucleus};
pub use crate::core::sched::{Priority, ThreadAttrs, ThreadId, ThreadInfo, ThreadState};
pub use crate::core::sync::cond::{ClockKind, CondAttr, CondId};
pub use crate::core::sync::mutex::{LockStatus, MutexAttr, MutexId};
pub use crate::core::sync::object::{SyncFlags, SyncId};
pub use crate::core::timer::{CatchUp, QueueKind, TimerAction, TimerId, TimingMode};
pub use crate::core::{Error, Result, Timeout, WaitOutcome};
pub use crate::hal::Hal;

/// Ferrokern version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
