//! Synchronization core
//!
//! The generic synchronization object (priority-ordered wait queue
//! with optional priority inheritance) and the mutex / condition
//! variable layer composed from it.

pub mod cond;
pub mod mutex;
pub mod object;

pub use cond::{ClockKind, CondAttr, CondVar};
pub use mutex::{LockStatus, Mutex, MutexAttr};
pub use object::{SyncFlags, SyncObject};
