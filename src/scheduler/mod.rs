//! Scheduler module facade.
//!
//! The scheduler is implemented in `tiered.rs` on top of the lock-protected
//! bookkeeping in `state.rs`, and re-exported here so `crate::scheduler::*`
//! call sites stay clean.

mod state;
mod tiered;

pub use tiered::{CurrentThread, Scheduler, SchedulerSnapshot};
