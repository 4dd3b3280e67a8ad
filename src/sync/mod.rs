//! Synchronization primitives.

pub mod atomic_flag;
pub mod critical;
pub mod spinlock;
