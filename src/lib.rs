//! KAOS tasking core.
//!
//! Preemptive multitasking for a single-core kernel: a four-tier priority
//! scheduler, the task-switch boundary it drives, id-based thread handles,
//! and the atomic flag guarding it all from interrupt reentrancy.
//!
//! The scheduler is generic over a [`arch::Platform`] and a
//! [`memory::stack::StackAllocator`], so the same logic runs on bare metal
//! and under the host test harness.

#![no_std]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod error;
pub mod logging;
pub mod memory;
pub mod scheduler;
pub mod sync;
pub mod thread;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod kernel;

pub use config::SchedulerConfig;
pub use error::{AllocError, InvariantViolation, ThreadError};
pub use scheduler::{CurrentThread, Scheduler, SchedulerSnapshot};
pub use thread::{
    EntryPoint, Priority, ThreadHandle, ThreadId, ThreadIdAllocator, ThreadInfo, ThreadParams,
    ThreadState, ThreadStatus,
};
