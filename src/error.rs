//! Error types for the tasking core.
//!
//! Recoverable failures are [`ThreadError`]s returned to the immediate
//! caller. Broken scheduler invariants are [`InvariantViolation`]s: they are
//! not errors, are never returned, and only ever reach
//! [`Platform::halt`](crate::arch::Platform::halt).

use core::fmt;

use thiserror::Error;

/// Recoverable thread-lifecycle failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ThreadError {
    /// The stack allocator, scheduler bookkeeping, or the id space ran out.
    #[error("out of memory")]
    OutOfMemory,

    /// Priority outside `0..=3`, zero stack size, or null entry point.
    #[error("invalid argument")]
    InvalidArgument,

    /// No live or pending-reclaim thread carries this id.
    #[error("no such thread")]
    NotFound,

    /// The scheduler has not been initialized yet.
    #[error("scheduler not initialized")]
    NotInitialized,

    /// The handle is not bound to a thread.
    #[error("handle is not open")]
    UnopenedHandle,

    /// The handle is already bound to a thread.
    #[error("handle is already open")]
    AlreadyOpen,

    /// The thread has terminated.
    #[error("thread died")]
    ThreadDied,

    /// The thread's current state does not allow the operation.
    #[error("operation not valid in the thread's current state")]
    InvalidState,
}

impl ThreadError {
    /// Numeric code reported to user mode by the syscall layer.
    ///
    /// Zero is reserved for success.
    pub const fn user_code(self) -> u32 {
        match self {
            ThreadError::NotFound => 1,
            ThreadError::InvalidArgument => 2,
            ThreadError::AlreadyOpen => 3,
            ThreadError::UnopenedHandle => 4,
            ThreadError::ThreadDied => 5,
            ThreadError::OutOfMemory => 6,
            ThreadError::NotInitialized => 7,
            ThreadError::InvalidState => 8,
        }
    }
}

/// Failure reported by a [`StackAllocator`](crate::memory::stack::StackAllocator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("stack allocation of {requested} bytes failed")]
pub struct AllocError {
    /// Number of bytes that could not be provided.
    pub requested: usize,
}

impl From<AllocError> for ThreadError {
    fn from(_: AllocError) -> Self {
        ThreadError::OutOfMemory
    }
}

/// Unrecoverable scheduler fault.
///
/// Deliberately does not implement `Error`: nothing may catch, map, or retry
/// it. The only consumer is the platform's halt routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvariantViolation {
    /// `initialize` ran a second time.
    DoubleInitialization,

    /// The idle thread's stack or context could not be established.
    IdleThreadUnavailable,

    /// A ready list holds an entry that cannot legally be there.
    ReadyListCorrupted {
        /// Tier whose list is broken.
        tier: usize,
        /// Slot index found in the list.
        slot: usize,
    },

    /// A context switch was attempted while interrupts were enabled.
    SwitchPrecondition,

    /// Thread exit was requested by the boot or idle context.
    ExitOutsideThread,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvariantViolation::DoubleInitialization => {
                write!(f, "scheduler initialized twice")
            }
            InvariantViolation::IdleThreadUnavailable => {
                write!(f, "idle thread could not be established")
            }
            InvariantViolation::ReadyListCorrupted { tier, slot } => {
                write!(f, "ready list {} corrupted at slot {}", tier, slot)
            }
            InvariantViolation::SwitchPrecondition => {
                write!(f, "context switch with interrupts enabled")
            }
            InvariantViolation::ExitOutsideThread => {
                write!(f, "thread exit outside a thread context")
            }
        }
    }
}
