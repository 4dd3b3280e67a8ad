//! Per-thread control block.

use crate::arch::AddressSpace;
use crate::error::ThreadError;
use crate::memory::stack::StackRegion;
use crate::thread::{EntryPoint, Priority, ThreadId, ThreadInfo, ThreadState};

/// Scheduler bookkeeping for one thread.
///
/// `C` is the platform's saved-context type. The block exclusively owns its
/// stack regions until the reclaim pass hands them back to the allocator.
pub struct ThreadControlBlock<C> {
    pub id: ThreadId,
    pub priority: Priority,
    pub state: ThreadState,

    /// Saved register state; written on every switch away from this thread.
    pub context: C,

    /// Root of the address space this thread runs in. Owned by the process.
    pub address_space: AddressSpace,

    pub stack: StackRegion,

    /// Ring-0 stack entered on privilege transitions (user-mode threads only).
    pub kernel_stack: Option<StackRegion>,

    pub entry: EntryPoint,
    pub userdata: usize,
    pub usermode: bool,
    pub start_paused: bool,
    pub exit_code: u32,

    /// Most recent failed handle operation made by this thread.
    pub last_error: Option<ThreadError>,

    /// Tick at which a sleeping thread becomes runnable again.
    pub wake_at: Option<u64>,
}

impl<C> ThreadControlBlock<C> {
    /// Whether the thread sits in a ready list (queued or running).
    pub fn is_runnable(&self) -> bool {
        matches!(self.state, ThreadState::Ready | ThreadState::Running)
    }

    pub fn info(&self) -> ThreadInfo {
        ThreadInfo {
            id: self.id,
            priority: self.priority,
            state: self.state,
            entry: self.entry,
            userdata: self.userdata,
            usermode: self.usermode,
            start_paused: self.start_paused,
            address_space: self.address_space,
        }
    }

    /// Splits the block into the stack regions it owns.
    pub fn into_stacks(self) -> (StackRegion, Option<StackRegion>) {
        (self.stack, self.kernel_stack)
    }
}
