//! Thread identity, priority, state, and creation parameters.

pub mod handle;
pub mod tcb;

use core::fmt;

use bitflags::bitflags;

use crate::arch::AddressSpace;
use crate::error::ThreadError;

pub use handle::ThreadHandle;

/// Number of priority tiers. Tier 0 is the most urgent.
pub const TIER_COUNT: usize = 4;

/// Monotonically assigned thread identifier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub u32);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Hands out strictly increasing thread ids until the id space runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadIdAllocator {
    next: Option<u32>,
}

impl ThreadIdAllocator {
    pub const fn new() -> Self {
        Self::starting_at(0)
    }

    pub const fn starting_at(first: u32) -> Self {
        Self { next: Some(first) }
    }

    /// Id the next [`allocate`](Self::allocate) returns; `None` once exhausted.
    pub const fn peek(&self) -> Option<ThreadId> {
        match self.next {
            Some(next) => Some(ThreadId(next)),
            None => None,
        }
    }

    /// Takes the next id. After `u32::MAX` has been handed out every call
    /// returns `None`; ids never wrap.
    pub fn allocate(&mut self) -> Option<ThreadId> {
        let id = self.next?;
        self.next = id.checked_add(1);
        Some(ThreadId(id))
    }
}

impl Default for ThreadIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling tier in `0..TIER_COUNT`; lower is more urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);

    pub const fn new(tier: u32) -> Result<Self, ThreadError> {
        if tier < TIER_COUNT as u32 {
            Ok(Priority(tier as u8))
        } else {
            Err(ThreadError::InvalidArgument)
        }
    }

    pub const fn tier(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u32> for Priority {
    type Error = ThreadError;

    fn try_from(tier: u32) -> Result<Self, Self::Error> {
        Priority::new(tier)
    }
}

/// Scheduler-visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Queued in its tier's ready list.
    Ready,

    /// Selected and executing. Still occupies its ready-list position.
    Running,

    /// Parked in the paused set until resumed.
    Paused,

    /// Parked in the waiting set until woken or its sleep deadline passes.
    Waiting,

    /// Terminated, stacks not yet reclaimed.
    Dead,
}

bitflags! {
    /// Status word reported to user mode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadStatus: u32 {
        const DEAD = 1;
        const CAN_RUN = 2;
        const BLOCKED = 4;
        const PAUSED = 8;
    }
}

impl From<ThreadState> for ThreadStatus {
    fn from(state: ThreadState) -> Self {
        match state {
            ThreadState::Ready | ThreadState::Running => ThreadStatus::CAN_RUN,
            ThreadState::Paused => ThreadStatus::PAUSED,
            ThreadState::Waiting => ThreadStatus::BLOCKED,
            ThreadState::Dead => ThreadStatus::DEAD,
        }
    }
}

/// Address of a thread's first instruction. Zero means "none".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPoint(usize);

impl EntryPoint {
    /// Entry point for a kernel function taking the thread's userdata word.
    pub fn function(f: extern "C" fn(usize)) -> Self {
        EntryPoint(f as usize)
    }

    /// Raw entry address, e.g. a user-mode RIP.
    pub const fn address(addr: usize) -> Self {
        EntryPoint(addr)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// Creation-time facts and current scheduling state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: ThreadId,
    pub priority: Priority,
    pub state: ThreadState,
    pub entry: EntryPoint,
    pub userdata: usize,
    pub usermode: bool,
    /// Whether the thread was created in the paused set.
    pub start_paused: bool,
    pub address_space: AddressSpace,
}

/// Everything needed to create a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadParams {
    pub priority: u32,
    pub stack_size: usize,
    pub entry: EntryPoint,
    pub userdata: usize,
    pub start_paused: bool,
    pub usermode: bool,
    /// Address space to run in; `None` inherits the creator's.
    pub address_space: Option<AddressSpace>,
}

impl ThreadParams {
    /// Kernel thread at [`Priority::NORMAL`] with one page of stack.
    pub const fn new(entry: EntryPoint) -> Self {
        Self {
            priority: Priority::NORMAL.0 as u32,
            stack_size: crate::config::PAGE_SIZE,
            entry,
            userdata: 0,
            start_paused: false,
            usermode: false,
            address_space: None,
        }
    }

    pub const fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub const fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub const fn userdata(mut self, userdata: usize) -> Self {
        self.userdata = userdata;
        self
    }

    pub const fn start_paused(mut self, paused: bool) -> Self {
        self.start_paused = paused;
        self
    }

    pub const fn usermode(mut self, usermode: bool) -> Self {
        self.usermode = usermode;
        self
    }

    pub const fn address_space(mut self, space: AddressSpace) -> Self {
        self.address_space = Some(space);
        self
    }

    /// Checks the argument contract without touching any scheduler state.
    pub(crate) fn validate(&self) -> Result<Priority, ThreadError> {
        let priority = Priority::new(self.priority)?;
        if self.stack_size == 0 || self.entry.is_null() {
            return Err(ThreadError::InvalidArgument);
        }
        Ok(priority)
    }
}
