//! Task-switch boundary between the scheduler and the CPU.
//!
//! The scheduler core never touches registers. Everything it needs from the
//! hardware goes through [`Platform`]; the saved per-thread state is the
//! platform's opaque [`Platform::Context`].

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

use crate::error::InvariantViolation;
use crate::memory::stack::StackRegion;
use crate::sync::critical::InterruptControl;
use crate::thread::EntryPoint;

/// Address-space root (CR3 on x86_64). Only referenced, never owned here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpace(pub u64);

/// Stack memory a new thread will start on.
#[derive(Clone, Copy)]
pub struct ThreadStacks<'a> {
    pub stack: &'a StackRegion,
    /// Ring-0 stack for user-mode threads.
    pub kernel_stack: Option<&'a StackRegion>,
}

/// Where and how a new thread begins executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStart {
    pub entry: EntryPoint,
    pub userdata: usize,
    pub usermode: bool,
}

/// One context switch, handed to [`Platform::switch`].
pub struct SwitchDescriptor<'a, C, F> {
    /// Frame the interrupt trampoline handed to the scheduler.
    pub interrupted: F,

    /// Save area of the outgoing thread. `None` when the outgoing context is
    /// abandoned (boot context or a thread that just died).
    pub save: Option<&'a mut C>,

    /// Context to resume.
    pub restore: &'a C,

    /// Address space to load, `None` if it is already active.
    pub address_space: Option<AddressSpace>,
}

/// Everything the scheduler needs from the CPU it runs on.
pub trait Platform: InterruptControl {
    /// What the interrupt trampoline passes in and resumes from.
    type Frame: Copy;

    /// Per-thread saved state.
    type Context: Send;

    /// Builds a context that starts at `start.entry(start.userdata)` on `stacks`.
    fn initial_context(&self, stacks: ThreadStacks<'_>, start: ThreadStart) -> Self::Context;

    /// Routine the idle thread runs when nothing else is ready.
    fn idle_entry(&self) -> EntryPoint;

    /// Saves `desc.interrupted` into `desc.save`, loads the new address
    /// space if any, and returns the frame to resume `desc.restore` from.
    ///
    /// Only ever called with interrupts disabled.
    fn switch(&self, desc: SwitchDescriptor<'_, Self::Context, Self::Frame>) -> Self::Frame;

    /// Address space active when the scheduler is initialized.
    fn current_address_space(&self) -> AddressSpace;

    /// Asks for a reschedule at the next opportunity (e.g. raise the yield vector).
    fn request_reschedule(&self);

    /// Stops the machine. Never returns.
    fn halt(&self, violation: InvariantViolation) -> !;
}
