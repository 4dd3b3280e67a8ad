//! x86_64 implementation of the task-switch boundary.
//!
//! A thread's saved context is a pointer to the resume frame the interrupt
//! trampoline pushed on its stack. Switching means remembering the
//! interrupted frame for the outgoing thread and handing the incoming
//! thread's frame back to the trampoline, which pops it and `iretq`s.

pub mod cpu;
pub mod frame;

#[cfg(target_os = "none")]
pub(crate) mod trampoline;

use crate::arch::{AddressSpace, Platform, SwitchDescriptor, ThreadStacks, ThreadStart};
use crate::error::InvariantViolation;
use crate::sync::critical::InterruptControl;
use crate::thread::EntryPoint;

use self::frame::SavedRegisters;

/// Vector the PIT timer is remapped to.
pub const TIMER_VECTOR: u8 = 0x20;
pub use self::cpu::YIELD_VECTOR;

/// Saved state of one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct X86Context {
    /// Resume frame on the thread's stack.
    pub frame: *mut SavedRegisters,
    /// Programmed into TSS.RSP0 before resuming a user thread.
    pub kernel_stack_top: u64,
    pub usermode: bool,
}

// SAFETY:
// - `frame` points into a stack owned by the same control block and is only
//   dereferenced by the trampoline of the CPU that resumes the thread.
unsafe impl Send for X86Context {}

/// Hardware hooks owned by boot-time bring-up (paging, GDT/TSS).
///
/// This isolates MMU/TSS details from the switch logic and makes them
/// replaceable in tests.
#[derive(Clone, Copy)]
pub struct ArchCallbacks {
    /// Returns the active address-space root.
    pub read_cr3: fn() -> u64,
    /// Switches the CPU to address space `cr3`.
    pub write_cr3: unsafe fn(u64),
    /// Programs TSS.RSP0 before resuming a user-mode thread.
    pub set_kernel_rsp0: fn(u64),
    /// Raises the yield vector.
    pub raise_yield: fn(),
}

unsafe fn default_write_cr3(cr3: u64) {
    cpu::write_cr3(cr3);
}

fn default_set_kernel_rsp0(_rsp0: u64) {}

impl ArchCallbacks {
    /// CR3 and yield through the real instructions; RSP0 updates are
    /// dropped until a TSS hook is supplied via [`with_set_kernel_rsp0`](Self::with_set_kernel_rsp0).
    pub const fn native() -> Self {
        Self {
            read_cr3: cpu::read_cr3,
            write_cr3: default_write_cr3,
            set_kernel_rsp0: default_set_kernel_rsp0,
            raise_yield: cpu::raise_yield,
        }
    }

    pub const fn with_set_kernel_rsp0(mut self, set_kernel_rsp0: fn(u64)) -> Self {
        self.set_kernel_rsp0 = set_kernel_rsp0;
        self
    }
}

extern "C" fn idle_loop(_userdata: usize) {
    loop {
        cpu::enable_and_halt();
    }
}

pub struct X86_64Platform {
    callbacks: ArchCallbacks,
    /// Where a kernel thread lands if its entry function returns.
    return_trap: usize,
}

impl X86_64Platform {
    pub const fn new(callbacks: ArchCallbacks, return_trap: usize) -> Self {
        Self {
            callbacks,
            return_trap,
        }
    }

    pub fn callbacks(&self) -> &ArchCallbacks {
        &self.callbacks
    }
}

impl InterruptControl for X86_64Platform {
    fn interrupts_enabled(&self) -> bool {
        cpu::interrupts_enabled()
    }

    fn disable_interrupts(&self) {
        cpu::disable_interrupts();
    }

    fn enable_interrupts(&self) {
        cpu::enable_interrupts();
    }
}

impl Platform for X86_64Platform {
    type Frame = *mut SavedRegisters;
    type Context = X86Context;

    fn initial_context(&self, stacks: ThreadStacks<'_>, start: ThreadStart) -> X86Context {
        match (start.usermode, stacks.kernel_stack) {
            (true, Some(kernel_stack)) => X86Context {
                frame: frame::build_user_frame(stacks.stack, kernel_stack, start.entry, start.userdata),
                kernel_stack_top: kernel_stack.top() as u64,
                usermode: true,
            },
            _ => X86Context {
                frame: frame::build_kernel_frame(
                    stacks.stack,
                    start.entry,
                    start.userdata,
                    self.return_trap,
                ),
                kernel_stack_top: stacks.stack.top() as u64,
                usermode: false,
            },
        }
    }

    fn idle_entry(&self) -> EntryPoint {
        EntryPoint::function(idle_loop)
    }

    fn switch(&self, desc: SwitchDescriptor<'_, X86Context, *mut SavedRegisters>) -> *mut SavedRegisters {
        if let Some(save) = desc.save {
            save.frame = desc.interrupted;
        }

        if desc.restore.usermode {
            (self.callbacks.set_kernel_rsp0)(desc.restore.kernel_stack_top);
        }

        if let Some(space) = desc.address_space {
            // SAFETY:
            // - Address-space roots come from thread control blocks, which only
            //   ever hold the root that was active when they were created.
            // - The kernel half (this code and the stacks) is mapped in all of them.
            unsafe {
                (self.callbacks.write_cr3)(space.0);
            }
        }

        desc.restore.frame
    }

    fn current_address_space(&self) -> AddressSpace {
        AddressSpace((self.callbacks.read_cr3)())
    }

    fn request_reschedule(&self) {
        (self.callbacks.raise_yield)();
    }

    fn halt(&self, _violation: InvariantViolation) -> ! {
        cpu::halt_forever()
    }
}
