//! Register frames shared with the interrupt trampolines.

use core::mem::size_of;
use core::ptr;

use crate::memory::stack::StackRegion;
use crate::thread::EntryPoint;

pub const KERNEL_CODE_SELECTOR: u64 = 0x08;
pub const KERNEL_DATA_SELECTOR: u64 = 0x10;
pub const USER_CODE_SELECTOR: u64 = 0x1b;
pub const USER_DATA_SELECTOR: u64 = 0x23;

/// RFLAGS bit 1: Reserved bit (always 1 in x86_64).
pub const RFLAGS_RESERVED: u64 = 1 << 1;

/// RFLAGS bit 9: Interrupt Enable Flag.
pub const RFLAGS_IF: u64 = 1 << 9;

/// RFLAGS bits 12-13: I/O privilege level 3.
pub const RFLAGS_IOPL3: u64 = 3 << 12;

/// Initial RFLAGS of kernel threads: preemptible, IOPL 0.
pub const KERNEL_RFLAGS: u64 = RFLAGS_IF | RFLAGS_RESERVED;

/// Initial RFLAGS of user threads: preemptible, port I/O allowed.
pub const USER_RFLAGS: u64 = RFLAGS_IF | RFLAGS_RESERVED | RFLAGS_IOPL3;

/// Saved general-purpose register state as pushed by the IRQ trampolines.
///
/// Layout contract:
/// - Must match the push/pop order in the trampolines.
/// - Any change requires synchronized updates in assembly and tests.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SavedRegisters {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rax: u64,
}

/// Hardware interrupt return frame for `iretq` in 64-bit long mode.
///
/// `iretq` always pops all five values in IA-32e mode, with or without a
/// privilege change.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptStackFrame {
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// Bytes occupied by a complete resumable frame.
pub const RESUME_FRAME_SIZE: usize = size_of::<SavedRegisters>() + size_of::<InterruptStackFrame>();

#[inline]
const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Writes a fresh register frame plus `iret` frame ending just below `top`.
///
/// # Safety
///
/// `[top - RESUME_FRAME_SIZE, top)` must be writable and exclusively owned.
unsafe fn write_resume_frame(top: usize, regs: SavedRegisters, iret: InterruptStackFrame) -> *mut SavedRegisters {
    let frame_addr = top - RESUME_FRAME_SIZE;
    let frame_ptr = frame_addr as *mut SavedRegisters;
    let iret_ptr = (frame_addr + size_of::<SavedRegisters>()) as *mut InterruptStackFrame;

    ptr::write(frame_ptr, regs);
    ptr::write(iret_ptr, iret);
    frame_ptr
}

/// Builds the first frame of a kernel thread on `stack`.
///
/// The thread enters `entry(userdata)` with interrupts enabled and a
/// SysV-aligned stack whose return slot holds `return_trap`, so a thread
/// function that returns lands in scheduler-controlled termination.
pub fn build_kernel_frame(
    stack: &StackRegion,
    entry: EntryPoint,
    userdata: usize,
    return_trap: usize,
) -> *mut SavedRegisters {
    let entry_rsp = align_down(stack.top(), 16) - 8;
    debug_assert!(stack.contains(entry_rsp - RESUME_FRAME_SIZE, RESUME_FRAME_SIZE + 8));

    // SAFETY:
    // - `stack` owns at least one page, far more than the return slot plus
    //   one resume frame.
    // - The region is not yet visible to the scheduler, so nothing aliases it.
    unsafe {
        ptr::write(entry_rsp as *mut u64, return_trap as u64);

        write_resume_frame(
            entry_rsp,
            SavedRegisters {
                rdi: userdata as u64,
                ..SavedRegisters::default()
            },
            InterruptStackFrame {
                rip: entry.as_usize() as u64,
                cs: KERNEL_CODE_SELECTOR,
                rflags: KERNEL_RFLAGS,
                rsp: entry_rsp as u64,
                ss: KERNEL_DATA_SELECTOR,
            },
        )
    }
}

/// Builds the first frame of a user thread.
///
/// The resume frame lives on `kernel_stack` (which becomes TSS.RSP0 while the
/// thread runs); the `iretq` lands in ring 3 at `entry(userdata)` on
/// `user_stack`.
pub fn build_user_frame(
    user_stack: &StackRegion,
    kernel_stack: &StackRegion,
    entry: EntryPoint,
    userdata: usize,
) -> *mut SavedRegisters {
    let user_rsp = align_down(user_stack.top(), 16) - 8;
    let frame_top = align_down(kernel_stack.top(), 16);
    debug_assert!(kernel_stack.contains(frame_top - RESUME_FRAME_SIZE, RESUME_FRAME_SIZE));

    // SAFETY:
    // - `kernel_stack` owns at least one page and nothing else references it yet.
    unsafe {
        write_resume_frame(
            frame_top,
            SavedRegisters {
                rdi: userdata as u64,
                ..SavedRegisters::default()
            },
            InterruptStackFrame {
                rip: entry.as_usize() as u64,
                cs: USER_CODE_SELECTOR,
                rflags: USER_RFLAGS,
                rsp: user_rsp as u64,
                ss: USER_DATA_SELECTOR,
            },
        )
    }
}

/// Reads the `iret` frame stored directly behind `frame`.
///
/// # Safety
///
/// `frame` must point to a complete resume frame.
pub unsafe fn iret_frame(frame: *const SavedRegisters) -> InterruptStackFrame {
    let iret_ptr = (frame as usize + size_of::<SavedRegisters>()) as *const InterruptStackFrame;
    ptr::read(iret_ptr)
}
