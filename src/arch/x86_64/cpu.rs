//! Thin wrappers around privileged x86_64 instructions.

use core::arch::asm;

use super::frame::RFLAGS_IF;

/// Vector raised by [`raise_yield`].
pub const YIELD_VECTOR: u8 = 0x30;

/// Returns whether interrupts are currently enabled (IF flag set).
#[inline]
pub fn interrupts_enabled() -> bool {
    let rflags: u64;
    // SAFETY:
    // - Reading RFLAGS via pushfq/pop is safe and does not modify flags.
    unsafe {
        asm!("pushfq", "pop {}", out(reg) rflags, options(nomem, preserves_flags));
    }
    rflags & RFLAGS_IF != 0
}

/// Disable interrupts globally.
#[inline]
pub fn disable_interrupts() {
    // SAFETY:
    // - `cli` only masks interrupts; valid in ring 0.
    unsafe {
        asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enable interrupts globally.
#[inline]
pub fn enable_interrupts() {
    // SAFETY:
    // - `sti` only unmasks interrupts; valid in ring 0.
    unsafe {
        asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Enables interrupts and sleeps until the next one arrives.
#[inline]
pub fn enable_and_halt() {
    // SAFETY:
    // - `sti; hlt` is the canonical idle sequence; the interrupt shadow of
    //   `sti` guarantees no wakeup is lost between the two instructions.
    unsafe {
        asm!("sti", "hlt", options(nomem, nostack));
    }
}

/// Masks interrupts and halts forever.
pub fn halt_forever() -> ! {
    loop {
        // SAFETY:
        // - `cli; hlt` parks the CPU; only an NMI can resume it, after which
        //   the loop parks it again.
        unsafe {
            asm!("cli", "hlt", options(nomem, nostack));
        }
    }
}

/// Returns the current CR3 value.
#[inline]
pub fn read_cr3() -> u64 {
    let value: u64;
    // SAFETY:
    // - Reading CR3 has no side effects; valid in ring 0.
    unsafe {
        asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Loads `value` into CR3, switching the active address space.
///
/// # Safety
///
/// `value` must be the physical address of a valid PML4 that maps the
/// currently executing code and stack.
#[inline]
pub unsafe fn write_cr3(value: u64) {
    asm!("mov cr3, {}", in(reg) value, options(nostack, preserves_flags));
}

/// Raises the yield vector to force an immediate reschedule.
#[inline]
pub fn raise_yield() {
    // SAFETY:
    // - The yield vector is installed with DPL 0 and enters the scheduler's
    //   yield path, which resumes this context later with all registers intact.
    unsafe {
        asm!("int {vector}", vector = const YIELD_VECTOR, options(nomem));
    }
}
