//! The process-wide scheduler of a bare-metal x86_64 kernel.
//!
//! Owns the single [`Scheduler`] instance, routes the timer and yield
//! vectors into it, and offers the calls a running thread makes about
//! itself.

use log::info;
use spin::Once;

use crate::arch::x86_64::frame::SavedRegisters;
use crate::arch::x86_64::trampoline;
use crate::arch::x86_64::{ArchCallbacks, X86_64Platform, TIMER_VECTOR, YIELD_VECTOR};
use crate::config::SchedulerConfig;
use crate::error::ThreadError;
use crate::memory::stack::HeapStackAllocator;
use crate::scheduler::Scheduler;
use crate::thread::{ThreadHandle, ThreadId};

pub type KernelScheduler = Scheduler<X86_64Platform, HeapStackAllocator>;
pub type KernelThreadHandle = ThreadHandle<'static, X86_64Platform, HeapStackAllocator>;

/// Hooks into interrupt-controller and IDT bring-up, which live elsewhere.
#[derive(Clone, Copy)]
pub struct KernelHooks {
    pub arch: ArchCallbacks,
    /// Points IDT vector `vector` at `handler`.
    pub install_vector: fn(vector: u8, handler: usize),
    /// Acknowledges the timer interrupt at the interrupt controller.
    pub timer_eoi: fn(),
}

static SCHEDULER: Once<KernelScheduler> = Once::new();
static TIMER_EOI: Once<fn()> = Once::new();

/// Creates and initializes the scheduler, then wires the timer and yield vectors.
///
/// Interrupts must still be disabled. A second call halts the machine.
pub fn init(config: SchedulerConfig, hooks: KernelHooks) -> &'static KernelScheduler {
    let scheduler = SCHEDULER.call_once(|| {
        Scheduler::new(
            X86_64Platform::new(hooks.arch, thread_return_trap as usize),
            HeapStackAllocator::new(),
            config,
        )
    });
    TIMER_EOI.call_once(|| hooks.timer_eoi);

    scheduler.initialize();

    (hooks.install_vector)(TIMER_VECTOR, trampoline::timer_stub_address());
    (hooks.install_vector)(YIELD_VECTOR, trampoline::yield_stub_address());
    info!(
        target: "kernel",
        "scheduler vectors installed: timer {:#x}, yield {:#x}",
        TIMER_VECTOR,
        YIELD_VECTOR
    );

    scheduler
}

pub fn scheduler() -> Result<&'static KernelScheduler, ThreadError> {
    SCHEDULER.get().ok_or(ThreadError::NotInitialized)
}

/// Unbound handle on the kernel scheduler.
pub fn thread_handle() -> Result<KernelThreadHandle, ThreadError> {
    scheduler().map(ThreadHandle::new)
}

pub fn yield_now() {
    if let Ok(scheduler) = scheduler() {
        scheduler.yield_now();
    }
}

pub fn current_thread() -> Option<ThreadId> {
    scheduler().ok()?.current_thread()
}

pub fn sleep(ticks: u64) -> Result<(), ThreadError> {
    scheduler()?.sleep_current(ticks)
}

/// Terminates the calling thread. Never returns.
pub fn exit_thread(exit_code: u32) -> ! {
    match scheduler() {
        Ok(scheduler) => scheduler.exit_current(exit_code),
        Err(_) => crate::arch::x86_64::cpu::halt_forever(),
    }
}

extern "C" fn thread_return_trap() -> ! {
    exit_thread(0)
}

/// Called by both trampolines with the frame they pushed.
#[no_mangle]
extern "C" fn irq_rust_dispatch(vector: u8, frame: *mut SavedRegisters) -> *mut SavedRegisters {
    let Some(scheduler) = SCHEDULER.get() else {
        return frame;
    };

    match vector {
        TIMER_VECTOR => {
            let next = scheduler.tick(frame);
            if let Some(eoi) = TIMER_EOI.get() {
                eoi();
            }
            next
        }
        YIELD_VECTOR => scheduler.reschedule_yield(frame),
        _ => frame,
    }
}
