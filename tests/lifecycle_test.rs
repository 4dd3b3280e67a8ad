//! Thread lifecycle: termination and reclaim, creation failure, blocking,
//! and address-space switching.

mod common;

use common::{entry, expect_halt, open, spawn, spawn_with, started, TestHandle, KERNEL_SPACE};
use kaos_tasking::arch::AddressSpace;
use kaos_tasking::config::PAGE_SIZE;
use kaos_tasking::sync::critical::InterruptControl;
use kaos_tasking::{
    CurrentThread, EntryPoint, InvariantViolation, ThreadError, ThreadHandle, ThreadParams,
    ThreadState,
};

/// Contract: a thread that terminates itself is reclaimed only after the CPU
/// has left it.
/// Given: Threads A and B in the same tier, A running.
/// When: A is terminated, the scheduler switches to B, then runs another pass.
/// Then: A stays openable as Dead until the second pass frees its stack once.
#[test]
fn test_terminate_current_thread() {
    let sched = started();
    let a = spawn(&sched, 2);
    let b = spawn(&sched, 2);
    sched.tick(0);
    assert_eq!(sched.current_thread(), Some(a));
    let frees = sched.allocator().frees();

    open(&sched, a).terminate(7).expect("terminate succeeds");
    assert_eq!(sched.platform().reschedule_requests(), 1);

    let handle = open(&sched, a);
    assert_eq!(handle.state(), Ok(ThreadState::Dead));
    assert_eq!(handle.exit_code(), Ok(7));

    sched.reschedule_yield(0xa1);
    assert_eq!(sched.current_thread(), Some(b));
    assert_eq!(sched.allocator().frees(), frees, "A was still executing during that pass");
    let last = sched.platform().last_switch().expect("switched to B");
    assert!(!last.saved, "a dead thread's context is not saved");

    sched.tick(0xb1);
    assert_eq!(sched.allocator().frees(), frees + 1);
    assert!(sched.snapshot().dead.is_empty());
    assert_eq!(handle.state(), Err(ThreadError::NotFound));

    sched.tick(0xb2);
    sched.tick(0xb3);
    assert_eq!(sched.allocator().frees(), frees + 1, "stacks are freed exactly once");
}

/// Contract: terminating another thread unlinks it at once and frees it on
/// the next pass.
#[test]
fn test_terminate_other_thread() {
    let sched = started();
    let a = spawn(&sched, 2);
    let b = spawn(&sched, 2);

    open(&sched, b).terminate(1).expect("terminate succeeds");
    let snapshot = sched.snapshot();
    assert_eq!(snapshot.ready[2], vec![a]);
    assert_eq!(snapshot.dead, vec![b]);
    assert_eq!(sched.platform().reschedule_requests(), 0);

    let frees = sched.allocator().frees();
    sched.tick(0);
    assert_eq!(sched.allocator().frees(), frees + 1);
    assert!(sched.snapshot().dead.is_empty());
    assert_eq!(sched.current_thread(), Some(a));
}

/// Contract: a user-mode thread returns both of its stacks on reclaim.
#[test]
fn test_reclaim_user_thread_frees_both_stacks() {
    let sched = started();
    let id = spawn_with(
        &sched,
        ThreadParams::new(EntryPoint::address(0x40_0000)).usermode(true),
    );
    let live = sched.allocator().live();

    open(&sched, id).terminate(0).expect("terminate succeeds");
    sched.tick(0);

    assert_eq!(sched.allocator().live(), live - 2);
}

/// Contract: ids are never reused, even when storage is.
#[test]
fn test_ids_not_reused_after_reclaim() {
    let sched = started();
    let a = spawn(&sched, 2);
    open(&sched, a).terminate(0).expect("terminate succeeds");
    sched.tick(0);

    let b = spawn(&sched, 2);

    assert!(b > a);
    let mut handle: TestHandle = ThreadHandle::new(&sched);
    assert_eq!(handle.open(a), Err(ThreadError::NotFound));
}

/// Contract: a failed stack allocation leaves no trace.
/// Given: An allocator with no successful allocations left.
/// When: A thread is created.
/// Then: `OutOfMemory`; no id consumed, nothing queued, nothing leaked.
#[test]
fn test_create_allocation_failure_leaves_no_trace() {
    let sched = started();
    let before = sched.snapshot();
    sched.allocator().fail_after(0);

    let mut handle: TestHandle = ThreadHandle::new(&sched);
    assert_eq!(
        handle.create(&ThreadParams::new(entry())),
        Err(ThreadError::OutOfMemory)
    );

    assert!(!handle.is_open());
    assert_eq!(sched.snapshot(), before);
    assert_eq!(sched.allocator().live(), 1, "only the idle stack");
}

/// Contract: a refused availability pre-check fails before allocating.
#[test]
fn test_create_precheck_refused() {
    let sched = started();
    let allocations = sched.allocator().allocations();
    sched.allocator().refuse_precheck(true);

    let mut handle: TestHandle = ThreadHandle::new(&sched);
    assert_eq!(
        handle.create(&ThreadParams::new(entry())),
        Err(ThreadError::OutOfMemory)
    );
    assert_eq!(sched.allocator().allocations(), allocations);
}

/// Contract: when the kernel stack of a user thread cannot be allocated the
/// already allocated user stack is returned.
#[test]
fn test_create_user_thread_kernel_stack_failure() {
    let sched = started();
    let before = sched.snapshot();
    let frees = sched.allocator().frees();
    sched.allocator().fail_after(1);

    let mut handle: TestHandle = ThreadHandle::new(&sched);
    let result = handle.create_thread(1, PAGE_SIZE, EntryPoint::address(0x40_0000), 0, false, true);

    assert_eq!(result, Err(ThreadError::OutOfMemory));
    assert_eq!(sched.allocator().frees(), frees + 1);
    assert_eq!(sched.allocator().live(), 1);
    assert_eq!(sched.snapshot(), before);
}

/// Contract: blocked threads are skipped until woken, then rejoin at the tail.
#[test]
fn test_block_and_wake() {
    let sched = started();
    let a = spawn(&sched, 2);
    let b = spawn(&sched, 2);

    sched.block(a).expect("block succeeds");
    sched.block(a).expect("blocking twice is a no-op");
    assert_eq!(sched.snapshot().waiting, vec![a]);

    sched.tick(0);
    assert_eq!(sched.current_thread(), Some(b));

    sched.wake(a).expect("wake succeeds");
    sched.wake(a).expect("waking a ready thread is a no-op");
    assert_eq!(sched.snapshot().ready[2], vec![b, a]);
    assert!(sched.snapshot().waiting.is_empty());
}

/// Contract: paused threads are neither blocked nor woken.
#[test]
fn test_block_wake_paused_thread() {
    let sched = started();
    let id = spawn_with(&sched, ThreadParams::new(entry()).start_paused(true));

    assert_eq!(sched.block(id), Err(ThreadError::InvalidState));
    assert_eq!(sched.wake(id), Err(ThreadError::InvalidState));
    assert_eq!(sched.snapshot().paused, vec![id]);
}

/// Contract: blocking the running thread asks for a reschedule.
#[test]
fn test_block_current_requests_reschedule() {
    let sched = started();
    let id = spawn(&sched, 2);
    sched.tick(0);

    sched.block(id).expect("block succeeds");

    assert_eq!(sched.platform().reschedule_requests(), 1);
    sched.reschedule_yield(0);
    assert_eq!(sched.snapshot().current, CurrentThread::Idle);
}

/// Contract: waking a sleeper early cancels its deadline.
#[test]
fn test_wake_sleeping_thread_early() {
    let sched = started();
    let id = spawn(&sched, 2);
    sched.tick(0);
    sched.sleep_current(100).expect("sleep succeeds");
    sched.reschedule_yield(0);

    sched.wake(id).expect("wake succeeds");
    sched.tick(0);

    assert_eq!(sched.current_thread(), Some(id));
}

/// Contract: the current thread can retire itself exactly once.
#[test]
fn test_retire_current() {
    let sched = started();
    assert_eq!(sched.retire_current(0), Err(ThreadError::NotFound));

    let id = spawn(&sched, 2);
    sched.tick(0);

    assert_eq!(sched.retire_current(5), Ok(id));
    assert_eq!(sched.retire_current(6), Err(ThreadError::ThreadDied));
    assert_eq!(open(&sched, id).exit_code(), Ok(5));
    assert_eq!(sched.snapshot().dead, vec![id]);

    sched.reschedule_yield(0);
    assert_eq!(sched.snapshot().current, CurrentThread::Idle);
}

/// Contract: a retired thread cannot put itself back to sleep.
/// Given: Thread A running, then retired.
/// When: A calls `sleep_current` before the scheduler switches away.
/// Then: The call fails, A stays Dead on the dead list, and it is reclaimed
///       instead of being woken later.
#[test]
fn test_sleep_after_retire_rejected() {
    let sched = started();
    let a = spawn(&sched, 2);
    sched.tick(0);
    assert_eq!(sched.retire_current(9), Ok(a));
    let requests = sched.platform().reschedule_requests();

    assert_eq!(sched.sleep_current(1), Err(ThreadError::ThreadDied));

    let snapshot = sched.snapshot();
    assert_eq!(snapshot.dead, vec![a]);
    assert!(snapshot.waiting.is_empty());
    assert_eq!(open(&sched, a).state(), Ok(ThreadState::Dead));
    assert_eq!(sched.platform().reschedule_requests(), requests);

    let frees = sched.allocator().frees();
    sched.reschedule_yield(0);
    sched.tick(0);
    sched.tick(0);
    assert_eq!(sched.allocator().frees(), frees + 1);
    assert_eq!(sched.current_thread(), None);
    let mut handle: TestHandle = ThreadHandle::new(&sched);
    assert_eq!(handle.open(a), Err(ThreadError::NotFound));
}

/// Contract: exiting from the boot context halts.
#[test]
fn test_exit_from_boot_context_halts() {
    let sched = started();

    let violation = expect_halt(&sched, || {
        sched.exit_current(0);
    });

    assert_eq!(violation, InvariantViolation::ExitOutsideThread);
}

/// Contract: exiting from the idle thread halts.
#[test]
fn test_exit_from_idle_halts() {
    let sched = started();
    sched.reschedule_yield(0);
    assert_eq!(sched.snapshot().current, CurrentThread::Idle);

    let violation = expect_halt(&sched, || {
        sched.exit_current(0);
    });

    assert_eq!(violation, InvariantViolation::ExitOutsideThread);
}

/// Contract: reclaim returns stacks from the timer path with interrupts masked.
/// Given: Thread A terminated while B runs.
/// When: The next tick reclaims A.
/// Then: Every stack freed by that pass was freed with interrupts disabled,
///       and interrupts are enabled again afterwards.
#[test]
fn test_reclaim_frees_with_interrupts_masked() {
    let sched = started();
    let a = spawn(&sched, 2);
    let b = spawn(&sched, 2);
    sched.tick(0);
    sched.tick(0);
    assert_eq!(sched.current_thread(), Some(b));

    open(&sched, a).terminate(3).expect("terminate succeeds");
    let frees = sched.allocator().frees();
    let masked = sched.allocator().masked_frees();

    sched.tick(0);

    assert_eq!(sched.allocator().frees(), frees + 1);
    assert_eq!(sched.allocator().masked_frees(), masked + 1);
    assert!(sched.platform().interrupts_enabled());
}

/// Contract: the address space is switched only when it changes.
/// Given: A thread with its own address space and a kernel thread.
/// When: The scheduler moves user thread -> idle -> kernel thread.
/// Then: The switch carries the user space, then the kernel space, then nothing.
#[test]
fn test_address_space_switch() {
    let sched = started();
    let user_space = AddressSpace(0x2000);
    let u = spawn_with(
        &sched,
        ThreadParams::new(entry()).address_space(user_space),
    );

    sched.tick(0);
    assert_eq!(sched.current_thread(), Some(u));
    let to_user = sched.platform().last_switch().expect("switched");
    assert_eq!(to_user.address_space, Some(user_space));
    assert_eq!(sched.platform().active_address_space(), user_space);

    sched.block(u).expect("block succeeds");
    sched.reschedule_yield(0);
    let to_idle = sched.platform().last_switch().expect("switched");
    assert_eq!(to_idle.address_space, Some(KERNEL_SPACE));

    let k = spawn(&sched, 2);
    sched.tick(0);
    assert_eq!(sched.current_thread(), Some(k));
    let to_kernel = sched.platform().last_switch().expect("switched");
    assert_eq!(to_kernel.address_space, None, "same space, no reload");
    assert_eq!(sched.platform().active_address_space(), KERNEL_SPACE);
}
