//! Four-tier strict-priority scheduler with round robin inside each tier.
//!
//! Tier 0 always wins. Within the first non-empty tier the head of the list
//! runs; on every quantum the running thread rotates to that tier's tail.
//! When every tier is empty the idle thread runs.
//!
//! Termination is two-phase: a terminated thread is unlinked and parked on
//! the dead list right away, but its stacks are only returned to the
//! allocator by the next reschedule pass that runs on a different thread.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::vec::Vec;

use log::{debug, error, info};

use crate::arch::{AddressSpace, Platform, SwitchDescriptor, ThreadStacks, ThreadStart};
use crate::config::{round_to_pages, SchedulerConfig};
use crate::error::{InvariantViolation, ThreadError};
use crate::memory::stack::{StackAllocator, StackRegion};
use crate::sync::atomic_flag::AtomicFlag;
use crate::sync::spinlock::IrqSpinLock;
use crate::thread::tcb::ThreadControlBlock;
use crate::thread::{Priority, ThreadId, ThreadInfo, ThreadParams, ThreadState, TIER_COUNT};

use super::state::{Current, SchedulerState};

const LOG_TARGET: &str = "scheduler";

/// Why a reschedule pass runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Quantum expired: rotate the current thread only within the winning tier.
    Tick,
    /// Current thread gave up the CPU: always requeue it at its tier's tail.
    Yield,
}

/// Scheduler-visible identity of the executing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CurrentThread {
    Boot,
    Idle,
    Thread(ThreadId),
}

/// Consistent copy of the scheduler's queues for debugging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    /// Ready thread ids per tier, head first.
    pub ready: [Vec<ThreadId>; TIER_COUNT],
    pub paused: Vec<ThreadId>,
    pub waiting: Vec<ThreadId>,
    pub dead: Vec<ThreadId>,
    pub current: CurrentThread,
    pub ticks: u64,
    /// Id the next created thread receives; `None` once ids are exhausted.
    pub next_id: Option<ThreadId>,
}

pub struct Scheduler<P: Platform, A: StackAllocator> {
    platform: P,
    allocator: A,
    config: SchedulerConfig,
    /// Set on the first `initialize` call, before any setup work.
    init_started: AtomicFlag,
    /// Set once the idle thread exists and ticks may reschedule.
    initialized: AtomicFlag,
    ticks: AtomicU64,
    state: IrqSpinLock<SchedulerState<P::Context>>,
}

impl<P: Platform, A: StackAllocator> Scheduler<P, A> {
    pub const fn new(platform: P, allocator: A, config: SchedulerConfig) -> Self {
        Self {
            platform,
            allocator,
            config,
            init_started: AtomicFlag::new(),
            initialized: AtomicFlag::new(),
            ticks: AtomicU64::new(0),
            state: IrqSpinLock::new(SchedulerState::new(config.first_thread_id())),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.test()
    }

    /// Number of timer ticks counted since initialization.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Runs `f` on the scheduler state inside an interrupts-disabled section.
    fn with_state<R>(&self, f: impl FnOnce(&mut SchedulerState<P::Context>) -> R) -> R {
        let mut state = self.state.lock(&self.platform);
        f(&mut state)
    }

    fn fatal(&self, violation: InvariantViolation) -> ! {
        error!(target: LOG_TARGET, "fatal: {}", violation);
        self.platform.halt(violation)
    }

    /// One-time setup: idle thread, address-space tracking, tick enable.
    ///
    /// A second call halts before touching any state.
    pub fn initialize(&self) {
        if self.init_started.test_and_set() {
            self.fatal(InvariantViolation::DoubleInitialization);
        }

        let entry = self.platform.idle_entry();
        if entry.is_null() {
            self.fatal(InvariantViolation::IdleThreadUnavailable);
        }

        let stack = match self.allocator.allocate(self.config.idle_stack_size()) {
            Ok(stack) => stack,
            Err(_) => self.fatal(InvariantViolation::IdleThreadUnavailable),
        };

        let context = self.platform.initial_context(
            ThreadStacks {
                stack: &stack,
                kernel_stack: None,
            },
            ThreadStart {
                entry,
                userdata: 0,
                usermode: false,
            },
        );
        let space = self.platform.current_address_space();

        let installed = self.with_state(|state| {
            let Some(id) = state.ids.allocate() else {
                return Err(stack);
            };
            state.idle = Some(ThreadControlBlock {
                id,
                priority: Priority::LOW,
                state: ThreadState::Ready,
                context,
                address_space: space,
                stack,
                kernel_stack: None,
                entry,
                userdata: 0,
                usermode: false,
                start_paused: false,
                exit_code: 0,
                last_error: None,
                wake_at: None,
            });
            state.kernel_space = space;
            state.active_space = space;
            state.current = Current::Boot;
            Ok(())
        });
        if let Err(stack) = installed {
            self.allocator.free(stack);
            self.fatal(InvariantViolation::IdleThreadUnavailable);
        }

        self.initialized.set();
        info!(
            target: LOG_TARGET,
            "initialized: {} Hz timer, {} tick(s) per quantum",
            self.config.timer_frequency_hz(),
            self.config.ticks_per_quantum()
        );
    }

    /// Timer interrupt entry. Returns the frame to resume.
    ///
    /// Never blocks: if the scheduler lock is held by the interrupted code the
    /// reschedule is skipped for this tick.
    pub fn tick(&self, frame: P::Frame) -> P::Frame {
        if !self.initialized.test() {
            return frame;
        }

        let now = self.ticks.fetch_add(1, Ordering::AcqRel) + 1;
        if now % self.config.ticks_per_quantum() != 0 {
            return frame;
        }

        match self.state.try_lock(&self.platform) {
            Some(mut state) => self.reschedule_locked(&mut state, frame, Trigger::Tick),
            None => frame,
        }
    }

    /// Forces a quantum-expiry style reschedule without counting a tick.
    pub fn reschedule(&self, frame: P::Frame) -> P::Frame {
        if !self.initialized.test() {
            return frame;
        }

        match self.state.try_lock(&self.platform) {
            Some(mut state) => self.reschedule_locked(&mut state, frame, Trigger::Tick),
            None => frame,
        }
    }

    /// Yield vector entry: the current thread goes to the tail of its tier.
    pub fn reschedule_yield(&self, frame: P::Frame) -> P::Frame {
        if !self.initialized.test() {
            return frame;
        }

        match self.state.try_lock(&self.platform) {
            Some(mut state) => self.reschedule_locked(&mut state, frame, Trigger::Yield),
            None => frame,
        }
    }

    /// Gives up the CPU voluntarily.
    pub fn yield_now(&self) {
        self.platform.request_reschedule();
    }

    fn reschedule_locked(
        &self,
        state: &mut SchedulerState<P::Context>,
        frame: P::Frame,
        trigger: Trigger,
    ) -> P::Frame {
        self.reclaim_dead(state);
        self.wake_sleepers(state);

        let previous = state.current;
        if let Current::Thread(slot) = previous {
            let tcb = state.tcb_mut(slot);
            if tcb.state == ThreadState::Running {
                tcb.state = ThreadState::Ready;
            }

            if tcb.state == ThreadState::Ready {
                let tier = tcb.priority.tier();
                let rotate = match trigger {
                    Trigger::Yield => true,
                    Trigger::Tick => state.first_ready_tier() == Some(tier),
                };
                if rotate {
                    state.requeue_tail(slot);
                }
            }
        }

        let next = match self.select(state) {
            Some(slot) => {
                state.tcb_mut(slot).state = ThreadState::Running;
                Current::Thread(slot)
            }
            None => Current::Idle,
        };

        if next == previous {
            return frame;
        }

        if self.platform.interrupts_enabled() {
            self.fatal(InvariantViolation::SwitchPrecondition);
        }

        state.current = next;
        self.switch(state, previous, next, frame)
    }

    /// Head of the first non-empty tier, validated.
    fn select(&self, state: &SchedulerState<P::Context>) -> Option<usize> {
        let tier = state.first_ready_tier()?;
        let slot = *state.ready[tier].front()?;

        let valid = match state.slots.get(slot) {
            Some(Some(tcb)) => tcb.is_runnable() && tcb.priority.tier() == tier,
            _ => false,
        };
        if !valid {
            self.fatal(InvariantViolation::ReadyListCorrupted { tier, slot });
        }

        Some(slot)
    }

    fn switch(
        &self,
        state: &mut SchedulerState<P::Context>,
        previous: Current,
        next: Current,
        frame: P::Frame,
    ) -> P::Frame {
        let target_space = match next {
            Current::Thread(slot) => state.tcb(slot).address_space,
            _ => state.kernel_space,
        };
        let address_space = if target_space != state.active_space {
            state.active_space = target_space;
            Some(target_space)
        } else {
            None
        };

        let SchedulerState { slots, idle, .. } = state;
        let Some(idle) = idle.as_mut() else {
            self.fatal(InvariantViolation::IdleThreadUnavailable);
        };

        let (save, restore) = match (previous, next) {
            (Current::Boot, Current::Idle) => (None, &idle.context),
            (Current::Boot, Current::Thread(to)) => (None, &thread_slot(slots, to).context),
            (Current::Idle, Current::Thread(to)) => {
                (Some(&mut idle.context), &thread_slot(slots, to).context)
            }
            (Current::Thread(from), Current::Idle) => {
                let from = thread_slot_mut(slots, from);
                let save = (from.state != ThreadState::Dead).then_some(&mut from.context);
                (save, &idle.context)
            }
            (Current::Thread(from), Current::Thread(to)) => {
                let (from, to) = pair_mut(slots, from, to);
                let save = (from.state != ThreadState::Dead).then_some(&mut from.context);
                (save, &to.context)
            }
            (_, Current::Boot) | (Current::Idle, Current::Idle) => return frame,
        };

        self.platform.switch(SwitchDescriptor {
            interrupted: frame,
            save,
            restore,
            address_space,
        })
    }

    /// Returns the stacks of every dead thread that is no longer executing.
    fn reclaim_dead(&self, state: &mut SchedulerState<P::Context>) {
        let mut i = 0;
        while i < state.dead.len() {
            let slot = state.dead[i];
            if state.is_current(slot) {
                i += 1;
                continue;
            }

            state.dead.remove(i);
            if let Some(tcb) = state.release(slot) {
                let (stack, kernel_stack) = tcb.into_stacks();
                self.free_stacks(stack, kernel_stack);
            }
        }
    }

    fn wake_sleepers(&self, state: &mut SchedulerState<P::Context>) {
        let now = self.ticks();
        let mut i = 0;
        while i < state.waiting.len() {
            let slot = state.waiting[i];
            match state.tcb(slot).wake_at {
                Some(deadline) if deadline <= now => {
                    state.waiting.remove(i);
                    state.enqueue_ready(slot);
                }
                _ => i += 1,
            }
        }
    }

    fn free_stacks(&self, stack: StackRegion, kernel_stack: Option<StackRegion>) {
        self.allocator.free(stack);
        if let Some(kernel_stack) = kernel_stack {
            self.allocator.free(kernel_stack);
        }
    }

    /// Validates `params`, allocates stacks, and queues a new thread.
    pub(crate) fn create(&self, params: &ThreadParams) -> Result<ThreadId, ThreadError> {
        let priority = params.validate()?;

        if !self.initialized.test() {
            return Err(ThreadError::NotInitialized);
        }

        let stack_size = round_to_pages(params.stack_size);
        let kernel_stack_size = params
            .usermode
            .then(|| self.config.user_kernel_stack_size());

        if !self.allocator.can_allocate(stack_size)
            || kernel_stack_size.is_some_and(|size| !self.allocator.can_allocate(size))
        {
            return Err(ThreadError::OutOfMemory);
        }

        // Stacks are allocated outside the scheduler lock so the allocator's
        // own locking never nests inside it.
        let stack = self.allocator.allocate(stack_size)?;
        let kernel_stack = match kernel_stack_size.map(|size| self.allocator.allocate(size)) {
            Some(Ok(region)) => Some(region),
            Some(Err(err)) => {
                self.allocator.free(stack);
                return Err(err.into());
            }
            None => None,
        };

        let start = ThreadStart {
            entry: params.entry,
            userdata: params.userdata,
            usermode: params.usermode,
        };
        let context = self.platform.initial_context(
            ThreadStacks {
                stack: &stack,
                kernel_stack: kernel_stack.as_ref(),
            },
            start,
        );

        let mut tcb = ThreadControlBlock {
            id: ThreadId(0),
            priority,
            state: if params.start_paused {
                ThreadState::Paused
            } else {
                ThreadState::Ready
            },
            context,
            address_space: AddressSpace(0),
            stack,
            kernel_stack,
            entry: params.entry,
            userdata: params.userdata,
            usermode: params.usermode,
            start_paused: params.start_paused,
            exit_code: 0,
            last_error: None,
            wake_at: None,
        };

        let mut state = self.state.lock(&self.platform);
        // Reserve before taking an id so a failure leaves the generator untouched.
        let id = match state.reserve_for_new_thread() {
            Ok(()) => state.ids.allocate(),
            Err(_) => None,
        };
        let Some(id) = id else {
            drop(state);
            let (stack, kernel_stack) = tcb.into_stacks();
            self.free_stacks(stack, kernel_stack);
            return Err(ThreadError::OutOfMemory);
        };

        tcb.id = id;
        tcb.address_space = params.address_space.unwrap_or(state.active_space);
        state.insert(tcb);
        drop(state);

        debug!(
            target: LOG_TARGET,
            "created {} at tier {}{}{}",
            id,
            priority.tier(),
            if params.start_paused { " (paused)" } else { "" },
            if params.usermode { " (user)" } else { "" }
        );
        Ok(id)
    }

    /// Confirms `id` names a live or not-yet-reclaimed thread.
    pub(crate) fn lookup(&self, id: ThreadId) -> Result<(), ThreadError> {
        if !self.initialized.test() {
            return Err(ThreadError::NotInitialized);
        }
        self.with_state(|state| state.find(id).map(|_| ()))
    }

    pub(crate) fn thread_state(&self, id: ThreadId) -> Result<ThreadState, ThreadError> {
        self.with_state(|state| {
            let slot = state.find(id)?;
            Ok(state.tcb(slot).state)
        })
    }

    pub(crate) fn exit_code(&self, id: ThreadId) -> Result<u32, ThreadError> {
        self.with_state(|state| {
            let slot = state.find(id)?;
            let tcb = state.tcb(slot);
            match tcb.state {
                ThreadState::Dead => Ok(tcb.exit_code),
                _ => Err(ThreadError::InvalidState),
            }
        })
    }

    /// Finds `id` and rejects dead threads.
    fn live_slot(state: &SchedulerState<P::Context>, id: ThreadId) -> Result<usize, ThreadError> {
        let slot = state.find(id)?;
        if state.tcb(slot).state == ThreadState::Dead {
            return Err(ThreadError::ThreadDied);
        }
        Ok(slot)
    }

    pub(crate) fn pause(&self, id: ThreadId) -> Result<(), ThreadError> {
        let was_current = self.with_state(|state| {
            let slot = Self::live_slot(state, id)?;
            match state.tcb(slot).state {
                ThreadState::Paused => return Ok(false),
                ThreadState::Waiting => return Err(ThreadError::InvalidState),
                _ => {}
            }

            state.unlink(slot);
            state.tcb_mut(slot).state = ThreadState::Paused;
            state.paused.push(slot);
            Ok(state.is_current(slot))
        })?;

        if was_current {
            self.platform.request_reschedule();
        }
        Ok(())
    }

    pub(crate) fn resume(&self, id: ThreadId) -> Result<(), ThreadError> {
        self.with_state(|state| {
            let slot = Self::live_slot(state, id)?;
            if state.tcb(slot).state != ThreadState::Paused {
                return Ok(());
            }

            state.unlink(slot);
            state.enqueue_ready(slot);
            Ok(())
        })
    }

    pub(crate) fn set_priority(&self, id: ThreadId, priority: u32) -> Result<(), ThreadError> {
        let priority = Priority::new(priority)?;
        self.with_state(|state| {
            let slot = Self::live_slot(state, id)?;
            let tcb = state.tcb(slot);
            if tcb.priority == priority {
                return Ok(());
            }

            if tcb.is_runnable() {
                state.unlink(slot);
                state.tcb_mut(slot).priority = priority;
                state.ready[priority.tier()].push_back(slot);
            } else {
                state.tcb_mut(slot).priority = priority;
            }
            Ok(())
        })
    }

    /// Marks `id` dead and unlinks it. Stacks are reclaimed later.
    pub(crate) fn terminate(&self, id: ThreadId, exit_code: u32) -> Result<(), ThreadError> {
        let was_current = self.with_state(|state| {
            let slot = Self::live_slot(state, id)?;
            Ok::<_, ThreadError>(Self::retire(state, slot, exit_code))
        })?;

        debug!(target: LOG_TARGET, "terminated {} with exit code {}", id, exit_code);
        if was_current {
            self.platform.request_reschedule();
        }
        Ok(())
    }

    fn retire(state: &mut SchedulerState<P::Context>, slot: usize, exit_code: u32) -> bool {
        state.unlink(slot);
        let tcb = state.tcb_mut(slot);
        tcb.state = ThreadState::Dead;
        tcb.exit_code = exit_code;
        tcb.wake_at = None;
        state.dead.push(slot);
        state.is_current(slot)
    }

    /// Moves a Ready/Running thread to the waiting set.
    pub fn block(&self, id: ThreadId) -> Result<(), ThreadError> {
        let was_current = self.with_state(|state| {
            let slot = Self::live_slot(state, id)?;
            match state.tcb(slot).state {
                ThreadState::Waiting => return Ok(false),
                ThreadState::Paused => return Err(ThreadError::InvalidState),
                _ => {}
            }

            state.unlink(slot);
            state.tcb_mut(slot).state = ThreadState::Waiting;
            state.waiting.push(slot);
            Ok(state.is_current(slot))
        })?;

        if was_current {
            self.platform.request_reschedule();
        }
        Ok(())
    }

    /// Moves a Waiting thread back to the tail of its tier.
    pub fn wake(&self, id: ThreadId) -> Result<(), ThreadError> {
        self.with_state(|state| {
            let slot = Self::live_slot(state, id)?;
            match state.tcb(slot).state {
                ThreadState::Waiting => {
                    state.unlink(slot);
                    state.enqueue_ready(slot);
                    Ok(())
                }
                ThreadState::Paused => Err(ThreadError::InvalidState),
                _ => Ok(()),
            }
        })
    }

    /// Puts the current thread to sleep for at least `ticks` timer ticks.
    pub fn sleep_current(&self, ticks: u64) -> Result<(), ThreadError> {
        if ticks == 0 {
            self.yield_now();
            return Ok(());
        }

        let deadline = self.ticks().saturating_add(ticks);
        self.with_state(|state| {
            let Current::Thread(slot) = state.current else {
                return Err(ThreadError::NotFound);
            };
            if state.tcb(slot).state == ThreadState::Dead {
                return Err(ThreadError::ThreadDied);
            }

            state.unlink(slot);
            let tcb = state.tcb_mut(slot);
            tcb.state = ThreadState::Waiting;
            tcb.wake_at = Some(deadline);
            state.waiting.push(slot);
            Ok(())
        })?;

        self.platform.request_reschedule();
        Ok(())
    }

    /// Marks the current thread dead and returns its id.
    ///
    /// The caller must reschedule right after; the thread is never selected again.
    pub fn retire_current(&self, exit_code: u32) -> Result<ThreadId, ThreadError> {
        let id = self.with_state(|state| {
            let Current::Thread(slot) = state.current else {
                return Err(ThreadError::NotFound);
            };
            if state.tcb(slot).state == ThreadState::Dead {
                return Err(ThreadError::ThreadDied);
            }

            Self::retire(state, slot, exit_code);
            Ok(state.id_of(slot))
        })?;

        debug!(target: LOG_TARGET, "{} exited with code {}", id, exit_code);
        Ok(id)
    }

    /// Terminates the calling thread. Never returns.
    ///
    /// A thread already terminated by someone else just waits to be switched
    /// away from. Calling this from the boot or idle context halts.
    pub fn exit_current(&self, exit_code: u32) -> ! {
        match self.retire_current(exit_code) {
            Ok(_) | Err(ThreadError::ThreadDied) => {}
            Err(_) => self.fatal(InvariantViolation::ExitOutsideThread),
        }
        loop {
            self.platform.request_reschedule();
            core::hint::spin_loop();
        }
    }

    /// Records `err` as the last error of the executing thread.
    ///
    /// Dropped while the boot context runs, which has no control block.
    pub fn set_last_error(&self, err: ThreadError) {
        self.with_state(|state| match state.current {
            Current::Thread(slot) => state.tcb_mut(slot).last_error = Some(err),
            Current::Idle => {
                if let Some(idle) = state.idle.as_mut() {
                    idle.last_error = Some(err);
                }
            }
            Current::Boot => {}
        });
    }

    /// Last error recorded on the executing thread.
    pub fn last_error(&self) -> Option<ThreadError> {
        self.with_state(|state| match state.current {
            Current::Thread(slot) => state.tcb(slot).last_error,
            Current::Idle => state.idle.as_ref().and_then(|idle| idle.last_error),
            Current::Boot => None,
        })
    }

    pub(crate) fn thread_last_error(&self, id: ThreadId) -> Result<Option<ThreadError>, ThreadError> {
        self.with_state(|state| {
            let slot = state.find(id)?;
            Ok(state.tcb(slot).last_error)
        })
    }

    pub(crate) fn thread_info(&self, id: ThreadId) -> Result<ThreadInfo, ThreadError> {
        self.with_state(|state| {
            let slot = state.find(id)?;
            Ok(state.tcb(slot).info())
        })
    }

    /// Id of the thread executing right now; `None` for boot and idle.
    pub fn current_thread(&self) -> Option<ThreadId> {
        self.with_state(|state| match state.current {
            Current::Thread(slot) => Some(state.id_of(slot)),
            _ => None,
        })
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        let ticks = self.ticks();
        self.with_state(|state| SchedulerSnapshot {
            ready: [
                ids(state, &state.ready[0]),
                ids(state, &state.ready[1]),
                ids(state, &state.ready[2]),
                ids(state, &state.ready[3]),
            ],
            paused: ids(state, &state.paused),
            waiting: ids(state, &state.waiting),
            dead: ids(state, &state.dead),
            current: match state.current {
                Current::Boot => CurrentThread::Boot,
                Current::Idle => CurrentThread::Idle,
                Current::Thread(slot) => CurrentThread::Thread(state.id_of(slot)),
            },
            ticks,
            next_id: state.ids.peek(),
        })
    }
}

fn ids<'a, C: 'a>(
    state: &SchedulerState<C>,
    slots: impl IntoIterator<Item = &'a usize>,
) -> Vec<ThreadId> {
    slots.into_iter().map(|&slot| state.id_of(slot)).collect()
}

fn thread_slot<C>(slots: &[Option<ThreadControlBlock<C>>], slot: usize) -> &ThreadControlBlock<C> {
    match slots.get(slot) {
        Some(Some(tcb)) => tcb,
        _ => unreachable!("scheduler slot {} is empty", slot),
    }
}

fn thread_slot_mut<C>(
    slots: &mut [Option<ThreadControlBlock<C>>],
    slot: usize,
) -> &mut ThreadControlBlock<C> {
    match slots.get_mut(slot) {
        Some(Some(tcb)) => tcb,
        _ => unreachable!("scheduler slot {} is empty", slot),
    }
}

/// Borrows two distinct slots at once: the first mutably, the second shared.
fn pair_mut<C>(
    slots: &mut [Option<ThreadControlBlock<C>>],
    first: usize,
    second: usize,
) -> (&mut ThreadControlBlock<C>, &ThreadControlBlock<C>) {
    if first < second {
        let (head, tail) = slots.split_at_mut(second);
        (thread_slot_mut(head, first), thread_slot(tail, 0))
    } else {
        let (head, tail) = slots.split_at_mut(first);
        (thread_slot_mut(tail, 0), thread_slot(head, second))
    }
}
