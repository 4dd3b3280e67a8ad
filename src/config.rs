//! Scheduler tuning knobs.

/// Granularity every thread stack is rounded up to.
pub const PAGE_SIZE: usize = 4096;

/// Stack size reserved for the idle thread.
pub const IDLE_STACK_SIZE: usize = PAGE_SIZE;

/// Ring-0 stack size for user-mode threads (used on privilege transitions).
pub const USER_KERNEL_STACK_SIZE: usize = 4 * PAGE_SIZE;

/// Default timer interrupt rate.
pub const DEFAULT_TIMER_FREQUENCY_HZ: u64 = 1000;

/// Default rate at which the scheduler picks a new thread.
pub const DEFAULT_SCHEDULER_FREQUENCY_HZ: u64 = 1000;

/// Static configuration handed to [`Scheduler::new`](crate::scheduler::Scheduler::new).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    timer_frequency_hz: u64,
    scheduler_frequency_hz: u64,
    idle_stack_size: usize,
    user_kernel_stack_size: usize,
    first_thread_id: u32,
}

impl SchedulerConfig {
    pub const fn new() -> Self {
        Self {
            timer_frequency_hz: DEFAULT_TIMER_FREQUENCY_HZ,
            scheduler_frequency_hz: DEFAULT_SCHEDULER_FREQUENCY_HZ,
            idle_stack_size: IDLE_STACK_SIZE,
            user_kernel_stack_size: USER_KERNEL_STACK_SIZE,
            first_thread_id: 0,
        }
    }

    /// Rate at which the timer calls [`Scheduler::tick`](crate::scheduler::Scheduler::tick).
    pub const fn with_timer_frequency(mut self, hz: u64) -> Self {
        self.timer_frequency_hz = hz;
        self
    }

    /// Rate at which ticks turn into reschedules.
    pub const fn with_scheduler_frequency(mut self, hz: u64) -> Self {
        self.scheduler_frequency_hz = hz;
        self
    }

    pub const fn with_idle_stack_size(mut self, bytes: usize) -> Self {
        self.idle_stack_size = bytes;
        self
    }

    pub const fn with_user_kernel_stack_size(mut self, bytes: usize) -> Self {
        self.user_kernel_stack_size = bytes;
        self
    }

    /// Id given to the idle thread; created threads count up from here.
    pub const fn with_first_thread_id(mut self, id: u32) -> Self {
        self.first_thread_id = id;
        self
    }

    pub const fn timer_frequency_hz(&self) -> u64 {
        self.timer_frequency_hz
    }

    pub const fn scheduler_frequency_hz(&self) -> u64 {
        self.scheduler_frequency_hz
    }

    pub const fn idle_stack_size(&self) -> usize {
        round_to_pages(self.idle_stack_size)
    }

    pub const fn user_kernel_stack_size(&self) -> usize {
        round_to_pages(self.user_kernel_stack_size)
    }

    pub const fn first_thread_id(&self) -> u32 {
        self.first_thread_id
    }

    /// Number of timer ticks between two reschedules, never less than one.
    pub const fn ticks_per_quantum(&self) -> u64 {
        if self.scheduler_frequency_hz == 0 {
            return 1;
        }
        let ticks = self.timer_frequency_hz / self.scheduler_frequency_hz;
        if ticks == 0 {
            1
        } else {
            ticks
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Rounds `bytes` up to a whole number of pages (zero stays zero).
pub const fn round_to_pages(bytes: usize) -> usize {
    match bytes.checked_add(PAGE_SIZE - 1) {
        Some(v) => v & !(PAGE_SIZE - 1),
        None => usize::MAX & !(PAGE_SIZE - 1),
    }
}
