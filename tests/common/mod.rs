//! Host platform and allocator shared by the integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::panic::{self, AssertUnwindSafe};

use kaos_tasking::arch::{AddressSpace, Platform, SwitchDescriptor, ThreadStacks, ThreadStart};
use kaos_tasking::memory::stack::{HeapStackAllocator, StackAllocator, StackRegion};
use kaos_tasking::sync::critical::InterruptControl;
use kaos_tasking::{
    AllocError, EntryPoint, InvariantViolation, Scheduler, SchedulerConfig, ThreadHandle, ThreadId,
    ThreadParams,
};

/// Address space active when the mock scheduler initializes.
pub const KERNEL_SPACE: AddressSpace = AddressSpace(0x1000);

/// Entry address of the mock idle routine.
pub const IDLE_ENTRY: usize = 0x1d1e;

/// Saved context of a mock thread: the frame token it resumes from.
///
/// A fresh thread resumes from its stack top, which is unique per thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockContext {
    pub resume: usize,
    pub usermode: bool,
    pub userdata: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRecord {
    pub interrupted: usize,
    pub saved: bool,
    pub resumed: usize,
    pub address_space: Option<AddressSpace>,
    pub interrupts_enabled: bool,
}

/// Single-core CPU simulation: an interrupt flag, an address-space register,
/// and a log of every switch.
pub struct MockPlatform {
    /// Shared with the allocator so it can see the interrupt state.
    irq_enabled: Rc<Cell<bool>>,
    /// When set, `disable_interrupts` silently does nothing.
    broken_masking: Cell<bool>,
    address_space: Cell<AddressSpace>,
    reschedule_requests: Cell<usize>,
    switches: RefCell<Vec<SwitchRecord>>,
    halted: Cell<Option<InvariantViolation>>,
    switch_hook: Cell<Option<fn()>>,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::with_irq_flag(Rc::new(Cell::new(true)))
    }

    pub fn with_irq_flag(irq_enabled: Rc<Cell<bool>>) -> Self {
        Self {
            irq_enabled,
            broken_masking: Cell::new(false),
            address_space: Cell::new(KERNEL_SPACE),
            reschedule_requests: Cell::new(0),
            switches: RefCell::new(Vec::new()),
            halted: Cell::new(None),
            switch_hook: Cell::new(None),
        }
    }

    pub fn set_broken_masking(&self, broken: bool) {
        self.broken_masking.set(broken);
    }

    pub fn set_switch_hook(&self, hook: Option<fn()>) {
        self.switch_hook.set(hook);
    }

    pub fn active_address_space(&self) -> AddressSpace {
        self.address_space.get()
    }

    pub fn reschedule_requests(&self) -> usize {
        self.reschedule_requests.get()
    }

    pub fn switches(&self) -> Vec<SwitchRecord> {
        self.switches.borrow().clone()
    }

    pub fn last_switch(&self) -> Option<SwitchRecord> {
        self.switches.borrow().last().copied()
    }

    pub fn halted(&self) -> Option<InvariantViolation> {
        self.halted.get()
    }
}

impl InterruptControl for MockPlatform {
    fn interrupts_enabled(&self) -> bool {
        self.irq_enabled.get()
    }

    fn disable_interrupts(&self) {
        if !self.broken_masking.get() {
            self.irq_enabled.set(false);
        }
    }

    fn enable_interrupts(&self) {
        self.irq_enabled.set(true);
    }
}

impl Platform for MockPlatform {
    type Frame = usize;
    type Context = MockContext;

    fn initial_context(&self, stacks: ThreadStacks<'_>, start: ThreadStart) -> MockContext {
        MockContext {
            resume: stacks.stack.top(),
            usermode: start.usermode,
            userdata: start.userdata,
        }
    }

    fn idle_entry(&self) -> EntryPoint {
        EntryPoint::address(IDLE_ENTRY)
    }

    fn switch(&self, desc: SwitchDescriptor<'_, MockContext, usize>) -> usize {
        if let Some(hook) = self.switch_hook.get() {
            hook();
        }

        let saved = desc.save.is_some();
        if let Some(save) = desc.save {
            save.resume = desc.interrupted;
        }
        if let Some(space) = desc.address_space {
            self.address_space.set(space);
        }

        self.switches.borrow_mut().push(SwitchRecord {
            interrupted: desc.interrupted,
            saved,
            resumed: desc.restore.resume,
            address_space: desc.address_space,
            interrupts_enabled: self.irq_enabled.get(),
        });
        desc.restore.resume
    }

    fn current_address_space(&self) -> AddressSpace {
        self.address_space.get()
    }

    fn request_reschedule(&self) {
        self.reschedule_requests.set(self.reschedule_requests.get() + 1);
    }

    fn halt(&self, violation: InvariantViolation) -> ! {
        self.halted.set(Some(violation));
        panic!("halt: {}", violation);
    }
}

/// Heap-backed allocator that counts calls, can be told to fail, and panics
/// on any double free.
pub struct CountingAllocator {
    inner: HeapStackAllocator,
    allocations: Cell<usize>,
    frees: Cell<usize>,
    /// Successful allocations left before `allocate` starts failing.
    budget: Cell<Option<usize>>,
    refuse_precheck: Cell<bool>,
    live: RefCell<Vec<usize>>,
    sizes: RefCell<Vec<usize>>,
    /// Interrupt flag of the platform the scheduler runs on, if shared.
    irq_enabled: Option<Rc<Cell<bool>>>,
    masked_frees: Cell<usize>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self {
            inner: HeapStackAllocator::new(),
            allocations: Cell::new(0),
            frees: Cell::new(0),
            budget: Cell::new(None),
            refuse_precheck: Cell::new(false),
            live: RefCell::new(Vec::new()),
            sizes: RefCell::new(Vec::new()),
            irq_enabled: None,
            masked_frees: Cell::new(0),
        }
    }

    pub fn with_irq_flag(irq_enabled: Rc<Cell<bool>>) -> Self {
        Self {
            irq_enabled: Some(irq_enabled),
            ..Self::new()
        }
    }

    /// Frees that happened while interrupts were masked.
    pub fn masked_frees(&self) -> usize {
        self.masked_frees.get()
    }

    pub fn allocations(&self) -> usize {
        self.allocations.get()
    }

    pub fn frees(&self) -> usize {
        self.frees.get()
    }

    pub fn live(&self) -> usize {
        self.live.borrow().len()
    }

    /// Sizes of every successful allocation, in order.
    pub fn sizes(&self) -> Vec<usize> {
        self.sizes.borrow().clone()
    }

    pub fn fail_after(&self, successes: usize) {
        self.budget.set(Some(successes));
    }

    pub fn refuse_precheck(&self, refuse: bool) {
        self.refuse_precheck.set(refuse);
    }
}

impl StackAllocator for CountingAllocator {
    fn allocate(&self, size: usize) -> Result<StackRegion, AllocError> {
        match self.budget.get() {
            Some(0) => return Err(AllocError { requested: size }),
            Some(n) => self.budget.set(Some(n - 1)),
            None => {}
        }

        let region = self.inner.allocate(size)?;
        self.allocations.set(self.allocations.get() + 1);
        self.live.borrow_mut().push(region.base() as usize);
        self.sizes.borrow_mut().push(size);
        Ok(region)
    }

    fn resize(&self, region: &mut StackRegion, new_size: usize) -> Result<(), AllocError> {
        let old = region.base() as usize;
        self.inner.resize(region, new_size)?;
        let mut live = self.live.borrow_mut();
        if let Some(entry) = live.iter_mut().find(|base| **base == old) {
            *entry = region.base() as usize;
        }
        Ok(())
    }

    fn free(&self, region: StackRegion) {
        let base = region.base() as usize;
        {
            let mut live = self.live.borrow_mut();
            let pos = live
                .iter()
                .position(|&b| b == base)
                .unwrap_or_else(|| panic!("double or foreign free of stack {:#x}", base));
            live.remove(pos);
        }
        self.frees.set(self.frees.get() + 1);
        if self.irq_enabled.as_ref().is_some_and(|irq| !irq.get()) {
            self.masked_frees.set(self.masked_frees.get() + 1);
        }
        self.inner.free(region);
    }

    fn can_allocate(&self, size: usize) -> bool {
        !self.refuse_precheck.get() && self.inner.can_allocate(size)
    }
}

pub type TestScheduler = Scheduler<MockPlatform, CountingAllocator>;
pub type TestHandle<'s> = ThreadHandle<'s, MockPlatform, CountingAllocator>;

/// Default config: every tick is a quantum.
pub fn scheduler() -> TestScheduler {
    scheduler_with(SchedulerConfig::new())
}

pub fn scheduler_with(config: SchedulerConfig) -> TestScheduler {
    let irq = Rc::new(Cell::new(true));
    Scheduler::new(
        MockPlatform::with_irq_flag(Rc::clone(&irq)),
        CountingAllocator::with_irq_flag(irq),
        config,
    )
}

/// Initialized scheduler, still running the boot context.
pub fn started() -> TestScheduler {
    let sched = scheduler();
    sched.initialize();
    sched
}

pub extern "C" fn dummy_thread(_userdata: usize) {}

pub fn entry() -> EntryPoint {
    EntryPoint::function(dummy_thread)
}

/// Creates a running-eligible kernel thread at `priority`.
pub fn spawn(sched: &TestScheduler, priority: u32) -> ThreadId {
    spawn_with(sched, ThreadParams::new(entry()).priority(priority))
}

pub fn spawn_with(sched: &TestScheduler, params: ThreadParams) -> ThreadId {
    let mut handle = ThreadHandle::new(sched);
    handle.create(&params).expect("thread creation should succeed")
}

pub fn open(sched: &TestScheduler, id: ThreadId) -> TestHandle<'_> {
    let mut handle = ThreadHandle::new(sched);
    handle.open(id).expect("thread should be openable");
    handle
}

/// Runs `f`, expecting it to reach `Platform::halt`; returns the violation.
pub fn expect_halt(sched: &TestScheduler, f: impl FnOnce()) -> InvariantViolation {
    let result = panic::catch_unwind(AssertUnwindSafe(f));

    assert!(result.is_err(), "operation should have halted");
    sched
        .platform()
        .halted()
        .expect("halt must record the violation")
}
