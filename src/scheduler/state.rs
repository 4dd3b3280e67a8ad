//! Lock-protected scheduler bookkeeping.
//!
//! Everything in here is only reachable through
//! [`Scheduler::with_state`](super::Scheduler) or the interrupt paths that
//! hold the same lock. Collections are pre-reserved at thread creation so
//! the interrupt paths never allocate.

use alloc::collections::{TryReserveError, VecDeque};
use alloc::vec::Vec;

use crate::arch::AddressSpace;
use crate::error::ThreadError;
use crate::thread::tcb::ThreadControlBlock;
use crate::thread::{ThreadId, ThreadIdAllocator, ThreadState, TIER_COUNT};

/// What the CPU is executing right now, from the scheduler's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Current {
    /// The context that called `initialize`. Abandoned at the first switch.
    Boot,
    Idle,
    Thread(usize),
}

pub(crate) struct SchedulerState<C> {
    /// FIFO of slot indices per tier. The running thread keeps its place.
    pub ready: [VecDeque<usize>; TIER_COUNT],
    pub paused: Vec<usize>,
    pub waiting: Vec<usize>,
    /// Terminated threads whose stacks are not yet reclaimed.
    pub dead: Vec<usize>,

    pub slots: Vec<Option<ThreadControlBlock<C>>>,
    pub free_slots: Vec<usize>,
    pub live_threads: usize,

    pub idle: Option<ThreadControlBlock<C>>,
    pub current: Current,
    pub ids: ThreadIdAllocator,

    pub kernel_space: AddressSpace,
    pub active_space: AddressSpace,
}

impl<C> SchedulerState<C> {
    pub const fn new(first_id: u32) -> Self {
        Self {
            ready: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
            paused: Vec::new(),
            waiting: Vec::new(),
            dead: Vec::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            live_threads: 0,
            idle: None,
            current: Current::Boot,
            ids: ThreadIdAllocator::starting_at(first_id),
            kernel_space: AddressSpace(0),
            active_space: AddressSpace(0),
        }
    }

    /// Grows every collection so one more thread fits in any of them.
    ///
    /// Nothing is mutated observably on failure.
    pub fn reserve_for_new_thread(&mut self) -> Result<(), TryReserveError> {
        let needed = self.live_threads + 1;

        for list in self.ready.iter_mut() {
            list.try_reserve(needed.saturating_sub(list.len()))?;
        }
        self.paused
            .try_reserve(needed.saturating_sub(self.paused.len()))?;
        self.waiting
            .try_reserve(needed.saturating_sub(self.waiting.len()))?;
        self.dead.try_reserve(needed.saturating_sub(self.dead.len()))?;

        if self.free_slots.is_empty() {
            self.slots.try_reserve(1)?;
        }
        self.free_slots
            .try_reserve((self.slots.len() + 1).saturating_sub(self.free_slots.len()))?;

        Ok(())
    }

    /// Stores `tcb` in a free slot and queues it according to its state.
    ///
    /// Capacity must have been reserved via [`reserve_for_new_thread`](Self::reserve_for_new_thread).
    pub fn insert(&mut self, tcb: ThreadControlBlock<C>) -> usize {
        let tier = tcb.priority.tier();
        let paused = tcb.state == ThreadState::Paused;

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot] = Some(tcb);
                slot
            }
            None => {
                self.slots.push(tcb.into());
                self.slots.len() - 1
            }
        };
        self.live_threads += 1;

        if paused {
            self.paused.push(slot);
        } else {
            self.ready[tier].push_back(slot);
        }
        slot
    }

    /// Slot index of the live or not-yet-reclaimed thread `id`.
    pub fn find(&self, id: ThreadId) -> Result<usize, ThreadError> {
        self.slots
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|tcb| tcb.id == id))
            .ok_or(ThreadError::NotFound)
    }

    pub fn tcb(&self, slot: usize) -> &ThreadControlBlock<C> {
        match self.slots.get(slot) {
            Some(Some(tcb)) => tcb,
            _ => unreachable!("scheduler slot {} is empty", slot),
        }
    }

    pub fn tcb_mut(&mut self, slot: usize) -> &mut ThreadControlBlock<C> {
        match self.slots.get_mut(slot) {
            Some(Some(tcb)) => tcb,
            _ => unreachable!("scheduler slot {} is empty", slot),
        }
    }

    pub fn is_current(&self, slot: usize) -> bool {
        self.current == Current::Thread(slot)
    }

    /// Removes `slot` from whichever structure its state says it lives in.
    pub fn unlink(&mut self, slot: usize) {
        let (state, tier) = {
            let tcb = self.tcb(slot);
            (tcb.state, tcb.priority.tier())
        };

        match state {
            ThreadState::Ready | ThreadState::Running => {
                if let Some(pos) = self.ready[tier].iter().position(|&s| s == slot) {
                    self.ready[tier].remove(pos);
                }
            }
            ThreadState::Paused => remove_from(&mut self.paused, slot),
            ThreadState::Waiting => remove_from(&mut self.waiting, slot),
            ThreadState::Dead => remove_from(&mut self.dead, slot),
        }
    }

    /// Appends `slot` to its tier's tail as Ready.
    pub fn enqueue_ready(&mut self, slot: usize) {
        let tcb = self.tcb_mut(slot);
        tcb.state = ThreadState::Ready;
        tcb.wake_at = None;
        let tier = tcb.priority.tier();
        self.ready[tier].push_back(slot);
    }

    /// Moves a Ready/Running thread to the tail of its tier.
    pub fn requeue_tail(&mut self, slot: usize) {
        let tier = self.tcb(slot).priority.tier();
        if let Some(pos) = self.ready[tier].iter().position(|&s| s == slot) {
            self.ready[tier].remove(pos);
            self.ready[tier].push_back(slot);
        }
    }

    /// Releases the slot of a reclaimed thread and returns its block.
    pub fn release(&mut self, slot: usize) -> Option<ThreadControlBlock<C>> {
        let tcb = self.slots.get_mut(slot)?.take()?;
        self.free_slots.push(slot);
        self.live_threads -= 1;
        Some(tcb)
    }

    /// First non-empty tier, if any.
    pub fn first_ready_tier(&self) -> Option<usize> {
        self.ready.iter().position(|list| !list.is_empty())
    }

    pub fn id_of(&self, slot: usize) -> ThreadId {
        self.tcb(slot).id
    }
}

fn remove_from(list: &mut Vec<usize>, slot: usize) {
    if let Some(pos) = list.iter().position(|&s| s == slot) {
        list.remove(pos);
    }
}
