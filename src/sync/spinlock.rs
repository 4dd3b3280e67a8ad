//! Spinlock built on [`AtomicFlag`] with interrupt masking.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::sync::atomic_flag::AtomicFlag;
use crate::sync::critical::{CriticalSection, InterruptControl};

pub struct IrqSpinLock<T> {
    locked: AtomicFlag,
    data: UnsafeCell<T>,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicFlag::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Disables interrupts through `irq`, then spins until the flag is ours.
    ///
    /// On a single core the spin only terminates if the holder can run, so
    /// interrupt handlers must use [`try_lock`](Self::try_lock) instead.
    pub fn lock<'a, I: InterruptControl + ?Sized>(&'a self, irq: &'a I) -> IrqSpinLockGuard<'a, T, I> {
        let section = CriticalSection::enter(irq);

        while self.locked.test_and_set() {
            while self.locked.test() {
                core::hint::spin_loop();
            }
        }

        IrqSpinLockGuard {
            lock: self,
            _section: section,
        }
    }

    /// Single acquisition attempt; `None` when the flag is already held.
    pub fn try_lock<'a, I: InterruptControl + ?Sized>(
        &'a self,
        irq: &'a I,
    ) -> Option<IrqSpinLockGuard<'a, T, I>> {
        let section = CriticalSection::enter(irq);

        if self.locked.test_and_set() {
            return None;
        }

        Some(IrqSpinLockGuard {
            lock: self,
            _section: section,
        })
    }

    /// Whether some path currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.locked.test()
    }
}

pub struct IrqSpinLockGuard<'a, T, I: InterruptControl + ?Sized> {
    lock: &'a IrqSpinLock<T>,
    // Dropped after `Drop::drop` releases the flag, so interrupts come back last.
    _section: CriticalSection<'a, I>,
}

impl<T, I: InterruptControl + ?Sized> Deref for IrqSpinLockGuard<'_, T, I> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        // SAFETY:
        // - The flag guarantees exclusive access while the guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T, I: InterruptControl + ?Sized> DerefMut for IrqSpinLockGuard<'_, T, I> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY:
        // - The flag guarantees exclusive access while the guard lives.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T, I: InterruptControl + ?Sized> Drop for IrqSpinLockGuard<'_, T, I> {
    fn drop(&mut self) {
        self.lock.locked.clear();
    }
}

// SAFETY:
// - Access to `data` is synchronized via the flag.
// - `T: Send` ensures it is safe to hand the protected value between contexts.
unsafe impl<T: Send> Sync for IrqSpinLock<T> {}
unsafe impl<T: Send> Send for IrqSpinLock<T> {}
