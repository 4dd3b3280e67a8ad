//! Indivisible boolean flag usable from interrupt context.
//!
//! Every operation is a single atomic memory access. Composing them into a
//! lock (spin until `test` reads false, then `set`) is left to the caller;
//! see [`IrqSpinLock`](crate::sync::spinlock::IrqSpinLock) for the one the
//! scheduler uses.

use core::sync::atomic::{AtomicBool, Ordering};

/// Boolean flag with atomic set / clear / test.
#[derive(Debug, Default)]
pub struct AtomicFlag {
    value: AtomicBool,
}

impl AtomicFlag {
    /// Creates a cleared flag.
    pub const fn new() -> Self {
        Self {
            value: AtomicBool::new(false),
        }
    }

    /// Forces the flag to `true`.
    #[inline]
    pub fn set(&self) {
        self.value.store(true, Ordering::Release);
    }

    /// Forces the flag to `false`.
    #[inline]
    pub fn clear(&self) {
        self.value.store(false, Ordering::Release);
    }

    /// Reads the current value.
    #[inline]
    pub fn test(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    /// Sets the flag and returns the value it held before.
    ///
    /// `false` means the caller is the one that flipped it.
    #[inline]
    pub fn test_and_set(&self) -> bool {
        self.value.swap(true, Ordering::AcqRel)
    }
}
