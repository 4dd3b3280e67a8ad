//! Thread stack memory contract.
//!
//! The scheduler never talks to the heap directly. It asks a
//! [`StackAllocator`] for stack regions at thread creation and hands them
//! back exactly once when the thread is reclaimed.

use core::alloc::Layout;
use core::ptr::{self, NonNull};

use alloc::alloc as heap_alloc;

use crate::config::PAGE_SIZE;
use crate::error::AllocError;

/// Alignment of every stack region.
pub const STACK_ALIGNMENT: usize = 16;

/// A contiguous stack allocation: `[base, base + size)`.
///
/// Owned by exactly one control block while the thread lives.
#[derive(Debug, PartialEq, Eq)]
pub struct StackRegion {
    base: NonNull<u8>,
    size: usize,
}

impl StackRegion {
    /// Wraps an existing allocation.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` writable bytes that stay valid until the
    /// region is passed back to the allocator that produced it.
    pub const unsafe fn from_raw_parts(base: NonNull<u8>, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// One past the highest byte of the region (initial stack pointer).
    pub fn top(&self) -> usize {
        self.base.as_ptr() as usize + self.size
    }

    /// Whether `[addr, addr + len)` lies entirely inside this region.
    pub fn contains(&self, addr: usize, len: usize) -> bool {
        let start = self.base.as_ptr() as usize;
        match addr.checked_add(len) {
            Some(end) => addr >= start && end <= self.top(),
            None => false,
        }
    }
}

// SAFETY:
// - A region is exclusively owned by one control block (or by the creating
//   path before it is committed); the pointer is never aliased.
unsafe impl Send for StackRegion {}

/// Allocation contract consumed by thread creation.
///
/// `allocate`, `resize` and `can_allocate` run in ordinary thread context.
/// `free` also runs from the timer interrupt: the reclaim pass returns dead
/// threads' stacks with interrupts masked and the scheduler lock held. Any
/// lock `free` takes must therefore mask interrupts while held, or an
/// interrupted `allocate` deadlocks against it.
pub trait StackAllocator {
    /// Allocates `size` bytes of stack memory.
    fn allocate(&self, size: usize) -> Result<StackRegion, AllocError>;

    /// Grows or shrinks `region` to `new_size` bytes, possibly moving it.
    ///
    /// On failure `region` is left untouched and still owned by the caller.
    fn resize(&self, region: &mut StackRegion, new_size: usize) -> Result<(), AllocError>;

    /// Returns `region` to the allocator. Must not block; see the trait docs.
    fn free(&self, region: StackRegion);

    /// Cheap availability pre-check performed before [`allocate`](Self::allocate).
    fn can_allocate(&self, size: usize) -> bool;
}

/// [`StackAllocator`] backed by the kernel's global allocator.
///
/// Every page is touched at allocation time so demand paging happens here
/// rather than on first use inside interrupt context.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStackAllocator;

impl HeapStackAllocator {
    pub const fn new() -> Self {
        Self
    }

    fn layout(size: usize) -> Result<Layout, AllocError> {
        if size == 0 {
            return Err(AllocError { requested: size });
        }
        Layout::from_size_align(size, STACK_ALIGNMENT).map_err(|_| AllocError { requested: size })
    }

    fn touch_pages(base: *mut u8, size: usize) {
        // SAFETY:
        // - `base` points to a fresh allocation of `size` bytes.
        unsafe {
            for page_off in (0..size).step_by(PAGE_SIZE) {
                ptr::write_volatile(base.add(page_off), 0);
            }
        }
    }
}

impl StackAllocator for HeapStackAllocator {
    fn allocate(&self, size: usize) -> Result<StackRegion, AllocError> {
        let layout = Self::layout(size)?;
        // SAFETY:
        // - `layout` has non-zero size and a power-of-two alignment.
        let ptr = unsafe { heap_alloc::alloc(layout) };
        let base = NonNull::new(ptr).ok_or(AllocError { requested: size })?;

        Self::touch_pages(base.as_ptr(), size);

        Ok(StackRegion { base, size })
    }

    fn resize(&self, region: &mut StackRegion, new_size: usize) -> Result<(), AllocError> {
        let old_layout = Self::layout(region.size)?;
        Self::layout(new_size)?;
        // SAFETY:
        // - `region` was produced by `allocate` with `old_layout`.
        // - `new_size` is non-zero and does not overflow when rounded to the alignment.
        let ptr = unsafe { heap_alloc::realloc(region.base.as_ptr(), old_layout, new_size) };
        let base = NonNull::new(ptr).ok_or(AllocError { requested: new_size })?;

        if new_size > region.size {
            // SAFETY: the grown tail lies within the reallocated block.
            Self::touch_pages(unsafe { base.as_ptr().add(region.size) }, new_size - region.size);
        }

        region.base = base;
        region.size = new_size;
        Ok(())
    }

    fn free(&self, region: StackRegion) {
        let Ok(layout) = Self::layout(region.size) else {
            return;
        };
        // SAFETY:
        // - `region` was produced by `allocate`/`resize` with this exact layout
        //   and ownership is consumed here, so it cannot be freed twice.
        unsafe { heap_alloc::dealloc(region.base.as_ptr(), layout) };
    }

    fn can_allocate(&self, size: usize) -> bool {
        Self::layout(size).is_ok()
    }
}
