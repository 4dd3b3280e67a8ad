//! Scoped interrupts-disabled sections.
//!
//! The previous interrupt-enable state is captured on entry and restored
//! when the guard drops, including while unwinding out of a fatal path.

/// Minimal interrupt-flag control a platform must provide.
pub trait InterruptControl {
    /// Returns whether maskable interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;

    /// Masks maskable interrupts.
    fn disable_interrupts(&self);

    /// Unmasks maskable interrupts.
    fn enable_interrupts(&self);
}

/// RAII guard for an interrupts-disabled region.
///
/// Nested sections are fine: only the outermost one re-enables interrupts,
/// because inner guards observe them as already disabled.
#[must_use = "interrupts are re-enabled as soon as the guard is dropped"]
pub struct CriticalSection<'a, I: InterruptControl + ?Sized> {
    irq: &'a I,
    interrupts_were_enabled: bool,
}

impl<'a, I: InterruptControl + ?Sized> CriticalSection<'a, I> {
    /// Disables interrupts and remembers whether they were enabled before.
    pub fn enter(irq: &'a I) -> Self {
        let interrupts_were_enabled = irq.interrupts_enabled();
        irq.disable_interrupts();
        Self {
            irq,
            interrupts_were_enabled,
        }
    }

    /// Whether interrupts will be re-enabled when this section ends.
    pub fn restores_interrupts(&self) -> bool {
        self.interrupts_were_enabled
    }
}

impl<I: InterruptControl + ?Sized> Drop for CriticalSection<'_, I> {
    fn drop(&mut self) {
        if self.interrupts_were_enabled {
            self.irq.enable_interrupts();
        }
    }
}
