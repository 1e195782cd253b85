use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Hardware primitive for enabling and disabling interrupts on this core.
pub trait InterruptControl: Send + Sync {
    /// Disable interrupts, returning whether they were enabled before.
    fn disable(&self) -> bool;

    /// Restore the state returned by a matching `disable`.
    fn restore(&self, was_enabled: bool);
}

/// Interrupts stay masked until this guard is dropped.
pub struct SplGuard<'a> {
    control: &'a dyn InterruptControl,
    was_enabled: bool,
}

/// Raise to the highest priority level (mask all interrupts).
pub fn splhigh(control: &dyn InterruptControl) -> SplGuard<'_> {
    let was_enabled = control.disable();
    SplGuard {
        control,
        was_enabled,
    }
}

impl Drop for SplGuard<'_> {
    fn drop(&mut self) {
        self.control.restore(self.was_enabled);
    }
}

/// Interrupt flag of a hosted core.
///
/// Counts how many masked sections were entered so callers can check that
/// TLB work really happened with interrupts off.
pub struct SimulatedInterrupts {
    enabled: AtomicBool,
    masked_sections: AtomicUsize,
}

impl SimulatedInterrupts {
    pub const fn new() -> Self {
        SimulatedInterrupts {
            enabled: AtomicBool::new(true),
            masked_sections: AtomicUsize::new(0),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn masked_sections(&self) -> usize {
        self.masked_sections.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl InterruptControl for SimulatedInterrupts {
    fn disable(&self) -> bool {
        self.masked_sections.fetch_add(1, Ordering::SeqCst);
        self.enabled.swap(false, Ordering::SeqCst)
    }

    fn restore(&self, was_enabled: bool) {
        self.enabled.store(was_enabled, Ordering::SeqCst);
    }
}
