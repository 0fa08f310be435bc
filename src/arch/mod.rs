// CPU port layer
//
// The kernel core never touches registers or interrupt controllers. Every
// architecture-specific action goes through a `Port`.

use crate::kernel::types::{TaskEntry, TaskId, TickType};

#[cfg(target_arch = "riscv64")]
pub mod riscv;
pub mod sim;

pub use sim::SimPort;

/// Interrupt state saved by `Port::mask_from_isr`
pub type IsrMask = usize;

/// Services the kernel consumes from the CPU port
pub trait Port {
    /// Enter a nestable critical section. Only the outermost call masks.
    fn interrupt_lock(&self);

    /// Leave a critical section. Interrupts are unmasked when nesting
    /// returns to zero.
    fn interrupt_unlock(&self);

    /// Non-nesting mask for use inside interrupt handlers
    fn mask_from_isr(&self) -> IsrMask;

    fn unmask_from_isr(&self, saved: IsrMask);

    /// Pend a context switch. Safe from task and interrupt context; the
    /// switch happens once no critical section is held.
    fn request_schedule(&self);

    /// Build the initial register frame for a task that has never run.
    ///
    /// # Safety
    /// `top` must point one past the end of a writable stack large enough
    /// for the port's frame.
    unsafe fn initialize_stack(&self, top: *mut usize, entry: TaskEntry, arg: usize) -> *mut usize;

    /// Enable the tick source and run the first task. Hardware ports do not
    /// return from here.
    fn start_scheduler(&self);

    /// Stop the tick for up to `expected` ticks. Returns the number of
    /// ticks actually slept, which the kernel adds back with `fix_tick`.
    fn tickless_idle(&self, expected: TickType) -> TickType {
        let _ = expected;
        TickType::zero()
    }

    /// Called at switch time when `task` has run past the bottom of its
    /// stack. The default halts the core.
    fn stack_overflow(&self, task: TaskId) {
        let _ = task;
        loop {
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// CRITICAL SECTION GUARD
// ============================================================================

/// RAII guard for critical sections
///
/// Restores the interrupt state it entered with when dropped
pub struct CriticalSection<'a, P: Port + ?Sized> {
    port: &'a P,
    saved: Option<IsrMask>,
}

impl<'a, P: Port + ?Sized> CriticalSection<'a, P> {
    /// Enter from task context (nestable)
    pub fn enter(port: &'a P) -> Self {
        port.interrupt_lock();
        CriticalSection { port, saved: None }
    }

    /// Enter from interrupt context
    pub fn enter_from_isr(port: &'a P) -> Self {
        let saved = port.mask_from_isr();
        CriticalSection {
            port,
            saved: Some(saved),
        }
    }
}

impl<P: Port + ?Sized> Drop for CriticalSection<'_, P> {
    fn drop(&mut self) {
        match self.saved {
            Some(mask) => self.port.unmask_from_isr(mask),
            None => self.port.interrupt_unlock(),
        }
    }
}
