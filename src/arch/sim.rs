// Host simulation port
//
// Records what the kernel asked of the CPU instead of doing it. Context
// switches never happen on their own: the host drives `switch_context`
// where a hardware port would take the pended interrupt.

use core::cell::Cell;

use super::{IsrMask, Port};
use crate::kernel::types::{TaskEntry, TaskId, TickType};

/// Words reserved below the stack top for the simulated register frame
pub const SIM_FRAME_WORDS: usize = 16;

#[derive(Debug, Default)]
pub struct SimPort {
    depth: Cell<usize>,
    isr_masked: Cell<bool>,
    schedule_requests: Cell<usize>,
    started: Cell<bool>,
    tickless_calls: Cell<usize>,
    last_tickless: Cell<TickType>,
    overflowed: Cell<Option<TaskId>>,
}

impl SimPort {
    pub const fn new() -> Self {
        SimPort {
            depth: Cell::new(0),
            isr_masked: Cell::new(false),
            schedule_requests: Cell::new(0),
            started: Cell::new(false),
            tickless_calls: Cell::new(0),
            last_tickless: Cell::new(TickType::zero()),
            overflowed: Cell::new(None),
        }
    }

    /// Current critical-section nesting
    pub fn lock_depth(&self) -> usize {
        self.depth.get()
    }

    pub fn isr_masked(&self) -> bool {
        self.isr_masked.get()
    }

    /// Number of context-switch requests since the last call, which resets
    /// the counter
    pub fn take_schedule_requests(&self) -> usize {
        self.schedule_requests.replace(0)
    }

    pub fn started(&self) -> bool {
        self.started.get()
    }

    /// Calls to `tickless_idle` and the tick count last asked for
    pub fn tickless(&self) -> (usize, TickType) {
        (self.tickless_calls.get(), self.last_tickless.get())
    }

    /// Task reported by the last stack overflow check, cleared on read
    pub fn take_stack_overflow(&self) -> Option<TaskId> {
        self.overflowed.take()
    }
}

impl Port for SimPort {
    fn interrupt_lock(&self) {
        self.depth.set(self.depth.get() + 1);
    }

    fn interrupt_unlock(&self) {
        let depth = self.depth.get();
        assert!(depth > 0, "unbalanced interrupt_unlock");
        self.depth.set(depth - 1);
    }

    fn mask_from_isr(&self) -> IsrMask {
        self.isr_masked.replace(true) as IsrMask
    }

    fn unmask_from_isr(&self, saved: IsrMask) {
        self.isr_masked.set(saved != 0);
    }

    fn request_schedule(&self) {
        self.schedule_requests.set(self.schedule_requests.get() + 1);
    }

    unsafe fn initialize_stack(&self, top: *mut usize, entry: TaskEntry, arg: usize) -> *mut usize {
        let sp = top.sub(SIM_FRAME_WORDS);
        for i in 0..SIM_FRAME_WORDS {
            sp.add(i).write(0);
        }
        sp.write(entry as usize);
        sp.add(1).write(arg);
        sp
    }

    fn start_scheduler(&self) {
        self.started.set(true);
    }

    fn tickless_idle(&self, expected: TickType) -> TickType {
        self.tickless_calls.set(self.tickless_calls.get() + 1);
        self.last_tickless.set(expected);
        expected
    }

    fn stack_overflow(&self, task: TaskId) {
        self.overflowed.set(Some(task));
    }
}
