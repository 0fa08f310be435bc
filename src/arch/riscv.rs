// RISC-V machine-mode port (QEMU virt, single hart)
//
// Critical sections mask `mstatus.MIE` with a nesting counter. A switch
// requested from task context runs at the outermost unlock; one requested
// from an interrupt runs when the handler finishes. The switch itself is in
// switch.S and saves callee-saved registers plus mepc/mstatus on the
// outgoing stack, so a task can be switched out from inside a trap.

use core::arch::asm;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use riscv::register::{mie, mstatus};

use super::{IsrMask, Port};
use crate::kernel::scheduler::Kernel;
use crate::kernel::types::{config, TaskEntry, TaskId, TickType};

/// Words in the frame built by `rtos_context_switch`
pub const FRAME_WORDS: usize = 16;

/// Stack must be aligned to 16 bytes (RISC-V ABI requirement)
pub const STACK_ALIGNMENT: usize = 16;

/// mstatus for a task that has never run: MPP = machine, MPIE set, MIE
/// clear until `rtos_task_start` enables it
const INITIAL_MSTATUS: usize = 0x1880;

// Frame slots, in words
const FRAME_RA: usize = 0;
const FRAME_S0: usize = 1;
const FRAME_MEPC: usize = 13;
const FRAME_MSTATUS: usize = 14;
const FRAME_A0: usize = 15;

// CLINT on the QEMU virt board
const CLINT_MTIMECMP: usize = 0x0200_4000;
const CLINT_MTIME: usize = 0x0200_BFF8;
const TIMEBASE_HZ: u64 = 10_000_000;
const CYCLES_PER_TICK: u64 = TIMEBASE_HZ / config::TICK_RATE_HZ as u64;

extern "C" {
    /// Save the running context, store its stack pointer through
    /// `from_slot` and resume the context saved at `to_sp`
    fn rtos_context_switch(from_slot: *mut *mut usize, to_sp: *mut usize);

    /// Resume the context saved at `sp` without saving the caller
    fn rtos_start_first(sp: *mut usize) -> !;

    /// First return address of every task: enables interrupts and jumps to
    /// the entry point held in s0 with its argument in a0
    fn rtos_task_start();
}

static KERNEL: AtomicPtr<Kernel<RiscvPort>> = AtomicPtr::new(ptr::null_mut());

fn attached() -> Option<&'static Kernel<RiscvPort>> {
    let kernel = KERNEL.load(Ordering::Acquire);
    // SAFETY: only ever set from a `&'static Kernel` in `attach`
    unsafe { kernel.as_ref() }
}

/// Register the kernel the port switches and ticks. Call before `start`.
pub fn attach(kernel: &'static Kernel<RiscvPort>) {
    KERNEL.store(kernel as *const _ as *mut _, Ordering::Release);
}

#[derive(Debug, Default)]
pub struct RiscvPort {
    depth: AtomicUsize,
    /// MIE state at the outermost lock
    restore_mie: AtomicBool,
    pending: AtomicBool,
    in_isr: AtomicBool,
}

impl RiscvPort {
    pub const fn new() -> Self {
        RiscvPort {
            depth: AtomicUsize::new(0),
            restore_mie: AtomicBool::new(false),
            pending: AtomicBool::new(false),
            in_isr: AtomicBool::new(false),
        }
    }

    /// Switch to whatever the scheduler picks. Runs with interrupts masked
    /// and no critical section held.
    fn switch_now(&self) {
        self.pending.store(false, Ordering::Relaxed);
        let Some(kernel) = attached() else {
            return;
        };

        let sp: usize;
        // SAFETY: reads the stack pointer only
        unsafe { asm!("mv {}, sp", out(reg) sp) };
        kernel.record_stack_pointer(sp as *mut usize);

        let from = kernel.current_task();
        kernel.switch_context();
        let to = kernel.current_task();

        if let (Some(from), Some(to)) = (from, to) {
            if from != to {
                // SAFETY: both slots belong to live tasks; `from` may sit on
                // the recycle list but is not reclaimed while current
                unsafe {
                    let to_sp = *kernel.stack_pointer_slot(to);
                    rtos_context_switch(kernel.stack_pointer_slot(from), to_sp);
                }
            }
        }
    }
}

fn mtime() -> u64 {
    // SAFETY: CLINT register, always mapped on virt
    unsafe { ptr::read_volatile(CLINT_MTIME as *const u64) }
}

fn set_mtimecmp(value: u64) {
    // SAFETY: hart 0 compare register
    unsafe { ptr::write_volatile(CLINT_MTIMECMP as *mut u64, value) }
}

/// Machine timer interrupt body. Wire it to the `MachineTimer` handler.
pub fn timer_interrupt() {
    let Some(kernel) = attached() else {
        return;
    };
    let port = kernel.port();
    set_mtimecmp(mtime() + CYCLES_PER_TICK);

    port.in_isr.store(true, Ordering::Relaxed);
    if kernel.tick() {
        port.pending.store(true, Ordering::Relaxed);
    }
    port.in_isr.store(false, Ordering::Relaxed);

    if port.pending.load(Ordering::Relaxed) {
        port.switch_now();
    }
}

/// Run an interrupt handler body so that switches it requests are taken
/// on the way out
pub fn in_interrupt<R>(f: impl FnOnce() -> R) -> R {
    let Some(kernel) = attached() else {
        return f();
    };
    let port = kernel.port();
    port.in_isr.store(true, Ordering::Relaxed);
    let result = f();
    port.in_isr.store(false, Ordering::Relaxed);
    if port.pending.load(Ordering::Relaxed) {
        port.switch_now();
    }
    result
}

impl Port for RiscvPort {
    fn interrupt_lock(&self) {
        let enabled = mstatus::read().mie();
        riscv::interrupt::disable();
        if self.depth.fetch_add(1, Ordering::Relaxed) == 0 {
            self.restore_mie.store(enabled, Ordering::Relaxed);
        }
    }

    fn interrupt_unlock(&self) {
        if self.depth.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        let restore = self.restore_mie.load(Ordering::Relaxed);
        if self.pending.load(Ordering::Relaxed) && !self.in_isr.load(Ordering::Relaxed) {
            self.switch_now();
        }
        if restore {
            // SAFETY: interrupts were enabled when the outermost lock began
            unsafe { riscv::interrupt::enable() };
        }
    }

    fn mask_from_isr(&self) -> IsrMask {
        let enabled = mstatus::read().mie();
        riscv::interrupt::disable();
        enabled as IsrMask
    }

    fn unmask_from_isr(&self, saved: IsrMask) {
        if saved != 0 {
            // SAFETY: restores the state `mask_from_isr` found
            unsafe { riscv::interrupt::enable() };
        }
    }

    fn request_schedule(&self) {
        self.pending.store(true, Ordering::Relaxed);
        if self.depth.load(Ordering::Relaxed) == 0 && !self.in_isr.load(Ordering::Relaxed) {
            // The outermost unlock takes the switch
            self.interrupt_lock();
            self.interrupt_unlock();
        }
    }

    unsafe fn initialize_stack(&self, top: *mut usize, entry: TaskEntry, arg: usize) -> *mut usize {
        let aligned = (top as usize) & !(STACK_ALIGNMENT - 1);
        let sp = (aligned as *mut usize).sub(FRAME_WORDS);
        for i in 0..FRAME_WORDS {
            sp.add(i).write(0);
        }
        sp.add(FRAME_RA).write(rtos_task_start as usize);
        sp.add(FRAME_S0).write(entry as usize);
        sp.add(FRAME_MEPC).write(entry as usize);
        sp.add(FRAME_MSTATUS).write(INITIAL_MSTATUS);
        sp.add(FRAME_A0).write(arg);
        sp
    }

    fn start_scheduler(&self) {
        let Some(kernel) = attached() else {
            panic!("port started without an attached kernel");
        };
        let Some(first) = kernel.current_task() else {
            panic!("no task to start");
        };

        set_mtimecmp(mtime() + CYCLES_PER_TICK);
        // SAFETY: the handler only runs once a task has enabled MIE
        unsafe { mie::set_mtimer() };

        // SAFETY: the saved stack pointer of a created, never-run task
        unsafe {
            let sp = *kernel.stack_pointer_slot(first);
            rtos_start_first(sp)
        }
    }

    fn tickless_idle(&self, expected: TickType) -> TickType {
        let enabled = mstatus::read().mie();
        riscv::interrupt::disable();

        let start = mtime();
        set_mtimecmp(start + CYCLES_PER_TICK * expected.0 as u64);
        // A pending timer wakes wfi even with MIE clear
        // SAFETY: no memory effects
        unsafe { asm!("wfi") };

        let slept = ((mtime() - start) / CYCLES_PER_TICK).min(expected.0 as u64);
        set_mtimecmp(mtime() + CYCLES_PER_TICK);

        if enabled {
            // SAFETY: restores the entry state
            unsafe { riscv::interrupt::enable() };
        }
        TickType(slept as u32)
    }

    /// Mask everything and park the hart
    fn stack_overflow(&self, _task: TaskId) {
        riscv::interrupt::disable();
        loop {
            // SAFETY: no memory effects
            unsafe { asm!("wfi") };
        }
    }
}
