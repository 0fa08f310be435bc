//! Preemptive fixed-priority kernel for single-core microcontrollers.
//!
//! A [`Kernel`] owns every task, list and synchronization object and talks
//! to the CPU only through a [`Port`]. [`SimPort`] runs the kernel on a host
//! for testing; `arch::riscv` drives a RISC-V machine-mode core.
//!
//! ```
//! use mindgrove_kernel::{Kernel, KernelConfig, SimPort, TaskState, TickType};
//!
//! extern "C" fn worker(_: usize) -> ! {
//!     loop {}
//! }
//!
//! fn leak(words: usize) -> &'static mut [usize] {
//!     Box::leak(vec![0usize; words].into_boxed_slice())
//! }
//!
//! let kernel: &'static Kernel<SimPort> =
//!     Box::leak(Box::new(Kernel::new(SimPort::new(), KernelConfig::new())));
//!
//! let id = kernel.task_create(worker, 0, leak(256), 3, "worker").unwrap();
//! kernel.start(leak(256)).unwrap();
//! assert_eq!(kernel.task_state(id), TaskState::Running);
//! assert_eq!(kernel.tick_count(), TickType::zero());
//! ```
#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
mod fmt;

pub mod arch;
pub mod kernel;

pub use arch::{CriticalSection, IsrMask, Port, SimPort};
pub use kernel::{
    config, HeldResources, Kernel, KernelConfig, MutexId, Priority, PriorityLookup, QueueId,
    Result, RtosError, SchedulerState, SigState, Stack, StackSize, TaskEntry, TaskId, TaskName,
    TaskState, TickType, TimeOut,
};
