// Kernel module - scheduler, time base, tasks and synchronization objects
pub mod inherit;
pub(crate) mod list;
pub mod mutex;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod signal;
pub mod task;
pub mod time;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used items
pub use inherit::HeldResources;
pub use scheduler::Kernel;
pub use settings::{KernelConfig, PriorityLookup};
pub use signal::SigState;
pub use task::TaskName;
pub use time::TimeOut;
pub use types::{
    config, MutexId, Priority, QueueId, Result, RtosError, SchedulerState, Stack, StackSize,
    TaskEntry, TaskId, TaskState, TickType,
};
