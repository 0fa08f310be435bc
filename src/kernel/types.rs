// Core types for the kernel

use core::fmt;

/// Priority type - higher number = higher priority
/// Range: 0 (idle) to MAX_PRIORITIES-1 (highest)
pub type Priority = usize;

/// Task entry point. The argument given to `task_create` arrives in the
/// first argument register.
pub type TaskEntry = extern "C" fn(usize) -> !;

/// Stack memory handed to a task for its whole lifetime, in words
pub type Stack = &'static mut [usize];

/// Tick counter - wraps at 32 bits, wrap is handled by the time base
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TickType(pub u32);

impl TickType {
    /// Block without a deadline. Also the "nothing pending" marker for the
    /// next-unblock cache.
    pub const FOREVER: TickType = TickType(u32::MAX);

    pub const fn new(value: u32) -> Self {
        TickType(value)
    }

    pub const fn zero() -> Self {
        TickType(0)
    }

    pub const fn max() -> Self {
        Self::FOREVER
    }

    pub const fn is_forever(self) -> bool {
        self.0 == u32::MAX
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn wrapping_add(self, other: TickType) -> TickType {
        TickType(self.0.wrapping_add(other.0))
    }

    pub fn elapsed_since(self, earlier: TickType) -> TickType {
        TickType(self.0.wrapping_sub(earlier.0))
    }

    /// Convert from milliseconds at `config::TICK_RATE_HZ`
    pub fn from_ms(ms: u32) -> Self {
        let ticks = (ms as u64 * config::TICK_RATE_HZ as u64) / 1000;
        TickType(ticks.min(u32::MAX as u64 - 1) as u32)
    }
}

impl fmt::Display for TickType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Handle to a task slot in the kernel's task arena
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub(crate) u16);

impl TaskId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw handle value, e.g. to pass as a task argument
    pub const fn into_raw(self) -> usize {
        self.0 as usize
    }

    /// Rebuild a handle from `into_raw`. A value that never came from
    /// `into_raw` names a stale slot and panics on use.
    pub const fn from_raw(raw: usize) -> Self {
        TaskId(raw as u16)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{:02}", self.0)
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for TaskId {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "T{=u16:02}", self.0)
    }
}

/// Handle to a message queue slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct QueueId(pub(crate) u8);

impl QueueId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn into_raw(self) -> usize {
        self.0 as usize
    }

    pub const fn from_raw(raw: usize) -> Self {
        QueueId(raw as u8)
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.0)
    }
}

/// Handle to a mutex slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MutexId(pub(crate) u8);

impl MutexId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub const fn into_raw(self) -> usize {
        self.0 as usize
    }

    pub const fn from_raw(raw: usize) -> Self {
        MutexId(raw as u8)
    }
}

impl fmt::Display for MutexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Task states, as derived from list membership
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TaskState {
    Running,
    Ready,
    Blocked,
    Suspended,
    /// Deleted while running, waiting for the idle task to reclaim it
    PendingRecycle,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerState {
    NotStarted,
    Running,
    Locked,
}

pub type StackSize = usize;

/// Error types for kernel operations
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RtosError {
    /// No free slot in the task, queue or mutex arena
    OutOfMemory,
    InvalidParameter,
    /// A blocking call waited for its full timeout
    Timeout,
    QueueFull,
    QueueEmpty,
    /// Zero-wait acquisition of a held mutex
    ResourceBusy,
}

impl fmt::Display for RtosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            RtosError::OutOfMemory => "out of memory",
            RtosError::InvalidParameter => "invalid parameter",
            RtosError::Timeout => "timed out",
            RtosError::QueueFull => "queue full",
            RtosError::QueueEmpty => "queue empty",
            RtosError::ResourceBusy => "resource busy",
        };
        f.write_str(msg)
    }
}

pub type Result<T> = core::result::Result<T, RtosError>;

//Configuration constants
pub mod config {
    use super::*;

    /// Maximum number of priority levels
    pub const MAX_PRIORITIES: usize = 32;

    /// Idle task priority (always 0)
    pub const IDLE_PRIORITY: Priority = 0;

    /// Task arena size, idle task included
    pub const MAX_TASKS: usize = 16;

    pub const MAX_QUEUES: usize = 8;

    pub const MAX_MUTEXES: usize = 4;

    /// Minimum task stack size (in words)
    pub const MIN_STACK_SIZE: StackSize = 128;

    pub const MAX_TASK_NAME_LEN: usize = 16;

    /// Counting signals saturate here; further emits are rejected
    pub const SIGNAL_MAX_COUNT: isize = 16;

    /// System tick frequency in Hz
    pub const TICK_RATE_HZ: u32 = 1000; // 1ms tick

    /// Stack fill pattern for debugging
    pub const STACK_FILL_BYTE: u8 = 0xa5;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_arithmetic_wraps() {
        let near_end = TickType::new(u32::MAX - 1);
        assert_eq!(near_end.wrapping_add(TickType::new(3)), TickType::new(1));
        assert_eq!(TickType::new(2).elapsed_since(near_end), TickType::new(4));
    }

    #[test]
    fn forever_is_the_maximum_tick() {
        assert!(TickType::FOREVER.is_forever());
        assert_eq!(TickType::max(), TickType::FOREVER);
        assert!(!TickType::new(5).is_forever());
    }

    #[test]
    fn from_ms_saturates_below_forever() {
        assert_eq!(TickType::from_ms(10), TickType::new(10));
        assert!(!TickType::from_ms(u32::MAX).is_forever());
    }
}
