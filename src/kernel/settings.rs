// Runtime kernel configuration

use crate::kernel::types::{config, TickType};

/// How the scheduler finds the highest non-empty ready list
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PriorityLookup {
    /// Leading-zero count over a bitmap of non-empty levels
    Bitmap,
    /// Walk down from the top priority
    Scan,
}

/// Settings fixed when the kernel is constructed
///
/// ```
/// use mindgrove_kernel::{KernelConfig, PriorityLookup, TickType};
///
/// const CONFIG: KernelConfig = KernelConfig::new()
///     .priority_lookup(PriorityLookup::Scan)
///     .low_power(TickType::new(5));
/// assert!(CONFIG.low_power);
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct KernelConfig {
    /// Tick value loaded by `start`
    pub initial_tick: TickType,
    pub priority_lookup: PriorityLookup,
    /// Let the idle task stop the tick while nothing is due
    pub low_power: bool,
    /// Shortest expected idle period worth stopping the tick for
    pub low_power_min_ticks: TickType,
}

impl KernelConfig {
    pub const fn new() -> Self {
        KernelConfig {
            initial_tick: TickType::zero(),
            priority_lookup: if config::MAX_PRIORITIES <= 32 {
                PriorityLookup::Bitmap
            } else {
                PriorityLookup::Scan
            },
            low_power: false,
            low_power_min_ticks: TickType::new(2),
        }
    }

    pub const fn initial_tick(mut self, tick: TickType) -> Self {
        self.initial_tick = tick;
        self
    }

    /// Falls back to `Scan` if there are more levels than bitmap bits
    pub const fn priority_lookup(mut self, lookup: PriorityLookup) -> Self {
        self.priority_lookup = match lookup {
            PriorityLookup::Bitmap if config::MAX_PRIORITIES > 32 => PriorityLookup::Scan,
            other => other,
        };
        self
    }

    pub const fn low_power(mut self, min_ticks: TickType) -> Self {
        self.low_power = true;
        self.low_power_min_ticks = min_ticks;
        self
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}
