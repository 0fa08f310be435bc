// Time base: tick counter, overflow periods, timeouts, tickless idle

use crate::arch::Port;
use crate::kernel::list::ListId;
use crate::kernel::scheduler::{Kernel, State};
use crate::kernel::types::*;

/// Snapshot of the time base taken when a blocking call starts waiting
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TimeOut {
    overflow_count: u32,
    entered_at: TickType,
}

impl State {
    /// Advance time by one tick and wake every task whose deadline passed.
    /// Returns whether a switch is needed.
    pub(super) fn increment_tick(&mut self) -> bool {
        let mut need_switch = false;

        if self.sched_locked == 0 {
            let now = self.tick.wrapping_add(TickType::new(1));
            self.tick = now;

            if now.is_zero() {
                self.switch_pend_lists();
            }

            if now >= self.next_unblock {
                loop {
                    let Some(node) = self.lists.head(self.pend) else {
                        self.next_unblock = TickType::FOREVER;
                        break;
                    };
                    let wake = TickType(self.lists.value(node));
                    if now < wake {
                        self.next_unblock = wake;
                        break;
                    }

                    let id = node.owner();
                    self.remove_state(id);
                    self.remove_event(id);
                    self.ready_add(id);

                    if self.tcb(id).priority >= self.current_priority() {
                        need_switch = true;
                    }
                }
            }
        } else {
            self.pended_ticks += 1;
        }

        need_switch || self.need_schedule
    }

    /// The far list becomes the near list when the counter wraps
    fn switch_pend_lists(&mut self) {
        core::mem::swap(&mut self.pend, &mut self.far_pend);
        self.overflow_count = self.overflow_count.wrapping_add(1);
        self.update_unblock_time();
    }

    pub(super) fn timeout_state(&self) -> TimeOut {
        TimeOut {
            overflow_count: self.overflow_count,
            entered_at: self.tick,
        }
    }

    pub(super) fn check_timeout(&self, timeout: &mut TimeOut, remaining: &mut TickType) -> bool {
        if remaining.is_forever() {
            return false;
        }

        let now = self.tick;
        if self.overflow_count != timeout.overflow_count && now >= timeout.entered_at {
            // A whole overflow period went by
            return true;
        }

        let elapsed = now.elapsed_since(timeout.entered_at);
        if elapsed < *remaining {
            *remaining = TickType(remaining.0 - elapsed.0);
            *timeout = self.timeout_state();
            false
        } else {
            *remaining = TickType::zero();
            true
        }
    }

    fn expected_idle_ticks(&self) -> TickType {
        if self.current_priority() > config::IDLE_PRIORITY
            || self.lists.len(ListId::ready(config::IDLE_PRIORITY)) > 1
        {
            TickType::zero()
        } else {
            self.next_unblock.elapsed_since(self.tick)
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Tick interrupt handler body. Returns whether the port should request
    /// a switch.
    pub fn tick(&self) -> bool {
        self.critical_from_isr().increment_tick()
    }

    pub fn tick_count(&self) -> TickType {
        self.critical().tick
    }

    pub fn tick_count_from_isr(&self) -> TickType {
        self.critical_from_isr().tick
    }

    /// How many times the tick counter has wrapped
    pub fn overflow_count(&self) -> u32 {
        self.critical().overflow_count
    }

    /// Start measuring a wait
    pub fn set_timeout_state(&self) -> TimeOut {
        self.critical().timeout_state()
    }

    /// True once the wait has run out. Otherwise `remaining` shrinks by the
    /// time already waited and `timeout` restarts from now.
    pub fn check_timeout(&self, timeout: &mut TimeOut, remaining: &mut TickType) -> bool {
        self.critical().check_timeout(timeout, remaining)
    }

    /// Add ticks that passed while the tick interrupt was stopped. Ignored
    /// if it would step over the next wake-up.
    pub fn fix_tick(&self, delta: TickType) {
        let mut s = self.critical();
        match s.tick.0.checked_add(delta.0) {
            Some(target) if target <= s.next_unblock.0 => s.tick = TickType(target),
            Some(_) => {}
            None => {
                // Crossing the wrap needs the list switch
                for _ in 0..delta.0 {
                    s.increment_tick();
                }
            }
        }
    }

    /// Ticks until the next task is due, or zero if something other than
    /// the idle task wants the CPU
    pub fn expected_idle_ticks(&self) -> TickType {
        self.critical().expected_idle_ticks()
    }

    /// Tickless idle is only safe with no readied task waiting in the pool
    /// and no deferred switch
    pub fn low_power_allowed(&self) -> bool {
        let s = self.critical();
        s.lists.is_empty(ListId::READY_POOL) && !s.need_schedule
    }

    /// Put the core to sleep when the wait is long enough to be worth it
    pub(super) fn idle_low_power(&self) {
        let min = self.critical().config.low_power_min_ticks;
        if self.expected_idle_ticks() < min {
            return;
        }

        self.lock();
        // Sample again now that no task can run
        let expected = self.expected_idle_ticks();
        if expected >= min && self.low_power_allowed() {
            let slept = self.port().tickless_idle(expected);
            self.fix_tick(slept);
        }
        self.unlock();
    }

    /// Block the running task for `ticks`. Zero just yields.
    pub fn task_sleep(&self, ticks: TickType) {
        let mut already_scheduled = false;
        if !ticks.is_zero() {
            self.lock();
            {
                let mut s = self.critical();
                let id = s.resolve(None);
                s.pend_add(id, ticks, false);
            }
            already_scheduled = self.unlock();
        }
        if !already_scheduled {
            self.port().request_schedule();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::list::NodeId;
    use crate::kernel::settings::KernelConfig;
    use crate::kernel::testing::*;

    fn advance(k: &Kernel<crate::arch::SimPort>, ticks: u32) -> bool {
        let mut need = false;
        for _ in 0..ticks {
            need |= k.tick();
        }
        need
    }

    /// Where a task's state node sits, for tests
    fn pending_list_of(k: &Kernel<impl Port>, id: TaskId) -> Option<&'static str> {
        let s = k.critical();
        let container = s.lists.container(NodeId::state(id))?;
        if container == s.pend {
            Some("near")
        } else if container == s.far_pend {
            Some("far")
        } else {
            None
        }
    }

    #[test]
    fn sleeping_task_wakes_exactly_on_deadline() {
        let k = started(KernelConfig::new());
        let sleeper = spawn(k, 2, "sleeper");
        k.switch_context();
        let entered = k.tick_count();

        k.task_sleep(TickType::new(5));
        k.switch_context();
        assert_eq!(k.task_state(sleeper), TaskState::Blocked);

        assert!(!advance(k, 4));
        assert_eq!(k.task_state(sleeper), TaskState::Blocked);
        assert!(advance(k, 1));
        assert_eq!(k.tick_count(), entered.wrapping_add(TickType::new(5)));
        assert_eq!(k.task_state(sleeper), TaskState::Ready);
        assert_consistent(k);
    }

    #[test]
    fn pending_list_is_ordered_by_deadline() {
        let k = started(KernelConfig::new());
        let slow = spawn(k, 3, "slow");
        k.switch_context();
        k.task_sleep(TickType::new(10));
        k.switch_context();

        let fast = spawn(k, 2, "fast");
        k.switch_context();
        assert_eq!(k.current_task(), Some(fast));
        k.task_sleep(TickType::new(3));
        k.switch_context();

        advance(k, 3);
        assert_eq!(k.task_state(fast), TaskState::Ready);
        assert_eq!(k.task_state(slow), TaskState::Blocked);
        advance(k, 7);
        assert_eq!(k.task_state(slow), TaskState::Ready);
    }

    #[test]
    fn ticks_while_locked_are_replayed_on_unlock() {
        let k = started(KernelConfig::new());
        let sleeper = spawn(k, 2, "sleeper");
        k.switch_context();
        k.task_sleep(TickType::new(2));
        k.switch_context();
        let before = k.tick_count();

        k.lock();
        assert!(!advance(k, 3));
        assert_eq!(k.tick_count(), before);
        assert_eq!(k.task_state(sleeper), TaskState::Blocked);

        assert!(k.unlock());
        assert_eq!(k.tick_count(), before.wrapping_add(TickType::new(3)));
        assert_eq!(k.task_state(sleeper), TaskState::Ready);
    }

    #[test]
    fn wrap_moves_far_deadlines_to_near_list() {
        let start = TickType::new(u32::MAX - 3);
        let k = started(KernelConfig::new().initial_tick(start));
        let early = spawn(k, 2, "early");
        let late = spawn(k, 3, "late");

        k.switch_context();
        assert_eq!(k.current_task(), Some(late));
        // Wakes at 4 after the wrap
        k.task_sleep(TickType::new(8));
        k.switch_context();
        assert_eq!(pending_list_of(k, late), Some("far"));

        assert_eq!(k.current_task(), Some(early));
        // Wakes at u32::MAX - 1, before the wrap
        k.task_sleep(TickType::new(2));
        k.switch_context();
        assert_eq!(pending_list_of(k, early), Some("near"));

        advance(k, 2);
        assert_eq!(k.task_state(early), TaskState::Ready);
        assert_eq!(k.task_state(late), TaskState::Blocked);

        // Cross the wrap: tick goes MAX-1 -> MAX -> 0
        advance(k, 2);
        assert_eq!(k.tick_count(), TickType::zero());
        assert_eq!(k.overflow_count(), 1);
        assert_eq!(pending_list_of(k, late), Some("near"));
        assert_eq!(k.task_state(late), TaskState::Blocked);

        advance(k, 3);
        assert_eq!(k.task_state(late), TaskState::Blocked);
        advance(k, 1);
        assert_eq!(k.tick_count(), TickType::new(4));
        assert_eq!(k.task_state(late), TaskState::Ready);
        assert_consistent(k);
    }

    #[test]
    fn timeout_shrinks_remaining_and_expires() {
        let k = started(KernelConfig::new());
        let mut timeout = k.set_timeout_state();
        let mut remaining = TickType::new(5);

        advance(k, 2);
        assert!(!k.check_timeout(&mut timeout, &mut remaining));
        assert_eq!(remaining, TickType::new(3));

        advance(k, 3);
        assert!(k.check_timeout(&mut timeout, &mut remaining));
    }

    #[test]
    fn forever_never_times_out() {
        let k = started(KernelConfig::new());
        let mut timeout = k.set_timeout_state();
        let mut remaining = TickType::FOREVER;
        advance(k, 100);
        assert!(!k.check_timeout(&mut timeout, &mut remaining));
    }

    #[test]
    fn timeout_is_measured_across_the_wrap() {
        let k = started(KernelConfig::new().initial_tick(TickType::new(u32::MAX - 1)));
        let mut timeout = k.set_timeout_state();
        let mut remaining = TickType::new(10);
        advance(k, 4);
        assert_eq!(k.overflow_count(), 1);
        assert!(!k.check_timeout(&mut timeout, &mut remaining));
        assert_eq!(remaining, TickType::new(6));
    }

    #[test]
    fn fix_tick_stops_short_of_next_wake() {
        let k = started(KernelConfig::new());
        spawn(k, 2, "sleeper");
        k.switch_context();
        k.task_sleep(TickType::new(10));
        k.switch_context();

        k.fix_tick(TickType::new(4));
        assert_eq!(k.tick_count(), TickType::new(4));
        k.fix_tick(TickType::new(7));
        assert_eq!(k.tick_count(), TickType::new(4));
        assert_eq!(k.expected_idle_ticks(), TickType::new(6));
    }

    #[test]
    fn idle_sleeps_through_quiet_period() {
        let k = started(KernelConfig::new().low_power(TickType::new(3)));
        let sleeper = spawn(k, 1, "sleeper");
        k.switch_context();
        k.task_sleep(TickType::new(20));
        k.switch_context();
        assert_ne!(k.current_task(), Some(sleeper));

        assert!(k.low_power_allowed());
        k.idle_step();
        assert_eq!(k.port().tickless(), (1, TickType::new(20)));
        assert_eq!(k.tick_count(), TickType::new(20));

        // The deadline itself is delivered by the next real tick
        assert!(k.tick());
        assert_eq!(k.task_state(sleeper), TaskState::Ready);
    }

    #[test]
    fn no_tickless_sleep_when_work_is_due_soon() {
        let k = started(KernelConfig::new().low_power(TickType::new(3)));
        spawn(k, 1, "sleeper");
        k.switch_context();
        k.task_sleep(TickType::new(2));
        k.switch_context();

        k.idle_step();
        assert_eq!(k.port().tickless().0, 0);
    }
}
