// Per-task signal channel
//
// One waiter (the task itself), any number of emitters. The counting form
// treats the value as a saturating semaphore; the message form carries a
// single word.

use crate::arch::Port;
use crate::kernel::list::{ListId, NodeId};
use crate::kernel::scheduler::{Kernel, State};
use crate::kernel::types::*;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SigState {
    NotWaiting,
    Waiting,
    Received,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct Signal {
    pub(super) state: SigState,
    pub(super) value: isize,
}

impl Signal {
    pub(super) const fn new() -> Self {
        Signal {
            state: SigState::NotWaiting,
            value: 0,
        }
    }
}

impl State {
    /// Mark the running task as waiting and block it if `ticks` allows.
    /// Returns whether it was parked.
    fn signal_park(&mut self, ticks: TickType) -> bool {
        let id = self.resolve(None);
        self.tcb_mut(id).signal.state = SigState::Waiting;
        if ticks.is_zero() {
            return false;
        }
        self.pend_add(id, ticks, true);
        true
    }

    /// Set `id` to Received. If it was waiting, make it ready (or park it in
    /// the ready pool from an interrupt while the scheduler is locked).
    /// Returns whether it outranks the running task.
    fn signal_wake(&mut self, id: TaskId, old: SigState, from_isr: bool) -> bool {
        if old != SigState::Waiting {
            return false;
        }

        if from_isr && self.sched_locked > 0 {
            self.lists.insert_end(ListId::READY_POOL, NodeId::event(id));
        } else {
            self.remove_state(id);
            self.ready_add(id);
            if !from_isr {
                self.update_unblock_time();
            }
        }
        self.tcb(id).priority > self.current_priority()
    }

    /// Returns (accepted, outranks)
    fn signal_emit(&mut self, id: TaskId, from_isr: bool) -> (bool, bool) {
        let signal = &mut self.tcb_mut(id).signal;
        let old = signal.state;
        signal.state = SigState::Received;
        let accepted = signal.value < config::SIGNAL_MAX_COUNT;
        if accepted {
            signal.value += 1;
        }
        (accepted, self.signal_wake(id, old, from_isr))
    }

    fn signal_emit_msg(&mut self, id: TaskId, value: isize, overwrite: bool, from_isr: bool) -> (bool, bool) {
        let signal = &mut self.tcb_mut(id).signal;
        let old = signal.state;
        signal.state = SigState::Received;
        let accepted = old != SigState::Received || overwrite;
        if accepted {
            signal.value = value;
        }
        (accepted, self.signal_wake(id, old, from_isr))
    }
}

impl<P: Port> Kernel<P> {
    /// Wait until the count is non-zero, then take one. Returns false on
    /// timeout. A zero wait only polls.
    pub fn signal_wait(&self, ticks: TickType) -> bool {
        self.signal_wait_begin(ticks);
        self.signal_wait_finish()
    }

    /// First half of `signal_wait`: block if nothing is pending. Returns
    /// whether the caller was parked and a switch requested.
    pub(crate) fn signal_wait_begin(&self, ticks: TickType) -> bool {
        let parked = {
            let mut s = self.critical();
            let id = s.resolve(None);
            s.tcb(id).signal.value == 0 && s.signal_park(ticks)
        };
        if parked {
            self.port().request_schedule();
        }
        parked
    }

    /// Second half of `signal_wait`, run once the caller is back on the CPU
    pub(crate) fn signal_wait_finish(&self) -> bool {
        let mut s = self.critical();
        let id = s.resolve(None);
        let signal = &mut s.tcb_mut(id).signal;
        let taken = signal.value > 0;
        if taken {
            signal.value -= 1;
        }
        signal.state = SigState::NotWaiting;
        taken
    }

    /// Add one to a task's count, waking it if it waits. Returns false once
    /// the count is saturated.
    pub fn signal_emit(&self, id: TaskId) -> bool {
        let (accepted, outranks) = self.critical().signal_emit(id, false);
        if outranks {
            self.port().request_schedule();
        }
        accepted
    }

    pub fn signal_emit_from_isr(&self, id: TaskId) -> bool {
        let (accepted, outranks) = self.critical_from_isr().signal_emit(id, true);
        if outranks {
            self.port().request_schedule();
        }
        accepted
    }

    /// Wait for a message value. `None` on timeout.
    pub fn signal_wait_msg(&self, ticks: TickType) -> Option<isize> {
        self.signal_wait_msg_begin(ticks);
        self.signal_wait_msg_finish()
    }

    pub(crate) fn signal_wait_msg_begin(&self, ticks: TickType) -> bool {
        let parked = {
            let mut s = self.critical();
            let id = s.resolve(None);
            if s.tcb(id).signal.state == SigState::Received {
                false
            } else {
                s.tcb_mut(id).signal.value = 0;
                s.signal_park(ticks)
            }
        };
        if parked {
            self.port().request_schedule();
        }
        parked
    }

    pub(crate) fn signal_wait_msg_finish(&self) -> Option<isize> {
        let mut s = self.critical();
        let id = s.resolve(None);
        let signal = &mut s.tcb_mut(id).signal;
        let received = signal.state == SigState::Received;
        let value = signal.value;
        if received {
            signal.value = 0;
        }
        signal.state = SigState::NotWaiting;
        received.then_some(value)
    }

    /// Deliver `value`. An undelivered earlier value is only replaced when
    /// `overwrite` is set; otherwise the call returns false.
    pub fn signal_emit_msg(&self, id: TaskId, value: isize, overwrite: bool) -> bool {
        let (accepted, outranks) = self.critical().signal_emit_msg(id, value, overwrite, false);
        if outranks {
            self.port().request_schedule();
        }
        accepted
    }

    pub fn signal_emit_msg_from_isr(&self, id: TaskId, value: isize, overwrite: bool) -> bool {
        let (accepted, outranks) = self
            .critical_from_isr()
            .signal_emit_msg(id, value, overwrite, true);
        if outranks {
            self.port().request_schedule();
        }
        accepted
    }

    /// Discard a received but unconsumed signal. Returns whether there was
    /// one.
    pub fn signal_clear(&self, handle: Option<TaskId>) -> bool {
        let mut s = self.critical();
        let id = s.resolve(handle);
        let signal = &mut s.tcb_mut(id).signal;
        if signal.state != SigState::Received {
            return false;
        }
        signal.state = SigState::NotWaiting;
        signal.value = 0;
        true
    }
}
