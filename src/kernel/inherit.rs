// Priority inheritance for mutual-exclusion resources

use crate::arch::Port;
use crate::kernel::list::NodeId;
use crate::kernel::scheduler::{event_value, Kernel, State};
use crate::kernel::types::*;

/// Number of mutual-exclusion resources a task currently holds
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HeldResources(u16);

impl HeldResources {
    pub const fn new() -> Self {
        HeldResources(0)
    }

    pub fn acquire(&mut self) {
        self.0 += 1;
    }

    /// Releasing more than was acquired leaves the count at zero
    pub fn release(&mut self) {
        self.0 = self.0.saturating_sub(1);
    }

    pub const fn count(self) -> u16 {
        self.0
    }
}

impl State {
    /// Record that the running task took a resource and return it
    pub(super) fn take_mutex_holder(&mut self) -> Option<TaskId> {
        let id = self.current?;
        self.tcb_mut(id).held.acquire();
        Some(id)
    }

    /// Move `id` to `priority`. A ready task changes ready list; a queued
    /// waiter keeps its place but later waiters sort against the new value.
    fn reprioritise(&mut self, id: TaskId, priority: Priority) {
        self.lists.set_value(NodeId::event(id), event_value(priority));

        if self.is_ready(id) {
            self.remove_state(id);
            self.tcb_mut(id).priority = priority;
            self.ready_add(id);
        } else {
            self.tcb_mut(id).priority = priority;
        }
    }

    /// Raise `holder` to the running task's priority if it is lower.
    /// Returns whether it was raised.
    pub(super) fn priority_inherit(&mut self, holder: TaskId) -> bool {
        let wanted = self.current_priority();
        if self.tcb(holder).priority >= wanted {
            return false;
        }
        self.reprioritise(holder, wanted);
        true
    }

    /// Give back one resource. Once none are held the holder drops to its
    /// base priority; returns whether that happened.
    pub(super) fn priority_disinherit(&mut self, holder: TaskId) -> bool {
        let tcb = self.tcb_mut(holder);
        tcb.held.release();

        if tcb.priority == tcb.base_priority || tcb.held.count() != 0 {
            return false;
        }
        let base = tcb.base_priority;

        // The holder is running, so it sits on a ready list
        self.remove_state(holder);
        self.tcb_mut(holder).priority = base;
        self.lists.set_value(NodeId::event(holder), event_value(base));
        self.ready_add(holder);
        true
    }

    /// A waiter gave up. Drop `holder` to the higher of its base priority
    /// and `highest_waiting`, but only while it holds a single resource.
    pub(super) fn priority_disinherit_after_timeout(
        &mut self,
        holder: TaskId,
        highest_waiting: Priority,
    ) -> bool {
        let tcb = self.tcb(holder);
        let target = tcb.base_priority.max(highest_waiting);
        if tcb.priority == target || tcb.held.count() != 1 {
            return false;
        }
        self.reprioritise(holder, target);
        true
    }
}

impl<P: Port> Kernel<P> {
    /// Count a resource against the running task and return that task
    pub fn take_mutex_holder(&self) -> Option<TaskId> {
        self.critical().take_mutex_holder()
    }

    /// Lend the running task's priority to `holder`
    pub fn priority_inherit(&self, holder: TaskId) -> bool {
        let raised = self.critical().priority_inherit(holder);
        if raised {
            trace!("task {} inherits priority", holder);
        }
        raised
    }

    /// Returns whether the caller should yield
    pub fn priority_disinherit(&self, holder: TaskId) -> bool {
        let restored = self.critical().priority_disinherit(holder);
        if restored {
            trace!("task {} back to base priority", holder);
        }
        restored
    }

    pub fn priority_disinherit_after_timeout(&self, holder: TaskId, highest_waiting: Priority) {
        if self
            .critical()
            .priority_disinherit_after_timeout(holder, highest_waiting)
        {
            trace!("task {} lowered to {} after waiter timeout", holder, highest_waiting);
        }
    }
}
