use heapless::String;

use crate::arch::Port;
use crate::kernel::inherit::HeldResources;
use crate::kernel::list::{ListId, NodeId};
use crate::kernel::scheduler::{event_value, Kernel, State};
use crate::kernel::signal::{SigState, Signal};
use crate::kernel::types::*;

pub type TaskName = String<{ config::MAX_TASK_NAME_LEN }>;

pub(crate) struct Tcb {
    /// Saved stack pointer, written by the port on every switch
    pub(super) stack_top: *mut usize,
    /// Lowest word of the stack (stacks grow downward)
    pub(super) stack_start: *mut usize,
    pub(super) stack_words: StackSize,
    /// Current priority, possibly inherited
    pub(super) priority: Priority,
    /// Assigned priority
    pub(super) base_priority: Priority,
    pub(super) held: HeldResources,
    pub(super) name: TaskName,
    pub(super) tag: isize,
    pub(super) signal: Signal,
}

impl Tcb {
    fn new(name: &str, priority: Priority, stack_start: *mut usize, stack_words: StackSize, stack_top: *mut usize) -> Self {
        Tcb {
            stack_top,
            stack_start,
            stack_words,
            priority,
            base_priority: priority,
            held: HeldResources::new(),
            name: truncated_name(name),
            tag: 0,
            signal: Signal::new(),
        }
    }
}

/// Copy as many whole characters as fit
fn truncated_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

impl State {
    fn allocate_task(&mut self, tcb: Tcb) -> Result<TaskId> {
        let slot = self
            .tasks
            .iter()
            .position(Option::is_none)
            .ok_or(RtosError::OutOfMemory)?;
        let id = TaskId(slot as u16);
        self.lists.set_value(NodeId::event(id), event_value(tcb.priority));
        self.tasks[slot] = Some(tcb);
        Ok(id)
    }

    /// Drop the TCB; its stack goes with it
    fn release_task(&mut self, id: TaskId) {
        self.task_count -= 1;
        self.tasks[id.index()] = None;
    }

    /// Suspended, and not parked in the ready pool by an interrupt nor
    /// waiting on an object
    pub(super) fn is_suspended(&self, id: TaskId) -> bool {
        self.lists.contains(ListId::SUSPENDED, NodeId::state(id))
            && self.lists.container(NodeId::event(id)).is_none()
    }

    fn task_state(&self, id: TaskId) -> TaskState {
        if self.current == Some(id) {
            return TaskState::Running;
        }
        match self.lists.container(NodeId::state(id)) {
            Some(list) if list.is_pending() => TaskState::Blocked,
            Some(ListId::SUSPENDED) => {
                let waiting = self.lists.container(NodeId::event(id)).is_some()
                    || self.tcb(id).signal.state == SigState::Waiting;
                if waiting {
                    TaskState::Blocked
                } else {
                    TaskState::Suspended
                }
            }
            Some(ListId::RECYCLE) => TaskState::PendingRecycle,
            _ => TaskState::Ready,
        }
    }
}

impl<P: Port> Kernel<P> {
    /// Create a task on `stack` and make it ready.
    ///
    /// Priorities above the top level are clamped. Before the scheduler
    /// starts, the new task becomes current if it ranks at least as high as
    /// the current one; afterwards it preempts a lower-priority runner.
    pub fn task_create(
        &self,
        entry: TaskEntry,
        arg: usize,
        stack: Stack,
        priority: Priority,
        name: &str,
    ) -> Result<TaskId> {
        if stack.len() < config::MIN_STACK_SIZE {
            return Err(RtosError::InvalidParameter);
        }
        let priority = priority.min(config::MAX_PRIORITIES - 1);

        stack.fill(usize::from_ne_bytes(
            [config::STACK_FILL_BYTE; core::mem::size_of::<usize>()],
        ));
        let stack_words = stack.len();
        let stack_start = stack.as_mut_ptr();
        // SAFETY: one past the end of the stack slice, which this task now
        // owns for its whole lifetime
        let stack_top = unsafe {
            let top = stack_start.add(stack_words);
            self.port().initialize_stack(top, entry, arg)
        };

        let tcb = Tcb::new(name, priority, stack_start, stack_words, stack_top);

        let (id, preempt) = {
            let mut s = self.critical();
            let id = s.allocate_task(tcb)?;
            s.task_count += 1;

            match s.current {
                None => s.current = Some(id),
                Some(current) => {
                    if !s.running && s.tcb(current).priority <= priority {
                        s.current = Some(id);
                    }
                }
            }
            s.ready_add(id);

            let preempt = s.running && s.current_priority() < priority;
            (id, preempt)
        };

        debug!("task {} '{}' created at priority {}", id, name, priority);
        if preempt {
            self.port().request_schedule();
        }
        Ok(id)
    }

    /// Remove a task (`None` for the caller). A running task is parked on
    /// the recycle list until the idle task reclaims it.
    pub fn task_delete(&self, handle: Option<TaskId>) {
        let (id, was_current, running) = {
            let mut s = self.critical();
            let id = s.resolve(handle);

            s.remove_state(id);
            s.remove_event(id);

            let was_current = s.current == Some(id);
            if was_current {
                s.lists.insert_end(ListId::RECYCLE, NodeId::state(id));
                s.tasks_deleted += 1;
            } else {
                s.release_task(id);
                s.update_unblock_time();
            }
            (id, was_current, s.running)
        };

        debug!("task {} deleted", id);
        if running && was_current {
            self.port().request_schedule();
        }
    }

    /// Free every task that deleted itself. Runs in the idle task.
    pub(super) fn reclaim_deleted(&self) {
        loop {
            let mut s = self.critical();
            if s.tasks_deleted == 0 {
                break;
            }
            let Some(id) = s.lists.head_owner(ListId::RECYCLE) else {
                s.tasks_deleted = 0;
                break;
            };
            if s.current == Some(id) {
                // Still on its own stack until the next switch
                break;
            }
            s.lists.remove(NodeId::state(id));
            s.tasks_deleted -= 1;
            s.release_task(id);
            trace!("reclaimed task {}", id);
        }
    }

    /// Move a task (`None` for the caller) to the suspended list
    pub fn task_suspend(&self, handle: Option<TaskId>) {
        let (id, is_current, running) = {
            let mut s = self.critical();
            let id = s.resolve(handle);

            s.remove_state(id);
            s.remove_event(id);
            s.lists.insert_end(ListId::SUSPENDED, NodeId::state(id));

            let signal = &mut s.tcb_mut(id).signal;
            if signal.state == SigState::Waiting {
                signal.state = SigState::NotWaiting;
            }
            (id, s.current == Some(id), s.running)
        };

        if running {
            self.critical().update_unblock_time();
        }

        if !is_current {
            return;
        }
        if running {
            self.port().request_schedule();
            return;
        }

        let everyone_suspended = {
            let mut s = self.critical();
            let all = s.lists.len(ListId::SUSPENDED) == s.task_count;
            if all {
                s.current = None;
            }
            all
        };
        if !everyone_suspended {
            self.switch_context();
        }
        trace!("task {} suspended itself before start", id);
    }

    /// Make a suspended task ready again
    pub fn task_resume(&self, id: TaskId) {
        let preempt = {
            let mut s = self.critical();
            if s.current == Some(id) || !s.is_suspended(id) {
                return;
            }
            s.remove_state(id);
            s.ready_add(id);
            s.update_unblock_time();
            s.tcb(id).priority >= s.current_priority()
        };
        if preempt {
            self.port().request_schedule();
        }
    }

    /// Resume from an interrupt handler. Returns whether the caller should
    /// request a switch on the way out.
    pub fn task_resume_from_isr(&self, id: TaskId) -> bool {
        let mut s = self.critical_from_isr();
        if !s.is_suspended(id) {
            return false;
        }

        if s.sched_locked == 0 {
            let need_switch = s.tcb(id).priority >= s.current_priority();
            s.remove_state(id);
            s.ready_add(id);
            need_switch
        } else {
            // Lists are in use by a task; reconcile at unlock
            s.lists.insert_end(ListId::READY_POOL, NodeId::event(id));
            false
        }
    }

    pub fn task_state(&self, id: TaskId) -> TaskState {
        self.critical().task_state(id)
    }

    /// Current (possibly inherited) priority
    pub fn task_priority(&self, handle: Option<TaskId>) -> Priority {
        let s = self.critical();
        let id = s.resolve(handle);
        s.tcb(id).priority
    }

    pub fn task_priority_from_isr(&self, handle: Option<TaskId>) -> Priority {
        let s = self.critical_from_isr();
        let id = s.resolve(handle);
        s.tcb(id).priority
    }

    /// Change a task's assigned priority. An inherited priority stays in
    /// force until the task releases what it holds.
    pub fn task_set_priority(&self, handle: Option<TaskId>, priority: Priority) {
        let priority = priority.min(config::MAX_PRIORITIES - 1);
        let mut s = self.critical();
        let id = s.resolve(handle);
        let is_current = s.current == Some(id);

        let base = s.tcb(id).base_priority;
        if base == priority {
            return;
        }

        let need_switch = if priority > base {
            !is_current && priority >= s.current_priority()
        } else {
            is_current
        };

        let priority_on_entry = s.tcb(id).priority;
        let tcb = s.tcb_mut(id);
        if tcb.base_priority == tcb.priority {
            tcb.priority = priority;
        }
        tcb.base_priority = priority;
        s.lists.set_value(NodeId::event(id), event_value(priority));

        if s.lists.contains(ListId::ready(priority_on_entry), NodeId::state(id)) {
            s.remove_state(id);
            s.ready_add(id);
        }

        drop(s);
        if need_switch {
            self.port().request_schedule();
        }
    }

    /// Application-defined tag (`None` for the caller)
    pub fn task_tag(&self, handle: Option<TaskId>) -> isize {
        let s = self.critical();
        let id = s.resolve(handle);
        s.tcb(id).tag
    }

    pub fn task_set_tag(&self, handle: Option<TaskId>, tag: isize) {
        let mut s = self.critical();
        let id = s.resolve(handle);
        s.tcb_mut(id).tag = tag;
    }

    pub fn task_name(&self, id: TaskId) -> TaskName {
        self.critical().tcb(id).name.clone()
    }

    /// Stack size in words
    pub fn task_stack_size(&self, id: TaskId) -> StackSize {
        self.critical().tcb(id).stack_words
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::settings::KernelConfig;
    use crate::kernel::testing::*;

    #[test]
    fn names_are_truncated_on_char_boundaries() {
        assert_eq!(truncated_name("worker").as_str(), "worker");
        let long = truncated_name("a-very-long-task-name-indeed");
        assert_eq!(long.len(), config::MAX_TASK_NAME_LEN);
        let wide = truncated_name("ééééééééé");
        assert_eq!(wide.as_str(), "éééééééé");
    }

    #[test]
    fn create_rejects_small_stack_and_clamps_priority() {
        let k = kernel();
        let tiny = std::boxed::Box::leak(std::vec![0usize; 8].into_boxed_slice());
        assert_eq!(
            k.task_create(spin, 0, tiny, 1, "tiny"),
            Err(RtosError::InvalidParameter)
        );

        let top = spawn(k, 1000, "top");
        assert_eq!(k.task_priority(Some(top)), config::MAX_PRIORITIES - 1);
        assert_eq!(k.task_name(top).as_str(), "top");
        assert_eq!(k.task_stack_size(top), STACK_WORDS);
    }

    #[test]
    fn create_fails_when_arena_is_full() {
        let k = kernel();
        for _ in 0..config::MAX_TASKS {
            spawn(k, 1, "filler");
        }
        assert_eq!(
            k.task_create(spin, 0, stack(), 1, "extra"),
            Err(RtosError::OutOfMemory)
        );
    }

    #[test]
    fn stack_is_filled_and_frame_built_by_port() {
        let k = kernel();
        let id = k.task_create(spin, 0x55, stack(), 1, "frame").unwrap();
        let sp = k.current_stack_pointer();
        assert_eq!(k.current_task(), Some(id));
        // SAFETY: the sim port wrote its frame at the saved stack pointer
        unsafe {
            assert_eq!(*sp, spin as usize);
            assert_eq!(*sp.add(1), 0x55);
            let fill = usize::from_ne_bytes([config::STACK_FILL_BYTE; core::mem::size_of::<usize>()]);
            assert_eq!(*sp.sub(1), fill);
        }
    }

    #[test]
    fn deleting_another_task_frees_its_slot() {
        let k = started(KernelConfig::new());
        let victim = spawn(k, 1, "victim");
        assert_eq!(k.task_count(), 2);

        k.task_delete(Some(victim));
        assert_eq!(k.task_count(), 1);

        // The slot is reused
        let again = spawn(k, 1, "again");
        assert_eq!(again, victim);
        assert_consistent(k);
    }

    #[test]
    fn self_delete_waits_for_idle_reclamation() {
        let k = started(KernelConfig::new());
        let worker = spawn(k, 3, "worker");
        k.switch_context();
        k.port().take_schedule_requests();

        k.task_delete(None);
        assert_eq!(k.port().take_schedule_requests(), 1);
        assert_eq!(k.task_state(worker), TaskState::Running);

        // Still on its own stack: idle must not free it yet
        k.reclaim_deleted();
        assert_eq!(k.task_count(), 2);

        k.switch_context();
        assert_eq!(k.task_state(worker), TaskState::PendingRecycle);
        k.idle_step();
        assert_eq!(k.task_count(), 1);
        assert_consistent(k);
    }

    #[test]
    fn suspend_and_resume_round_trip() {
        let k = started(KernelConfig::new());
        let worker = spawn(k, 2, "worker");
        k.task_suspend(Some(worker));
        assert_eq!(k.task_state(worker), TaskState::Suspended);

        k.port().take_schedule_requests();
        k.task_resume(worker);
        assert_eq!(k.task_state(worker), TaskState::Ready);
        assert_eq!(k.port().take_schedule_requests(), 1);

        // Resuming a task that is not suspended does nothing
        k.task_resume(worker);
        assert_eq!(k.port().take_schedule_requests(), 0);
        assert_consistent(k);
    }

    #[test]
    fn suspending_the_only_task_before_start_clears_current() {
        let k = kernel();
        let lone = spawn(k, 1, "lone");
        k.task_suspend(None);
        assert_eq!(k.current_task(), None);
        assert_eq!(k.task_state(lone), TaskState::Suspended);
    }

    #[test]
    fn suspending_current_before_start_picks_another() {
        let k = kernel();
        let low = spawn(k, 1, "low");
        let high = spawn(k, 2, "high");
        k.task_suspend(Some(high));
        assert_eq!(k.current_task(), Some(low));
    }

    #[test]
    fn resume_from_isr_reports_preemption() {
        let k = started(KernelConfig::new());
        let urgent = spawn(k, 5, "urgent");
        k.task_suspend(Some(urgent));
        assert!(k.task_resume_from_isr(urgent));
        assert_eq!(k.task_state(urgent), TaskState::Ready);
        assert!(!k.task_resume_from_isr(urgent));
    }

    #[test]
    fn raising_priority_of_ready_task_requeues_and_preempts() {
        let k = started(KernelConfig::new());
        let a = spawn(k, 2, "a");
        let b = spawn(k, 1, "b");
        k.switch_context();
        assert_eq!(k.current_task(), Some(a));
        k.port().take_schedule_requests();

        k.task_set_priority(Some(b), 4);
        assert_eq!(k.task_priority(Some(b)), 4);
        assert_eq!(k.port().take_schedule_requests(), 1);
        k.switch_context();
        assert_eq!(k.current_task(), Some(b));

        // Lowering the runner's own priority also asks for a switch
        k.task_set_priority(None, 1);
        assert_eq!(k.port().take_schedule_requests(), 1);
        k.switch_context();
        assert_eq!(k.current_task(), Some(a));
        assert_consistent(k);
    }

    #[test]
    fn tags_default_to_zero() {
        let k = kernel();
        let t = spawn(k, 1, "tagged");
        assert_eq!(k.task_tag(Some(t)), 0);
        k.task_set_tag(None, 42);
        assert_eq!(k.task_tag(Some(t)), 42);
    }

    #[test]
    fn priority_from_isr_reports_inherited_level() {
        let k = started(KernelConfig::new());
        let low = spawn(k, 1, "low");
        k.switch_context();
        assert_eq!(k.task_priority_from_isr(None), 1);
        k.take_mutex_holder();

        let high = spawn(k, 4, "high");
        k.switch_context();
        assert_eq!(k.current_task(), Some(high));
        k.priority_inherit(low);
        assert_eq!(k.task_priority_from_isr(Some(low)), 4);
        assert_eq!(k.task_priority_from_isr(None), 4);

        // A new base does not undo the boost
        k.task_set_priority(Some(low), 2);
        assert_eq!(k.task_priority_from_isr(Some(low)), 4);
        assert_eq!(k.task_priority(Some(low)), 4);
        assert!(!k.port().isr_masked());
        assert_consistent(k);
    }
}
