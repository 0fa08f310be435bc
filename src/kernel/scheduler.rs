use core::cell::{RefCell, RefMut};
use core::ops::{Deref, DerefMut};

use crate::arch::{CriticalSection, Port};
use crate::kernel::settings::{KernelConfig, PriorityLookup};
use crate::kernel::list::{ListArena, ListId, NodeId};
use crate::kernel::mutex::KernelMutex;
use crate::kernel::queue::MsgQueue;
use crate::kernel::task::Tcb;
use crate::kernel::time::TimeOut;
use crate::kernel::types::*;

/// Kernel state. Only ever touched through `Locked`.
pub(crate) struct State {
    pub(super) tasks: [Option<Tcb>; config::MAX_TASKS],
    pub(super) lists: ListArena,
    pub(super) queues: [Option<MsgQueue>; config::MAX_QUEUES],
    pub(super) mutexes: [Option<KernelMutex>; config::MAX_MUTEXES],

    /// Running task; the head of the highest non-empty ready list once
    /// the scheduler has switched
    pub(super) current: Option<TaskId>,
    pub(super) task_count: usize,
    /// Tasks parked on the recycle list
    pub(super) tasks_deleted: usize,

    pub(super) tick: TickType,
    /// Number of times `tick` has wrapped
    pub(super) overflow_count: u32,
    /// Earliest wake tick on the near pending list
    pub(super) next_unblock: TickType,
    /// Pending list for wake ticks in the current overflow period
    pub(super) pend: ListId,
    /// Pending list for wake ticks past the next wrap
    pub(super) far_pend: ListId,

    /// Scheduler lock nesting
    pub(super) sched_locked: usize,
    /// Ticks that arrived while locked
    pub(super) pended_ticks: u32,
    /// A switch was wanted while locked
    pub(super) need_schedule: bool,
    pub(super) running: bool,

    /// Bit `p` set while ready list `p` is non-empty
    ready_bitmap: u32,

    pub(super) config: KernelConfig,
}

impl State {
    const fn new(config: KernelConfig) -> Self {
        State {
            tasks: [const { None }; config::MAX_TASKS],
            lists: ListArena::new(),
            queues: [const { None }; config::MAX_QUEUES],
            mutexes: [const { None }; config::MAX_MUTEXES],
            current: None,
            task_count: 0,
            tasks_deleted: 0,
            tick: config.initial_tick,
            overflow_count: 0,
            next_unblock: TickType::FOREVER,
            pend: ListId::PEND_A,
            far_pend: ListId::PEND_B,
            sched_locked: 0,
            pended_ticks: 0,
            need_schedule: false,
            running: false,
            ready_bitmap: 0,
            config,
        }
    }

    pub(super) fn tcb(&self, id: TaskId) -> &Tcb {
        match &self.tasks[id.index()] {
            Some(tcb) => tcb,
            None => panic!("stale task handle {}", id),
        }
    }

    pub(super) fn tcb_mut(&mut self, id: TaskId) -> &mut Tcb {
        match &mut self.tasks[id.index()] {
            Some(tcb) => tcb,
            None => panic!("stale task handle {}", id),
        }
    }

    /// `None` names the calling task
    pub(super) fn resolve(&self, handle: Option<TaskId>) -> TaskId {
        match handle.or(self.current) {
            Some(id) => id,
            None => panic!("no current task"),
        }
    }

    pub(super) fn current_priority(&self) -> Priority {
        self.current
            .map_or(config::IDLE_PRIORITY, |id| self.tcb(id).priority)
    }

    // ========================================================================
    // READY LISTS
    // ========================================================================

    pub(super) fn highest_ready_priority(&self) -> Priority {
        let found = match self.config.priority_lookup {
            PriorityLookup::Bitmap => highest_in_bitmap(self.ready_bitmap),
            PriorityLookup::Scan => (0..config::MAX_PRIORITIES)
                .rev()
                .find(|&p| !self.lists.is_empty(ListId::ready(p))),
        };
        found.unwrap_or(config::IDLE_PRIORITY)
    }

    /// Append to the tail of the task's ready list
    pub(super) fn ready_add(&mut self, id: TaskId) {
        let priority = self.tcb(id).priority;
        self.lists.insert_end(ListId::ready(priority), NodeId::state(id));
        if priority < 32 {
            self.ready_bitmap |= 1 << priority;
        }
    }

    /// Take the task off whichever state list holds it
    pub(super) fn remove_state(&mut self, id: TaskId) {
        let node = NodeId::state(id);
        let container = self.lists.container(node);
        let remaining = self.lists.remove(node);
        if let Some(priority) = container.and_then(ListId::ready_priority) {
            if remaining == 0 && priority < 32 {
                self.ready_bitmap &= !(1 << priority);
            }
        }
    }

    pub(super) fn remove_event(&mut self, id: TaskId) {
        self.lists.remove(NodeId::event(id));
    }

    pub(super) fn is_ready(&self, id: TaskId) -> bool {
        self.lists
            .container(NodeId::state(id))
            .and_then(ListId::ready_priority)
            .is_some()
    }

    /// Bitmap bit `p` is set exactly when ready list `p` is non-empty
    #[cfg(test)]
    pub(super) fn ready_bitmap_coherent(&self) -> bool {
        (0..config::MAX_PRIORITIES.min(32)).all(|p| {
            let bit = self.ready_bitmap & (1 << p) != 0;
            bit == !self.lists.is_empty(ListId::ready(p))
        })
    }

    pub(super) fn select(&mut self) {
        let priority = self.highest_ready_priority();
        if let Some(id) = self.lists.head_owner(ListId::ready(priority)) {
            self.current = Some(id);
        }
    }

    /// The outgoing task, if its saved stack pointer reached its limit
    fn check_stack(&self) -> Option<TaskId> {
        let id = self.current?;
        let tcb = self.tcb(id);
        if tcb.stack_top > tcb.stack_start {
            return None;
        }
        error!("stack overflow in task {} '{}'", id, tcb.name.as_str());
        Some(id)
    }

    // ========================================================================
    // PENDING LISTS AND EVENT LISTS
    // ========================================================================

    pub(super) fn update_unblock_time(&mut self) {
        self.next_unblock = match self.lists.head(self.pend) {
            Some(node) => TickType(self.lists.value(node)),
            None => TickType::FOREVER,
        };
    }

    /// Block `id` for `ticks`. With `suspend` and a forever wait the task
    /// goes to the suspended list instead of a pending list.
    pub(super) fn pend_add(&mut self, id: TaskId, ticks: TickType, suspend: bool) {
        self.remove_state(id);
        let node = NodeId::state(id);

        if ticks.is_forever() && suspend {
            self.lists.insert_end(ListId::SUSPENDED, node);
            return;
        }

        let wake = self.tick.wrapping_add(ticks);
        self.lists.set_value(node, wake.0);
        if wake < self.tick {
            // Wrapped: due in the next overflow period
            self.lists.insert_ordered(self.far_pend, node);
        } else {
            self.lists.insert_ordered(self.pend, node);
            if wake < self.next_unblock {
                self.next_unblock = wake;
            }
        }
    }

    /// Queue the running task on `list` in priority order and block it
    pub(super) fn event_add(&mut self, list: ListId, ticks: TickType) {
        let id = self.resolve(None);
        self.lists.insert_ordered(list, NodeId::event(id));
        self.pend_add(id, ticks, true);
    }

    /// Queue the running task at the tail of `list` and block it
    pub(super) fn block_and_pend(&mut self, list: ListId, ticks: TickType, suspend: bool) {
        let id = self.resolve(None);
        self.lists.insert_end(list, NodeId::event(id));
        self.pend_add(id, ticks, suspend);
    }

    /// Wake the highest-priority waiter on `list`. Returns whether it
    /// outranks the running task.
    pub(super) fn unblock_head(&mut self, list: ListId) -> bool {
        let Some(id) = self.lists.head_owner(list) else {
            return false;
        };
        self.remove_event(id);

        if self.sched_locked == 0 {
            self.remove_state(id);
            self.ready_add(id);
        } else {
            self.lists.insert_end(ListId::READY_POOL, NodeId::event(id));
        }

        let outranks = self.tcb(id).priority > self.current_priority();
        if outranks {
            self.need_schedule = true;
        }
        self.update_unblock_time();
        outranks
    }

    // ========================================================================
    // SCHEDULER LOCK
    // ========================================================================

    /// Move every task an interrupt readied while locked into its ready list
    fn drain_ready_pool(&mut self) {
        let mut drained = false;
        while let Some(id) = self.lists.head_owner(ListId::READY_POOL) {
            self.remove_event(id);
            self.remove_state(id);
            self.ready_add(id);
            if self.tcb(id).priority >= self.current_priority() {
                self.need_schedule = true;
            }
            drained = true;
        }
        if drained {
            self.update_unblock_time();
        }
    }

    fn replay_pended_ticks(&mut self) {
        let mut ticks = self.pended_ticks;
        while ticks > 0 {
            if self.increment_tick() {
                self.need_schedule = true;
            }
            ticks -= 1;
        }
        self.pended_ticks = 0;
    }
}

pub(super) fn event_value(priority: Priority) -> u32 {
    (config::MAX_PRIORITIES - priority) as u32
}

pub(super) fn highest_in_bitmap(bitmap: u32) -> Option<Priority> {
    if bitmap == 0 {
        None
    } else {
        Some(31 - bitmap.leading_zeros() as usize)
    }
}

/// Outcome of one attempt at a blocking operation
pub(crate) enum Attempt<T> {
    Done(T),
    /// The caller is now blocked; the flag says whether unlocking the
    /// scheduler already requested the switch
    Parked { already_scheduled: bool },
    /// Woken without the condition holding; try again
    Retry,
}

/// Deadline bookkeeping carried across attempts
pub(crate) struct Wait {
    pub(super) remaining: TickType,
    pub(super) timeout: Option<TimeOut>,
}

impl Wait {
    pub(crate) fn new(ticks: TickType) -> Self {
        Wait {
            remaining: ticks,
            timeout: None,
        }
    }
}

// ============================================================================
// KERNEL
// ============================================================================

/// Critical section plus exclusive access to the kernel state
///
/// Field order matters: the state borrow is released before interrupts
/// are unmasked.
pub(crate) struct Locked<'k, P: Port> {
    state: RefMut<'k, State>,
    _cs: CriticalSection<'k, P>,
}

impl<P: Port> Deref for Locked<'_, P> {
    type Target = State;

    fn deref(&self) -> &State {
        &self.state
    }
}

impl<P: Port> DerefMut for Locked<'_, P> {
    fn deref_mut(&mut self) -> &mut State {
        &mut self.state
    }
}

/// The kernel context: every task, list and synchronization object of one
/// core, driven through a CPU port
pub struct Kernel<P: Port> {
    port: P,
    state: RefCell<State>,
}

// Safety: all access to `state` happens with interrupts masked on a single
// core, which serialises task and interrupt context.
unsafe impl<P: Port + Sync> Sync for Kernel<P> {}

impl<P: Port> Kernel<P> {
    pub const fn new(port: P, config: KernelConfig) -> Self {
        Kernel {
            port,
            state: RefCell::new(State::new(config)),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub(crate) fn critical(&self) -> Locked<'_, P> {
        let cs = CriticalSection::enter(&self.port);
        Locked {
            state: self.state.borrow_mut(),
            _cs: cs,
        }
    }

    pub(crate) fn critical_from_isr(&self) -> Locked<'_, P> {
        let cs = CriticalSection::enter_from_isr(&self.port);
        Locked {
            state: self.state.borrow_mut(),
            _cs: cs,
        }
    }

    /// Reset every list and counter. Tasks, queues and mutexes are dropped.
    pub fn init(&self) {
        let mut s = self.critical();
        let config = s.config;
        *s = State::new(config);
    }

    /// Create the idle task and hand the CPU to the highest-priority task.
    ///
    /// The kernel must not move after this call, hence `'static`. Hardware
    /// ports never return from here; the simulation port does.
    pub fn start(&'static self, idle_stack: Stack) -> Result<()>
    where
        P: 'static,
    {
        let arg = self as *const Self as usize;
        self.task_create(idle_entry::<P>, arg, idle_stack, config::IDLE_PRIORITY, "idle")?;

        let tasks = {
            let mut s = self.critical();
            s.next_unblock = TickType::FOREVER;
            s.running = true;
            s.tick = s.config.initial_tick;
            s.task_count
        };
        info!("scheduler started with {} tasks", tasks);

        self.port.start_scheduler();
        Ok(())
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        let s = self.critical();
        if !s.running {
            SchedulerState::NotStarted
        } else if s.sched_locked > 0 {
            SchedulerState::Locked
        } else {
            SchedulerState::Running
        }
    }

    /// Stop task switching without masking interrupts. Nests.
    pub fn lock(&self) {
        self.critical().sched_locked += 1;
    }

    /// Undo one `lock`. At nesting zero, tasks readied from interrupts and
    /// ticks that arrived meanwhile are applied. Returns whether a switch
    /// was requested here, so callers do not request a second one.
    pub fn unlock(&self) -> bool {
        let mut s = self.critical();
        debug_assert!(s.sched_locked > 0, "scheduler unlock without lock");
        s.sched_locked = s.sched_locked.saturating_sub(1);

        if s.sched_locked == 0 && s.task_count > 0 {
            s.drain_ready_pool();
            s.replay_pended_ticks();
            if s.need_schedule {
                self.port.request_schedule();
                return true;
            }
        }
        false
    }

    /// Pick the next task to run. Called by the port when it takes the
    /// switch request; deferred while the scheduler is locked.
    ///
    /// A task found past the bottom of its stack is handed to
    /// `Port::stack_overflow` before the next task is picked.
    pub fn switch_context(&self) {
        let overflowed = {
            let mut s = self.critical();
            if s.sched_locked > 0 {
                s.need_schedule = true;
                return;
            }
            s.need_schedule = false;
            s.check_stack()
        };
        if let Some(id) = overflowed {
            self.port.stack_overflow(id);
        }
        self.critical().select();
    }

    /// Rotate the running task behind its peers and request a switch
    pub fn yield_now(&self) {
        {
            let mut s = self.critical();
            if let Some(id) = s.current {
                if s.is_ready(id) {
                    s.remove_state(id);
                    s.ready_add(id);
                }
            }
        }
        self.port.request_schedule();
    }

    pub fn current_task(&self) -> Option<TaskId> {
        self.critical().current
    }

    pub fn task_count(&self) -> usize {
        self.critical().task_count
    }

    // ========================================================================
    // PORT HOOKS
    // ========================================================================

    /// Save the running task's stack pointer
    pub fn record_stack_pointer(&self, sp: *mut usize) {
        let mut s = self.critical();
        if let Some(id) = s.current {
            s.tcb_mut(id).stack_top = sp;
        }
    }

    /// Saved stack pointer of the running task (null before any task exists)
    pub fn current_stack_pointer(&self) -> *mut usize {
        let s = self.critical();
        s.current
            .map_or(core::ptr::null_mut(), |id| s.tcb(id).stack_top)
    }

    /// Address of a task's saved stack pointer, for assembly that stores it
    /// directly. Valid until the task is deleted.
    pub fn stack_pointer_slot(&self, id: TaskId) -> *mut *mut usize {
        let mut s = self.critical();
        &mut s.tcb_mut(id).stack_top as *mut *mut usize
    }

    /// One pass of the idle loop
    pub fn idle_step(&self) {
        let crowded = self
            .critical()
            .lists
            .len(ListId::ready(config::IDLE_PRIORITY))
            > 1;
        if crowded {
            self.yield_now();
        }

        self.reclaim_deleted();

        if self.critical().config.low_power {
            self.idle_low_power();
        }
    }

    /// Drive a blocking operation until it completes, fails or times out
    pub(crate) fn run_blocking<T>(
        &self,
        ticks: TickType,
        mut step: impl FnMut(&mut Wait) -> Result<Attempt<T>>,
    ) -> Result<T> {
        let mut wait = Wait::new(ticks);
        loop {
            match step(&mut wait)? {
                Attempt::Done(value) => return Ok(value),
                Attempt::Parked { already_scheduled } => {
                    if !already_scheduled {
                        self.port.request_schedule();
                    }
                }
                Attempt::Retry => {}
            }
        }
    }
}

extern "C" fn idle_entry<P: Port + 'static>(arg: usize) -> ! {
    // SAFETY: `start` passes the address of a `&'static Kernel<P>`
    let kernel = unsafe { &*(arg as *const Kernel<P>) };
    loop {
        kernel.idle_step();
    }
}
