// Shared helpers for the in-crate unit tests

use std::boxed::Box;

use crate::arch::SimPort;
use crate::kernel::list::{ListId, NodeId};
use crate::kernel::scheduler::Kernel;
use crate::kernel::settings::KernelConfig;
use crate::kernel::types::*;

pub(crate) use crate::arch::sim::SIM_FRAME_WORDS;

pub(crate) const STACK_WORDS: usize = 256;

pub(crate) fn stack() -> Stack {
    Box::leak(std::vec![0usize; STACK_WORDS].into_boxed_slice())
}

pub(crate) extern "C" fn spin(_: usize) -> ! {
    loop {
        core::hint::spin_loop();
    }
}

pub(crate) fn kernel() -> &'static Kernel<SimPort> {
    kernel_with(KernelConfig::new())
}

pub(crate) fn kernel_with(config: KernelConfig) -> &'static Kernel<SimPort> {
    Box::leak(Box::new(Kernel::new(SimPort::new(), config)))
}

/// A started kernel running only its idle task, with the start-up switch
/// requests already drained
pub(crate) fn started(config: KernelConfig) -> &'static Kernel<SimPort> {
    let k = kernel_with(config);
    k.start(stack()).unwrap();
    k.port().take_schedule_requests();
    k
}

pub(crate) fn spawn(k: &Kernel<SimPort>, priority: Priority, name: &str) -> TaskId {
    k.task_create(spin, 0, stack(), priority, name).unwrap()
}

/// Every live task sits on exactly one state list, its event node (if
/// linked) is on a wait list or the ready pool, and the ready bitmap
/// agrees with the ready lists.
pub(crate) fn assert_consistent(k: &Kernel<SimPort>) {
    let s = k.critical();
    assert_eq!(k.port().lock_depth(), 1, "critical section leaked");

    let mut on_state_lists = 0;
    for p in 0..config::MAX_PRIORITIES {
        on_state_lists += s.lists.len(ListId::ready(p));
    }
    for list in [ListId::PEND_A, ListId::PEND_B, ListId::SUSPENDED, ListId::RECYCLE] {
        on_state_lists += s.lists.len(list);
    }
    assert_eq!(on_state_lists, s.task_count, "state list membership");

    for (slot, tcb) in s.tasks.iter().enumerate() {
        if tcb.is_none() {
            continue;
        }
        let id = TaskId(slot as u16);
        assert!(
            s.lists.container(NodeId::state(id)).is_some(),
            "task {} is on no state list",
            id
        );
        if let Some(list) = s.lists.container(NodeId::event(id)) {
            assert!(
                list.ready_priority().is_none() && !list.is_pending(),
                "task {} event node on a state list",
                id
            );
        }
    }

    assert!(s.ready_bitmap_coherent(), "ready bitmap out of sync");
}
