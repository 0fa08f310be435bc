// Index-linked list arena
//
// Every task owns two nodes: a state node (ready/pending/suspended/recycle)
// and an event node (a synchronization object's wait list, or the ready
// pool). Nodes never move; lists splice node indices.

use crate::kernel::types::{config, Priority, TaskId};

/// Identifies one of the kernel's lists
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct ListId(u8);

impl ListId {
    pub const PEND_A: ListId = ListId(config::MAX_PRIORITIES as u8);
    pub const PEND_B: ListId = ListId(config::MAX_PRIORITIES as u8 + 1);
    pub const SUSPENDED: ListId = ListId(config::MAX_PRIORITIES as u8 + 2);
    pub const RECYCLE: ListId = ListId(config::MAX_PRIORITIES as u8 + 3);
    pub const READY_POOL: ListId = ListId(config::MAX_PRIORITIES as u8 + 4);
    const EVENT_BASE: usize = config::MAX_PRIORITIES + 5;

    pub const fn ready(priority: Priority) -> ListId {
        ListId(priority as u8)
    }

    /// Tasks waiting for space in queue slot `q`
    pub const fn queue_senders(q: usize) -> ListId {
        ListId((Self::EVENT_BASE + 2 * q) as u8)
    }

    /// Tasks waiting for data in queue slot `q`
    pub const fn queue_receivers(q: usize) -> ListId {
        ListId((Self::EVENT_BASE + 2 * q + 1) as u8)
    }

    pub const fn mutex_waiters(m: usize) -> ListId {
        ListId((Self::EVENT_BASE + 2 * config::MAX_QUEUES + m) as u8)
    }

    /// Priority of the ready list this id names, if it is one
    pub const fn ready_priority(self) -> Option<Priority> {
        if (self.0 as usize) < config::MAX_PRIORITIES {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    pub const fn is_pending(self) -> bool {
        self.0 == Self::PEND_A.0 || self.0 == Self::PEND_B.0
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

pub(crate) const NUM_LISTS: usize = ListId::EVENT_BASE + 2 * config::MAX_QUEUES + config::MAX_MUTEXES;
const NUM_NODES: usize = 2 * config::MAX_TASKS;

/// A task's list node
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct NodeId(u16);

impl NodeId {
    pub const fn state(task: TaskId) -> NodeId {
        NodeId(task.0 * 2)
    }

    pub const fn event(task: TaskId) -> NodeId {
        NodeId(task.0 * 2 + 1)
    }

    pub const fn owner(self) -> TaskId {
        TaskId(self.0 / 2)
    }

    const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Copy, Clone, Debug)]
struct ListNode {
    next: Option<NodeId>,
    prev: Option<NodeId>,
    container: Option<ListId>,
    /// Sort value: lower values sit nearer the head
    value: u32,
}

impl ListNode {
    const fn new() -> Self {
        ListNode {
            next: None,
            prev: None,
            container: None,
            value: 0,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct List {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    length: usize,
}

impl List {
    const fn new() -> Self {
        List {
            head: None,
            tail: None,
            length: 0,
        }
    }
}

pub(crate) struct ListArena {
    lists: [List; NUM_LISTS],
    nodes: [ListNode; NUM_NODES],
}

impl ListArena {
    pub const fn new() -> Self {
        ListArena {
            lists: [List::new(); NUM_LISTS],
            nodes: [ListNode::new(); NUM_NODES],
        }
    }

    pub fn len(&self, list: ListId) -> usize {
        self.lists[list.index()].length
    }

    pub fn is_empty(&self, list: ListId) -> bool {
        self.len(list) == 0
    }

    pub fn head(&self, list: ListId) -> Option<NodeId> {
        self.lists[list.index()].head
    }

    /// Task at the head of `list`
    pub fn head_owner(&self, list: ListId) -> Option<TaskId> {
        self.head(list).map(NodeId::owner)
    }

    pub fn container(&self, node: NodeId) -> Option<ListId> {
        self.nodes[node.index()].container
    }

    pub fn contains(&self, list: ListId, node: NodeId) -> bool {
        self.container(node) == Some(list)
    }

    pub fn value(&self, node: NodeId) -> u32 {
        self.nodes[node.index()].value
    }

    pub fn set_value(&mut self, node: NodeId, value: u32) {
        self.nodes[node.index()].value = value;
    }

    /// Insert at the tail (O(1))
    pub fn insert_end(&mut self, list: ListId, node: NodeId) {
        debug_assert!(self.container(node).is_none(), "node already linked");

        let tail = self.lists[list.index()].tail;
        {
            let item = &mut self.nodes[node.index()];
            item.prev = tail;
            item.next = None;
            item.container = Some(list);
        }
        match tail {
            Some(t) => self.nodes[t.index()].next = Some(node),
            None => self.lists[list.index()].head = Some(node),
        }
        let l = &mut self.lists[list.index()];
        l.tail = Some(node);
        l.length += 1;
    }

    /// Insert after every node whose value is <= the new node's value, so
    /// equal values keep arrival order
    pub fn insert_ordered(&mut self, list: ListId, node: NodeId) {
        debug_assert!(self.container(node).is_none(), "node already linked");

        let value = self.nodes[node.index()].value;
        let mut before = self.lists[list.index()].head;
        while let Some(n) = before {
            if self.nodes[n.index()].value > value {
                break;
            }
            before = self.nodes[n.index()].next;
        }

        let Some(next) = before else {
            self.insert_end(list, node);
            return;
        };

        let prev = self.nodes[next.index()].prev;
        {
            let item = &mut self.nodes[node.index()];
            item.next = Some(next);
            item.prev = prev;
            item.container = Some(list);
        }
        self.nodes[next.index()].prev = Some(node);
        match prev {
            Some(p) => self.nodes[p.index()].next = Some(node),
            None => self.lists[list.index()].head = Some(node),
        }
        self.lists[list.index()].length += 1;
    }

    /// Unlink a node from whatever list holds it. Returns the number of
    /// nodes left in that list (0 if the node was not linked).
    pub fn remove(&mut self, node: NodeId) -> usize {
        let item = self.nodes[node.index()];
        let Some(list) = item.container else {
            return 0;
        };

        match item.prev {
            Some(p) => self.nodes[p.index()].next = item.next,
            None => self.lists[list.index()].head = item.next,
        }
        match item.next {
            Some(n) => self.nodes[n.index()].prev = item.prev,
            None => self.lists[list.index()].tail = item.prev,
        }

        let slot = &mut self.nodes[node.index()];
        slot.next = None;
        slot.prev = None;
        slot.container = None;

        let l = &mut self.lists[list.index()];
        l.length -= 1;
        l.length
    }

    pub fn iter(&self, list: ListId) -> Iter<'_> {
        Iter {
            arena: self,
            cursor: self.head(list),
        }
    }
}

pub(crate) struct Iter<'a> {
    arena: &'a ListArena,
    cursor: Option<NodeId>,
}

impl Iterator for Iter<'_> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let node = self.cursor?;
        self.cursor = self.arena.nodes[node.index()].next;
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(task: u16) -> NodeId {
        NodeId::state(TaskId(task))
    }

    fn owners(arena: &ListArena, list: ListId) -> [Option<u16>; 4] {
        let mut out = [None; 4];
        for (slot, n) in out.iter_mut().zip(arena.iter(list)) {
            *slot = Some(n.owner().0);
        }
        out
    }

    #[test]
    fn insert_end_keeps_arrival_order() {
        let mut arena = ListArena::new();
        let list = ListId::ready(3);
        arena.insert_end(list, node(0));
        arena.insert_end(list, node(1));
        arena.insert_end(list, node(2));

        assert_eq!(arena.len(list), 3);
        assert_eq!(arena.head_owner(list), Some(TaskId(0)));
        assert_eq!(owners(&arena, list), [Some(0), Some(1), Some(2), None]);
    }

    #[test]
    fn ordered_insert_sorts_and_is_stable_for_ties() {
        let mut arena = ListArena::new();
        let list = ListId::PEND_A;
        for (task, value) in [(0u16, 30u32), (1, 10), (2, 30), (3, 20)] {
            arena.set_value(node(task), value);
            arena.insert_ordered(list, node(task));
        }

        assert_eq!(owners(&arena, list), [Some(1), Some(3), Some(0), Some(2)]);
    }

    #[test]
    fn remove_reports_remaining_length_and_unlinks() {
        let mut arena = ListArena::new();
        let list = ListId::SUSPENDED;
        arena.insert_end(list, node(0));
        arena.insert_end(list, node(1));

        assert_eq!(arena.remove(node(0)), 1);
        assert_eq!(arena.container(node(0)), None);
        assert_eq!(arena.head_owner(list), Some(TaskId(1)));
        assert_eq!(arena.remove(node(1)), 0);
        assert!(arena.is_empty(list));
        // Removing an unlinked node is a no-op
        assert_eq!(arena.remove(node(1)), 0);
    }

    #[test]
    fn remove_from_middle_relinks_neighbours() {
        let mut arena = ListArena::new();
        let list = ListId::RECYCLE;
        for t in 0..3 {
            arena.insert_end(list, node(t));
        }
        arena.remove(node(1));
        assert_eq!(owners(&arena, list), [Some(0), Some(2), None, None]);

        arena.insert_end(list, node(1));
        assert_eq!(owners(&arena, list), [Some(0), Some(2), Some(1), None]);
    }

    #[test]
    fn event_nodes_are_distinct_from_state_nodes() {
        let task = TaskId(5);
        assert_ne!(NodeId::state(task), NodeId::event(task));
        assert_eq!(NodeId::event(task).owner(), task);
        assert_eq!(NodeId::state(task).owner(), task);
    }
}
