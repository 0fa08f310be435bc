// Message queue: fixed-capacity ring of fixed-size items
//
// Blocking calls are split into attempts (see `Attempt`). Each attempt
// either finishes, parks the caller on one of the queue's wait lists, or
// asks to be retried after a wake-up that found the condition gone.

use crate::arch::Port;
use crate::kernel::list::ListId;
use crate::kernel::scheduler::{Attempt, Kernel, State, Wait};
use crate::kernel::types::*;

/// Deferred-wake counter for interrupt-side access while a task holds the
/// queue. `Locked(n)` remembers `n` wake-ups owed to the opposite list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum QueueLock {
    Unlocked,
    Locked(u8),
}

impl QueueLock {
    fn bump(&mut self) -> bool {
        match self {
            QueueLock::Unlocked => false,
            QueueLock::Locked(n) => {
                *n = n.saturating_add(1);
                true
            }
        }
    }
}

pub(crate) struct MsgQueue {
    storage: &'static mut [u8],
    capacity: usize,
    item_size: usize,
    /// Next slot to write
    write: usize,
    /// Last slot read; the next read takes the one after
    read: usize,
    count: usize,
    /// Sends from interrupts while locked
    tx_lock: QueueLock,
    /// Receives from interrupts while locked
    rx_lock: QueueLock,
    tag: isize,
}

impl MsgQueue {
    fn new(storage: &'static mut [u8], capacity: usize, item_size: usize) -> Self {
        let mut queue = MsgQueue {
            storage,
            capacity,
            item_size,
            write: 0,
            read: 0,
            count: 0,
            tx_lock: QueueLock::Unlocked,
            rx_lock: QueueLock::Unlocked,
            tag: 0,
        };
        queue.rewind();
        queue
    }

    fn rewind(&mut self) {
        self.count = 0;
        self.write = 0;
        self.read = self.capacity - 1;
        self.tx_lock = QueueLock::Unlocked;
        self.rx_lock = QueueLock::Unlocked;
    }

    fn is_full(&self) -> bool {
        self.count == self.capacity
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn slot(&mut self, index: usize) -> &mut [u8] {
        let start = index * self.item_size;
        &mut self.storage[start..start + self.item_size]
    }

    /// Append `item`. In overwrite mode a full queue first drops its oldest
    /// unread item.
    fn copy_in(&mut self, item: &[u8], overwrite: bool) {
        if overwrite && self.is_full() {
            self.read = (self.read + 1) % self.capacity;
            self.count -= 1;
        }
        let write = self.write;
        self.slot(write).copy_from_slice(item);
        self.write = (write + 1) % self.capacity;
        self.count += 1;
    }

    fn copy_out(&mut self, buf: &mut [u8]) {
        self.read = (self.read + 1) % self.capacity;
        let read = self.read;
        buf.copy_from_slice(self.slot(read));
    }

    fn peek_out(&mut self, buf: &mut [u8]) {
        let read = self.read;
        self.copy_out(buf);
        self.read = read;
    }
}

impl State {
    /// The live queue behind `q`; a deleted or foreign handle is
    /// `InvalidParameter`
    fn queue_checked(&self, q: QueueId) -> Result<&MsgQueue> {
        self.queues
            .get(q.index())
            .and_then(Option::as_ref)
            .ok_or(RtosError::InvalidParameter)
    }

    fn queue(&self, q: QueueId) -> &MsgQueue {
        match &self.queues[q.index()] {
            Some(queue) => queue,
            None => panic!("stale queue handle {}", q),
        }
    }

    fn queue_mut(&mut self, q: QueueId) -> &mut MsgQueue {
        match &mut self.queues[q.index()] {
            Some(queue) => queue,
            None => panic!("stale queue handle {}", q),
        }
    }

    fn queue_lock(&mut self, q: QueueId) {
        let queue = self.queue_mut(q);
        if queue.tx_lock == QueueLock::Unlocked {
            queue.tx_lock = QueueLock::Locked(0);
        }
        if queue.rx_lock == QueueLock::Unlocked {
            queue.rx_lock = QueueLock::Locked(0);
        }
    }

    /// Pay back the wake-ups interrupts owed while the queue was locked.
    /// Must run with the scheduler locked.
    fn queue_unlock(&mut self, q: QueueId) {
        let owed_rx = match self.queue(q).tx_lock {
            QueueLock::Locked(n) => n,
            QueueLock::Unlocked => 0,
        };
        for _ in 0..owed_rx {
            if !self.unblock_head_any(ListId::queue_receivers(q.index())) {
                break;
            }
        }
        self.queue_mut(q).tx_lock = QueueLock::Unlocked;

        let owed_tx = match self.queue(q).rx_lock {
            QueueLock::Locked(n) => n,
            QueueLock::Unlocked => 0,
        };
        for _ in 0..owed_tx {
            if !self.unblock_head_any(ListId::queue_senders(q.index())) {
                break;
            }
        }
        self.queue_mut(q).rx_lock = QueueLock::Unlocked;
    }

    /// Wake the head of `list` if there is one. Returns whether anything
    /// was waiting.
    fn unblock_head_any(&mut self, list: ListId) -> bool {
        if self.lists.is_empty(list) {
            return false;
        }
        self.unblock_head(list);
        true
    }

    fn queue_len_check(&self, q: QueueId, len: usize) -> Result<()> {
        if self.queue_checked(q)?.item_size == len {
            Ok(())
        } else {
            Err(RtosError::InvalidParameter)
        }
    }

    /// Interrupt-side send. Returns whether a switch is wanted.
    fn queue_send_isr(&mut self, q: QueueId, item: &[u8], overwrite: bool) -> Result<bool> {
        self.queue_len_check(q, item.len())?;
        let queue = self.queue_mut(q);
        if queue.is_full() && !overwrite {
            return Err(RtosError::QueueFull);
        }
        queue.copy_in(item, overwrite);
        if queue.tx_lock.bump() {
            return Ok(false);
        }
        Ok(self.unblock_head(ListId::queue_receivers(q.index())))
    }

    fn queue_receive_isr(&mut self, q: QueueId, buf: &mut [u8]) -> Result<bool> {
        self.queue_len_check(q, buf.len())?;
        let queue = self.queue_mut(q);
        if queue.is_empty() {
            return Err(RtosError::QueueEmpty);
        }
        queue.copy_out(buf);
        queue.count -= 1;
        if queue.rx_lock.bump() {
            return Ok(false);
        }
        Ok(self.unblock_head(ListId::queue_senders(q.index())))
    }

    fn switch_allowed(&self) -> bool {
        self.running && self.sched_locked == 0
    }
}

impl<P: Port> Kernel<P> {
    /// Create a queue of `capacity` items of `item_size` bytes over
    /// `storage`, which must hold at least `capacity * item_size` bytes
    pub fn queue_create(
        &self,
        capacity: usize,
        item_size: usize,
        storage: &'static mut [u8],
    ) -> Result<QueueId> {
        let needed = capacity
            .checked_mul(item_size)
            .ok_or(RtosError::InvalidParameter)?;
        if capacity == 0 || item_size == 0 || storage.len() < needed {
            return Err(RtosError::InvalidParameter);
        }

        let id = {
            let mut s = self.critical();
            let slot = s
                .queues
                .iter()
                .position(Option::is_none)
                .ok_or(RtosError::OutOfMemory)?;
            s.queues[slot] = Some(MsgQueue::new(storage, capacity, item_size));
            QueueId(slot as u8)
        };
        debug!("queue {} created: {} x {} bytes", id, capacity, item_size);
        Ok(id)
    }

    /// Free a queue and hand its storage back. Fails with `ResourceBusy`
    /// while tasks wait on it.
    pub fn queue_delete(&self, q: QueueId) -> Result<&'static mut [u8]> {
        let mut s = self.critical();
        s.queue_checked(q)?;
        if !s.lists.is_empty(ListId::queue_senders(q.index()))
            || !s.lists.is_empty(ListId::queue_receivers(q.index()))
        {
            return Err(RtosError::ResourceBusy);
        }
        match s.queues[q.index()].take() {
            Some(queue) => Ok(queue.storage),
            None => Err(RtosError::InvalidParameter),
        }
    }

    /// Copy `item` to the back of the queue, waiting up to `ticks` for room
    pub fn queue_send(&self, q: QueueId, item: &[u8], ticks: TickType) -> Result<()> {
        self.run_blocking(ticks, |wait| self.send_attempt(q, item, wait, false))
    }

    /// Send that never blocks: a full queue loses its oldest item
    pub fn queue_overwrite(&self, q: QueueId, item: &[u8]) -> Result<()> {
        self.run_blocking(TickType::zero(), |wait| self.send_attempt(q, item, wait, true))
    }

    pub(crate) fn send_attempt(
        &self,
        q: QueueId,
        item: &[u8],
        wait: &mut Wait,
        overwrite: bool,
    ) -> Result<Attempt<()>> {
        {
            let mut s = self.critical();
            s.queue_len_check(q, item.len())?;
            let queue = s.queue_mut(q);
            if !queue.is_full() || overwrite {
                queue.copy_in(item, overwrite);
                if s.unblock_head(ListId::queue_receivers(q.index())) {
                    self.port().request_schedule();
                }
                return Ok(Attempt::Done(()));
            }
            if wait.remaining.is_zero() {
                return Err(RtosError::QueueFull);
            }
            if wait.timeout.is_none() {
                wait.timeout = Some(s.timeout_state());
            }
        }

        self.park_on(q, wait, ListId::queue_senders(q.index()), MsgQueue::is_full)
    }

    /// Receive into `buf`, waiting up to `ticks` for an item
    pub fn queue_receive(&self, q: QueueId, buf: &mut [u8], ticks: TickType) -> Result<()> {
        self.run_blocking(ticks, |wait| self.receive_attempt(q, buf, wait, false))
    }

    /// Copy the front item without removing it
    pub fn queue_peek(&self, q: QueueId, buf: &mut [u8], ticks: TickType) -> Result<()> {
        self.run_blocking(ticks, |wait| self.receive_attempt(q, buf, wait, true))
    }

    pub(crate) fn receive_attempt(
        &self,
        q: QueueId,
        buf: &mut [u8],
        wait: &mut Wait,
        peek: bool,
    ) -> Result<Attempt<()>> {
        {
            let mut s = self.critical();
            s.queue_len_check(q, buf.len())?;
            let queue = s.queue_mut(q);
            if !queue.is_empty() {
                let woken = if peek {
                    queue.peek_out(buf);
                    // Another reader may take what was left in place
                    s.unblock_head(ListId::queue_receivers(q.index()))
                } else {
                    queue.copy_out(buf);
                    queue.count -= 1;
                    s.unblock_head(ListId::queue_senders(q.index()))
                };
                if woken {
                    self.port().request_schedule();
                }
                return Ok(Attempt::Done(()));
            }
            if wait.remaining.is_zero() {
                return Err(RtosError::QueueEmpty);
            }
            if wait.timeout.is_none() {
                wait.timeout = Some(s.timeout_state());
            }
        }

        self.park_on(q, wait, ListId::queue_receivers(q.index()), MsgQueue::is_empty)
    }

    /// Shared second half of a blocking attempt: with the scheduler and the
    /// queue locked, park the caller on `list` while `blocked` holds.
    /// Otherwise ask for a retry, or time out once the wait is used up.
    fn park_on(
        &self,
        q: QueueId,
        wait: &mut Wait,
        list: ListId,
        blocked: fn(&MsgQueue) -> bool,
    ) -> Result<Attempt<()>> {
        self.lock();
        let mut s = self.critical();
        s.queue_lock(q);

        let mut timeout = wait.timeout.unwrap_or_else(|| s.timeout_state());
        let expired = s.check_timeout(&mut timeout, &mut wait.remaining);
        wait.timeout = Some(timeout);

        let still_blocked = blocked(s.queue(q));
        let parked = !expired && still_blocked;
        if parked {
            s.event_add(list, wait.remaining);
        }
        s.queue_unlock(q);
        drop(s);

        let already_scheduled = self.unlock();
        if parked {
            Ok(Attempt::Parked { already_scheduled })
        } else if !expired || !still_blocked {
            Ok(Attempt::Retry)
        } else {
            Err(RtosError::Timeout)
        }
    }

    /// Send from an interrupt handler. Never blocks.
    pub fn queue_send_from_isr(&self, q: QueueId, item: &[u8]) -> Result<()> {
        self.send_from_isr(q, item, false)
    }

    pub fn queue_overwrite_from_isr(&self, q: QueueId, item: &[u8]) -> Result<()> {
        self.send_from_isr(q, item, true)
    }

    fn send_from_isr(&self, q: QueueId, item: &[u8], overwrite: bool) -> Result<()> {
        let (need_switch, allowed) = {
            let mut s = self.critical_from_isr();
            (s.queue_send_isr(q, item, overwrite)?, s.switch_allowed())
        };
        if need_switch && allowed {
            self.port().request_schedule();
        }
        Ok(())
    }

    pub fn queue_receive_from_isr(&self, q: QueueId, buf: &mut [u8]) -> Result<()> {
        let (need_switch, allowed) = {
            let mut s = self.critical_from_isr();
            (s.queue_receive_isr(q, buf)?, s.switch_allowed())
        };
        if need_switch && allowed {
            self.port().request_schedule();
        }
        Ok(())
    }

    pub fn queue_peek_from_isr(&self, q: QueueId, buf: &mut [u8]) -> Result<()> {
        let mut s = self.critical_from_isr();
        s.queue_len_check(q, buf.len())?;
        let queue = s.queue_mut(q);
        if queue.is_empty() {
            return Err(RtosError::QueueEmpty);
        }
        queue.peek_out(buf);
        Ok(())
    }

    /// Empty the queue. A `new_queue` reset also detaches every waiter;
    /// otherwise one waiting sender is woken since room just appeared.
    pub fn queue_reset(&self, q: QueueId, new_queue: bool) -> Result<()> {
        let mut s = self.critical();
        s.queue_checked(q)?;
        s.queue_mut(q).rewind();

        if new_queue {
            for list in [
                ListId::queue_senders(q.index()),
                ListId::queue_receivers(q.index()),
            ] {
                while let Some(id) = s.lists.head_owner(list) {
                    s.remove_event(id);
                }
            }
        } else if s.unblock_head(ListId::queue_senders(q.index())) {
            self.port().request_schedule();
        }
        Ok(())
    }

    /// Block the caller on the queue's receive list until an item arrives
    /// or `ticks` pass, without taking anything. With `suspend` the wait
    /// has no deadline.
    pub fn queue_wait(&self, q: QueueId, ticks: TickType, suspend: bool) -> Result<()> {
        self.critical().queue_checked(q)?;
        let ticks = if suspend { TickType::FOREVER } else { ticks };

        self.lock();
        let blocked = {
            let mut s = self.critical();
            s.queue_lock(q);
            let empty = s.queue(q).is_empty();
            if empty {
                s.block_and_pend(ListId::queue_receivers(q.index()), ticks, suspend);
            }
            s.queue_unlock(q);
            empty
        };
        let already_scheduled = self.unlock();
        if blocked && !already_scheduled {
            self.port().request_schedule();
        }
        Ok(())
    }

    /// Free item slots. The counting and tag queries panic on a stale
    /// handle.
    pub fn queue_spaces(&self, q: QueueId) -> usize {
        let s = self.critical();
        let queue = s.queue(q);
        queue.capacity - queue.count
    }

    pub fn queue_spaces_from_isr(&self, q: QueueId) -> usize {
        let s = self.critical_from_isr();
        let queue = s.queue(q);
        queue.capacity - queue.count
    }

    /// Items waiting to be read
    pub fn queue_messages(&self, q: QueueId) -> usize {
        self.critical().queue(q).count
    }

    pub fn queue_messages_from_isr(&self, q: QueueId) -> usize {
        self.critical_from_isr().queue(q).count
    }

    pub fn queue_set_tag(&self, q: QueueId, tag: isize) -> Result<()> {
        let mut s = self.critical();
        s.queue_checked(q)?;
        s.queue_mut(q).tag = tag;
        Ok(())
    }

    pub fn queue_tag(&self, q: QueueId) -> isize {
        self.critical().queue(q).tag
    }
}
