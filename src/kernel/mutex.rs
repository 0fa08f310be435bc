// Mutual exclusion with priority inheritance

use crate::arch::Port;
use crate::kernel::list::ListId;
use crate::kernel::scheduler::{Attempt, Kernel, State, Wait};
use crate::kernel::types::*;

pub(crate) struct KernelMutex {
    holder: Option<TaskId>,
}

impl State {
    /// The live mutex behind `m`; a deleted or foreign handle is
    /// `InvalidParameter`
    fn mutex_mut(&mut self, m: MutexId) -> Result<&mut KernelMutex> {
        self.mutexes
            .get_mut(m.index())
            .and_then(Option::as_mut)
            .ok_or(RtosError::InvalidParameter)
    }

    fn mutex_holder(&mut self, m: MutexId) -> Result<Option<TaskId>> {
        Ok(self.mutex_mut(m)?.holder)
    }

    /// Priority of the best task still waiting on `m`, or idle if none
    fn highest_waiting(&self, m: MutexId) -> Priority {
        self.lists
            .head_owner(ListId::mutex_waiters(m.index()))
            .map_or(config::IDLE_PRIORITY, |id| self.tcb(id).priority)
    }
}

impl<P: Port> Kernel<P> {
    pub fn mutex_create(&self) -> Result<MutexId> {
        let id = {
            let mut s = self.critical();
            let slot = s
                .mutexes
                .iter()
                .position(Option::is_none)
                .ok_or(RtosError::OutOfMemory)?;
            s.mutexes[slot] = Some(KernelMutex { holder: None });
            MutexId(slot as u8)
        };
        debug!("mutex {} created", id);
        Ok(id)
    }

    /// Free an unheld mutex nobody waits on
    pub fn mutex_delete(&self, m: MutexId) -> Result<()> {
        let mut s = self.critical();
        if s.mutex_holder(m)?.is_some() || !s.lists.is_empty(ListId::mutex_waiters(m.index())) {
            return Err(RtosError::ResourceBusy);
        }
        s.mutexes[m.index()] = None;
        Ok(())
    }

    /// Current holder; `None` also for a stale handle
    pub fn mutex_holder(&self, m: MutexId) -> Option<TaskId> {
        self.critical().mutex_holder(m).ok().flatten()
    }

    /// Take `m`, waiting up to `ticks`. While waiting, the holder runs at
    /// the caller's priority if that is higher.
    pub fn mutex_lock(&self, m: MutexId, ticks: TickType) -> Result<()> {
        self.run_blocking(ticks, |wait| self.lock_attempt(m, wait))
    }

    pub(crate) fn lock_attempt(&self, m: MutexId, wait: &mut Wait) -> Result<Attempt<()>> {
        {
            let mut s = self.critical();
            if s.mutex_holder(m)?.is_none() {
                let holder = s.take_mutex_holder();
                s.mutex_mut(m)?.holder = holder;
                return Ok(Attempt::Done(()));
            }
            if wait.remaining.is_zero() {
                return Err(RtosError::ResourceBusy);
            }
            if wait.timeout.is_none() {
                wait.timeout = Some(s.timeout_state());
            }
        }

        self.lock();
        let outcome = {
            let mut s = self.critical();
            let mut timeout = wait.timeout.unwrap_or_else(|| s.timeout_state());
            let expired = s.check_timeout(&mut timeout, &mut wait.remaining);
            wait.timeout = Some(timeout);

            match s.mutex_holder(m) {
                Err(e) => Err(e),
                Ok(None) => Ok(false),
                Ok(Some(holder)) if !expired => {
                    if s.priority_inherit(holder) {
                        trace!("task {} inherits priority through {}", holder, m);
                    }
                    s.event_add(ListId::mutex_waiters(m.index()), wait.remaining);
                    Ok(true)
                }
                Ok(Some(holder)) => {
                    let highest = s.highest_waiting(m);
                    s.priority_disinherit_after_timeout(holder, highest);
                    Err(RtosError::Timeout)
                }
            }
        };
        let already_scheduled = self.unlock();

        match outcome? {
            true => Ok(Attempt::Parked { already_scheduled }),
            false => Ok(Attempt::Retry),
        }
    }

    /// Release `m`. Only the holder may do so.
    pub fn mutex_unlock(&self, m: MutexId) -> Result<()> {
        let reschedule = {
            let mut s = self.critical();
            let caller = s.current;
            let holder = match s.mutex_holder(m)? {
                Some(holder) if Some(holder) == caller => holder,
                _ => return Err(RtosError::InvalidParameter),
            };

            let restored = s.priority_disinherit(holder);
            if restored {
                trace!("task {} released {}, back to base priority", holder, m);
            }
            s.mutex_mut(m)?.holder = None;
            let woken = s.unblock_head(ListId::mutex_waiters(m.index()));
            restored || woken
        };
        if reschedule {
            self.port().request_schedule();
        }
        Ok(())
    }
}
