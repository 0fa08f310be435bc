use mindgrove_kernel::{
    config, Kernel, KernelConfig, PriorityLookup, QueueId, RtosError, SchedulerState, SimPort,
    TaskId, TaskState, TickType,
};

extern "C" fn spin(_: usize) -> ! {
    loop {
        std::hint::spin_loop();
    }
}

fn stack() -> &'static mut [usize] {
    Box::leak(vec![0usize; 256].into_boxed_slice())
}

fn bytes(len: usize) -> &'static mut [u8] {
    Box::leak(vec![0u8; len].into_boxed_slice())
}

fn started(config: KernelConfig) -> &'static Kernel<SimPort> {
    let kernel = Box::leak(Box::new(Kernel::new(SimPort::new(), config)));
    kernel.start(stack()).unwrap();
    kernel.port().take_schedule_requests();
    kernel
}

fn spawn(k: &Kernel<SimPort>, priority: usize, name: &str) -> TaskId {
    k.task_create(spin, 0, stack(), priority, name).unwrap()
}

fn send(k: &Kernel<SimPort>, q: QueueId, v: u32) -> Result<(), RtosError> {
    k.queue_send(q, &v.to_le_bytes(), TickType::zero())
}

fn receive(k: &Kernel<SimPort>, q: QueueId) -> Result<u32, RtosError> {
    let mut buf = [0u8; 4];
    k.queue_receive(q, &mut buf, TickType::zero())?;
    Ok(u32::from_le_bytes(buf))
}

#[test]
fn highest_priority_ready_task_runs_first() {
    for lookup in [PriorityLookup::Bitmap, PriorityLookup::Scan] {
        let k = started(KernelConfig::new().priority_lookup(lookup));
        let order = [(4, "a"), (7, "b"), (2, "c"), (7, "d"), (4, "e")];
        let ids: Vec<(usize, TaskId)> = order
            .iter()
            .map(|&(p, name)| (p, spawn(k, p, name)))
            .collect();

        // Expected: by priority, ties by arrival
        let mut expected = ids.clone();
        expected.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, id) in expected {
            k.switch_context();
            assert_eq!(k.current_task(), Some(id));
            k.task_suspend(None);
        }
        k.switch_context();
        assert_eq!(k.task_priority(None), config::IDLE_PRIORITY);
    }
}

#[test]
fn every_task_has_one_state() {
    let k = started(KernelConfig::new());
    let a = spawn(k, 3, "a");
    let b = spawn(k, 3, "b");
    let c = spawn(k, 1, "c");

    k.switch_context();
    k.task_sleep(TickType::new(10));
    k.switch_context();
    k.task_suspend(Some(c));

    assert_eq!(k.task_state(a), TaskState::Blocked);
    assert_eq!(k.task_state(b), TaskState::Running);
    assert_eq!(k.task_state(c), TaskState::Suspended);
    assert_eq!(k.task_count(), 4);
}

#[test]
fn sleep_wakes_within_one_tick_of_deadline() {
    let k = started(KernelConfig::new());
    for delay in [1u32, 2, 7, 31] {
        let t = spawn(k, 2, "sleeper");
        k.switch_context();
        let entered = k.tick_count();
        k.task_sleep(TickType::new(delay));
        k.switch_context();

        let mut woke_at = None;
        for _ in 0..delay + 1 {
            k.tick();
            if k.task_state(t) == TaskState::Ready {
                woke_at = Some(k.tick_count());
                break;
            }
        }
        assert_eq!(woke_at, Some(entered.wrapping_add(TickType::new(delay))));
        k.task_delete(Some(t));
    }
}

#[test]
fn wrap_keeps_deadlines_in_order() {
    let k = started(KernelConfig::new().initial_tick(TickType::new(u32::MAX - 5)));
    let delays = [3u32, 9, 6, 12];
    let mut tasks = Vec::new();
    for (i, &d) in delays.iter().enumerate() {
        let t = spawn(k, 1 + i, "w");
        k.switch_context();
        assert_eq!(k.current_task(), Some(t));
        k.task_sleep(TickType::new(d));
        k.switch_context();
        tasks.push((d, t));
    }

    let mut woken = Vec::new();
    for _ in 0..12 {
        k.tick();
        for &(d, t) in &tasks {
            if k.task_state(t) != TaskState::Blocked && !woken.contains(&d) {
                woken.push(d);
            }
        }
    }
    assert_eq!(woken, vec![3, 6, 9, 12]);
    assert_eq!(k.overflow_count(), 1);
}

#[test]
fn queue_is_fifo() {
    let k = started(KernelConfig::new());
    let q = k.queue_create(3, 4, bytes(12)).unwrap();
    for v in [1, 2, 3] {
        send(k, q, v).unwrap();
    }
    assert_eq!(send(k, q, 4), Err(RtosError::QueueFull));
    assert_eq!(receive(k, q), Ok(1));
    assert_eq!(receive(k, q), Ok(2));
    assert_eq!(receive(k, q), Ok(3));
    assert_eq!(receive(k, q), Err(RtosError::QueueEmpty));
}

#[test]
fn overwrite_keeps_only_newest_in_single_slot_queue() {
    let k = started(KernelConfig::new());
    let q = k.queue_create(1, 4, bytes(4)).unwrap();
    k.queue_overwrite(q, &7u32.to_le_bytes()).unwrap();
    k.queue_overwrite_from_isr(q, &8u32.to_le_bytes()).unwrap();
    assert_eq!(k.queue_messages(q), 1);
    assert_eq!(receive(k, q), Ok(8));
    assert_eq!(k.queue_messages_from_isr(q), 0);
}

#[test]
fn waiting_consumer_is_woken_by_sender() {
    let k = started(KernelConfig::new());
    let q = k.queue_create(1, 4, bytes(4)).unwrap();
    let consumer = spawn(k, 4, "consumer");
    k.switch_context();

    k.queue_wait(q, TickType::new(100), false).unwrap();
    k.switch_context();
    assert_eq!(k.task_state(consumer), TaskState::Blocked);

    k.port().take_schedule_requests();
    send(k, q, 99).unwrap();
    assert_eq!(k.port().take_schedule_requests(), 1);
    k.switch_context();
    assert_eq!(k.current_task(), Some(consumer));
    assert_eq!(receive(k, q), Ok(99));
}

#[test]
fn reset_always_empties() {
    let k = started(KernelConfig::new());
    let q = k.queue_create(4, 4, bytes(16)).unwrap();
    for fill in 0..=4 {
        for v in 0..fill {
            send(k, q, v).unwrap();
        }
        k.queue_reset(q, false).unwrap();
        assert_eq!(k.queue_messages(q), 0);
        assert_eq!(k.queue_spaces(q), 4);
        assert_eq!(receive(k, q), Err(RtosError::QueueEmpty));
    }
}

#[test]
fn holder_inherits_and_reverts() {
    let k = started(KernelConfig::new());
    let m = k.mutex_create().unwrap();
    let low = spawn(k, 1, "L");
    k.switch_context();
    k.mutex_lock(m, TickType::zero()).unwrap();

    let high = spawn(k, 6, "H");
    k.switch_context();
    assert_eq!(k.current_task(), Some(high));
    assert_eq!(k.mutex_lock(m, TickType::zero()), Err(RtosError::ResourceBusy));

    // What a blocking lock does before parking
    assert!(k.priority_inherit(low));
    assert_eq!(k.task_priority(Some(low)), 6);

    k.task_suspend(None);
    k.switch_context();
    assert_eq!(k.current_task(), Some(low));
    k.mutex_unlock(m).unwrap();
    assert_eq!(k.task_priority(Some(low)), 1);
}

#[test]
fn scheduler_lock_defers_switches() {
    let k = started(KernelConfig::new());
    let idle = k.current_task();
    k.lock();
    assert_eq!(k.scheduler_state(), SchedulerState::Locked);
    spawn(k, 5, "late");
    k.switch_context();
    assert_eq!(k.current_task(), idle);
    assert!(k.unlock());
    assert_eq!(k.scheduler_state(), SchedulerState::Running);
}

#[test]
fn signals_count_up_to_the_ceiling() {
    let k = started(KernelConfig::new());
    let t = spawn(k, 2, "t");
    let accepted = (0..20).filter(|_| k.signal_emit(t)).count();
    assert_eq!(accepted as isize, config::SIGNAL_MAX_COUNT);

    k.switch_context();
    let taken = (0..20).filter(|_| k.signal_wait(TickType::zero())).count();
    assert_eq!(taken as isize, config::SIGNAL_MAX_COUNT);
}
