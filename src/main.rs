#![no_std]              // No standard library (embedded)
#![no_main]             // Custom entry point

use core::fmt::Write;
use core::panic::PanicInfo;
use core::sync::atomic::{AtomicUsize, Ordering};

use riscv_rt::entry;     // Provides #[entry] macro

use mindgrove_kernel::arch::riscv::{self, RiscvPort};
use mindgrove_kernel::{Kernel, KernelConfig, QueueId, TaskId, TickType};

static KERNEL: Kernel<RiscvPort> = Kernel::new(
    RiscvPort::new(),
    KernelConfig::new().low_power(TickType::new(5)),
);

/// Handles published by `main` for the tasks
static CHANNEL: AtomicUsize = AtomicUsize::new(0);
static MONITOR: AtomicUsize = AtomicUsize::new(0);

/// Hand out a `'static` buffer backed by its own static
macro_rules! static_buffer {
    ($ty:ty, $len:expr) => {{
        static mut BUF: [$ty; $len] = [0; $len];
        // SAFETY: each expansion is its own static, taken exactly once
        unsafe { &mut *core::ptr::addr_of_mut!(BUF) }
    }};
}

// ============================================================================
// UART
// ============================================================================

const UART_BASE: usize = 0x10000000;

struct Uart;

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for b in s.bytes() {
            // SAFETY: the virt board's 16550 transmit register
            unsafe { core::ptr::write_volatile(UART_BASE as *mut u8, b) };
        }
        Ok(())
    }
}

struct UartLogger;

impl log::Log for UartLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let _ = write!(Uart, "[{:>5}] {}\r\n", record.level(), record.args());
    }

    fn flush(&self) {}
}

static LOGGER: UartLogger = UartLogger;

// ============================================================================
// TASK FUNCTIONS
// ============================================================================

/// Sends a counter every quarter second
extern "C" fn producer(_: usize) -> ! {
    let queue = QueueId::from_raw(CHANNEL.load(Ordering::Relaxed));
    let mut count: u32 = 0;
    loop {
        if KERNEL
            .queue_send(queue, &count.to_le_bytes(), TickType::from_ms(100))
            .is_err()
        {
            log::warn!("producer: queue stayed full");
        }
        count = count.wrapping_add(1);
        KERNEL.task_sleep(TickType::from_ms(250));
    }
}

/// Prints every item and pokes the monitor every fifth one
extern "C" fn consumer(_: usize) -> ! {
    let queue = QueueId::from_raw(CHANNEL.load(Ordering::Relaxed));
    let monitor = TaskId::from_raw(MONITOR.load(Ordering::Relaxed));
    let mut buf = [0u8; 4];
    loop {
        if KERNEL.queue_receive(queue, &mut buf, TickType::FOREVER).is_ok() {
            let value = u32::from_le_bytes(buf);
            log::info!("consumer: got {} at tick {}", value, KERNEL.tick_count());
            if value % 5 == 4 {
                KERNEL.signal_emit(monitor);
            }
        }
    }
}

extern "C" fn monitor(_: usize) -> ! {
    loop {
        if KERNEL.signal_wait(TickType::FOREVER) {
            log::info!(
                "monitor: {} tasks, {} queued, tick {}",
                KERNEL.task_count(),
                KERNEL.queue_messages(QueueId::from_raw(CHANNEL.load(Ordering::Relaxed))),
                KERNEL.tick_count()
            );
        }
    }
}

// ============================================================================
// MAIN
// ============================================================================

#[entry]
fn main() -> ! {
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(log::LevelFilter::Info);
    log::info!("mindgrove kernel demo on QEMU virt");

    riscv::attach(&KERNEL);
    KERNEL.init();

    let created = KERNEL
        .queue_create(4, 4, static_buffer!(u8, 16))
        .and_then(|queue| {
            CHANNEL.store(queue.into_raw(), Ordering::Relaxed);
            KERNEL.task_create(monitor, 0, static_buffer!(usize, 1024), 1, "monitor")
        })
        .and_then(|id| {
            MONITOR.store(id.into_raw(), Ordering::Relaxed);
            KERNEL.task_create(consumer, 0, static_buffer!(usize, 1024), 3, "consumer")
        })
        .and_then(|_| KERNEL.task_create(producer, 0, static_buffer!(usize, 1024), 2, "producer"))
        .and_then(|_| KERNEL.start(static_buffer!(usize, 512)));

    match created {
        Err(e) => log::error!("start-up failed: {}", e),
        Ok(()) => log::error!("scheduler returned"),
    }
    halt()
}

fn halt() -> ! {
    loop {
        // SAFETY: parks the hart
        unsafe { core::arch::asm!("wfi") };
    }
}

#[no_mangle]
#[allow(non_snake_case)]
extern "C" fn MachineTimer() {
    riscv::timer_interrupt();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let _ = write!(Uart, "\r\n*** PANIC ***\r\n");
    if let Some(location) = info.location() {
        let _ = write!(Uart, "Location: {}:{}:{}\r\n", location.file(), location.line(), location.column());
    }
    let _ = write!(Uart, "Message: {}\r\nSystem halted.\r\n", info.message());
    halt()
}
