//! Test helper utilities and common functionality.

use crate::arch::host::HostArch;
use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::thread::{Thread, ThreadId, ThreadRef, ThreadState};
use alloc::boxed::Box;
use alloc::sync::Arc;

pub type TestKernel = Kernel<HostArch>;

/// Give up on a condition after this long.
const WAIT_LIMIT: std::time::Duration = std::time::Duration::from_secs(20);

/// A thread no kernel knows about, for exercising data structures.
pub fn detached_thread(id: usize, priority: u8) -> ThreadRef {
    let id = ThreadId::from_raw(id).expect("thread ids start at 1");
    Arc::new(Thread::new(id, None, None, priority, None))
}

/// Boot a kernel with `num_cpus` CPUs and default settings.
///
/// The calling test thread becomes CPU 0's idle thread; every other CPU
/// gets a host thread running its idle loop.
pub fn boot_kernel(num_cpus: usize) -> &'static TestKernel {
    boot_with(KernelConfig::default().with_cpus(num_cpus))
}

pub fn boot_with(config: KernelConfig) -> &'static TestKernel {
    let kernel: &'static TestKernel =
        Box::leak(Box::new(Kernel::new(config).expect("invalid test configuration")));
    kernel.boot_cpu(0);

    for cpu in 1..kernel.num_cpus() {
        std::thread::Builder::new()
            .name(std::format!("cpu{}", cpu))
            .spawn(move || {
                kernel.boot_cpu(cpu);
                kernel.idle_loop();
            })
            .expect("failed to start cpu thread");
    }
    wait_for(|| (0..kernel.num_cpus()).all(|cpu| kernel.cpu(cpu).map_or(false, |c| c.is_online())));
    kernel
}

/// Spin the host thread until `done` holds, without touching the kernel.
pub fn wait_for<F: FnMut() -> bool>(mut done: F) {
    let start = std::time::Instant::now();
    while !done() {
        assert!(start.elapsed() < WAIT_LIMIT, "timed out waiting for condition");
        std::thread::yield_now();
    }
}

/// Drive CPU 0 from its idle thread until `done` holds.
///
/// Each round delivers a timer tick and yields, so sleepers expire and
/// runnable threads get the CPU.
pub fn run_until<F: FnMut() -> bool>(kernel: &TestKernel, mut done: F) {
    let start = std::time::Instant::now();
    while !done() {
        assert!(start.elapsed() < WAIT_LIMIT, "timed out waiting for condition");
        kernel.timer_interrupt();
        kernel.preempt_if_needed();
        kernel.yield_now();
        std::thread::yield_now();
    }
}

pub fn is_blocked(thread: &Thread) -> bool {
    thread.state() == ThreadState::Blocked
}
