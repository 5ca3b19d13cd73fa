//! Scheduler plugin contract.

use crate::arch::CpuId;
use crate::thread::{Thread, ThreadRef};

/// Identifies the scheduler instance that owns a thread.
pub type SchedulerId = usize;

/// Counters a scheduler reports for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedStats {
    /// Threads registered and not yet destroyed.
    pub threads: usize,
    /// Threads currently sitting in the ready set.
    pub runnable: usize,
    /// Dispatch decisions that returned a thread.
    pub dispatched: u64,
    /// Wakeups delivered through `thread_woken`/`thread_woken_isr`.
    pub woken: u64,
    /// Threads taken from another CPU's ready set.
    pub stolen: u64,
}

/// A scheduling policy.
///
/// The kernel calls every method with local interrupts disabled, so an
/// implementation may guard its ready set with plain spinlocks and still be
/// safe against the interrupt-time wake path on the same CPU. Methods must
/// never block.
///
/// Threads handed to `enqueue`, `thread_woken`, `thread_woken_isr` and
/// `yield_current` are already [`Runnable`](crate::thread::ThreadState::Runnable).
/// `dispatch_next` must only return threads it was handed that way and has
/// not returned since; every such thread must eventually be returned for
/// some CPU it may run on, within a bounded number of decisions.
pub trait Scheduler: Send + Sync {
    /// Short policy name for diagnostics.
    fn name(&self) -> &'static str;

    /// A thread was registered with this scheduler.
    fn thread_added(&self, thread: &Thread) {
        let _ = thread;
    }

    /// Make a runnable thread eligible for dispatch.
    ///
    /// Returns the CPU whose ready set received it, or `None` if any CPU
    /// may pick it up.
    fn enqueue(&self, thread: ThreadRef) -> Option<CpuId>;

    /// Select the next thread to run on `cpu`.
    ///
    /// `None` means the ready set has nothing for this CPU and the kernel
    /// falls back to the idle thread.
    fn dispatch_next(&self, cpu: CpuId) -> Option<ThreadRef>;

    /// A blocked thread was woken from thread context.
    fn thread_woken(&self, thread: ThreadRef) -> Option<CpuId> {
        self.enqueue(thread)
    }

    /// A blocked thread was woken from interrupt context.
    ///
    /// May defer the expensive part of the requeue to the next dispatch.
    fn thread_woken_isr(&self, thread: ThreadRef) -> Option<CpuId>;

    /// The running thread left the ready set voluntarily.
    fn thread_blocked(&self, thread: &Thread) {
        let _ = thread;
    }

    /// The running thread gave up the CPU but stays runnable.
    fn yield_current(&self, thread: ThreadRef) -> Option<CpuId> {
        self.enqueue(thread)
    }

    /// An exited thread is being reaped; drop any reference to it.
    fn thread_destroy(&self, thread: &Thread);

    /// Timer tick on `cpu` while `current` runs; `true` asks for preemption.
    fn on_tick(&self, cpu: CpuId, current: &Thread) -> bool {
        let _ = (cpu, current);
        false
    }

    /// Get scheduler statistics.
    fn stats(&self) -> SchedStats {
        SchedStats::default()
    }
}

/// Priority levels for threads.
///
/// These are convenience constants for common priority levels.
pub mod priority {
    /// Idle priority - only runs when nothing else is ready
    pub const IDLE: u8 = 0;

    /// Low priority - background tasks
    pub const LOW: u8 = 64;

    /// Normal priority - default for most threads
    pub const NORMAL: u8 = 128;

    /// High priority - important system tasks
    pub const HIGH: u8 = 192;

    /// Real-time priority - critical system operations
    pub const REALTIME: u8 = 255;
}
