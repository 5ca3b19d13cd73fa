//! Per-CPU run records.
//!
//! One [`PerCpu`] exists per logical CPU for the lifetime of the kernel.
//! The running-thread slots are written only by the owning CPU's dispatch
//! path with interrupts disabled; everything other CPUs may look at is an
//! atomic.

use crate::arch::CpuId;
use crate::thread::{ThreadId, ThreadRef};
use core::cell::UnsafeCell;
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Counters kept per CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStats {
    /// Switches to a different thread.
    pub context_switches: u64,
    /// Reschedule requests sent to this CPU by other CPUs.
    pub reschedule_ipis: u64,
}

pub struct PerCpu {
    id: CpuId,
    online: AtomicBool,
    idle: spin::Once<ThreadRef>,
    current: UnsafeCell<Option<ThreadRef>>,
    /// Mirror of `current` for lock-free diagnostics from other CPUs
    current_tid: AtomicUsize,
    /// 0 while idle, otherwise the running thread's priority plus one
    running_rank: AtomicU32,
    /// Thread switched away from, until the next one finishes the switch
    prev: UnsafeCell<Option<ThreadRef>>,
    pub(crate) irq_depth: AtomicUsize,
    pub(crate) isr_depth: AtomicUsize,
    pub(crate) preempt_count: AtomicUsize,
    pub(crate) need_resched: AtomicBool,
    pub(crate) rcu_nesting: AtomicUsize,
    /// Grace-period sequence observed when the outermost read section began
    pub(crate) rcu_epoch: AtomicU64,
    context_switches: AtomicU64,
    reschedule_ipis: AtomicU64,
}

// The UnsafeCell slots are only touched by the owning CPU with interrupts
// disabled.
unsafe impl Sync for PerCpu {}

impl PerCpu {
    pub(crate) fn new(id: CpuId) -> Self {
        Self {
            id,
            online: AtomicBool::new(false),
            idle: spin::Once::new(),
            current: UnsafeCell::new(None),
            current_tid: AtomicUsize::new(0),
            running_rank: AtomicU32::new(0),
            prev: UnsafeCell::new(None),
            irq_depth: AtomicUsize::new(0),
            isr_depth: AtomicUsize::new(0),
            preempt_count: AtomicUsize::new(0),
            need_resched: AtomicBool::new(false),
            rcu_nesting: AtomicUsize::new(0),
            rcu_epoch: AtomicU64::new(0),
            context_switches: AtomicU64::new(0),
            reschedule_ipis: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Whether the CPU has been brought up and runs its dispatch loop.
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn set_online(&self) {
        self.online.store(true, Ordering::Release);
    }

    pub fn idle_thread(&self) -> Option<&ThreadRef> {
        self.idle.get()
    }

    pub(crate) fn init_idle(&self, idle: ThreadRef) -> &ThreadRef {
        self.idle.call_once(|| idle)
    }

    /// Thread running on this CPU, readable from anywhere.
    pub fn current_id(&self) -> Option<ThreadId> {
        ThreadId::from_raw(self.current_tid.load(Ordering::Relaxed))
    }

    /// # Safety
    ///
    /// Caller runs on this CPU with interrupts disabled.
    pub(crate) unsafe fn current(&self) -> Option<ThreadRef> {
        unsafe { (*self.current.get()).clone() }
    }

    pub(crate) fn running_rank(&self) -> u32 {
        self.running_rank.load(Ordering::Relaxed)
    }

    /// Whether a thread of `priority` should displace what runs here.
    pub fn preemptible_by(&self, priority: u8) -> bool {
        self.running_rank() <= u32::from(priority)
    }

    /// # Safety
    ///
    /// Caller runs on this CPU with interrupts disabled.
    pub(crate) unsafe fn set_current(&self, thread: ThreadRef) {
        self.current_tid.store(thread.id().get(), Ordering::Relaxed);
        let rank = if thread.is_idle() { 0 } else { u32::from(thread.priority()) + 1 };
        self.running_rank.store(rank, Ordering::Relaxed);
        unsafe { *self.current.get() = Some(thread) };
    }

    /// # Safety
    ///
    /// Caller runs on this CPU with interrupts disabled.
    pub(crate) unsafe fn set_prev(&self, thread: ThreadRef) {
        unsafe { *self.prev.get() = Some(thread) };
    }

    /// # Safety
    ///
    /// Caller runs on this CPU with interrupts disabled.
    pub(crate) unsafe fn take_prev(&self) -> Option<ThreadRef> {
        unsafe { (*self.prev.get()).take() }
    }

    /// Interrupt-disable nesting depth.
    pub fn irq_depth(&self) -> usize {
        self.irq_depth.load(Ordering::Relaxed)
    }

    pub fn in_isr(&self) -> bool {
        self.isr_depth.load(Ordering::Relaxed) > 0
    }

    pub fn preempt_count(&self) -> usize {
        self.preempt_count.load(Ordering::Relaxed)
    }

    /// Whether a reader is inside an RCU read-side section on this CPU.
    pub fn in_rcu_read(&self) -> bool {
        self.rcu_nesting.load(Ordering::SeqCst) > 0
    }

    pub fn need_resched(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    pub(crate) fn set_need_resched(&self) {
        self.need_resched.store(true, Ordering::Release);
    }

    pub(crate) fn clear_need_resched(&self) -> bool {
        self.need_resched.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn count_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_ipi(&self) {
        self.reschedule_ipis.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CpuStats {
        CpuStats {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            reschedule_ipis: self.reschedule_ipis.load(Ordering::Relaxed),
        }
    }
}

impl core::fmt::Debug for PerCpu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PerCpu")
            .field("id", &self.id)
            .field("online", &self.is_online())
            .field("current", &self.current_id())
            .field("irq_depth", &self.irq_depth())
            .field("need_resched", &self.need_resched())
            .finish()
    }
}
