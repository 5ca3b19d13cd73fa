//! The schedulable thread.
//!
//! A [`Thread`] is shared through [`ThreadRef`] (`Arc<Thread>`). Ready queues,
//! wait queues and the sleep queue are intrusive lists threaded through the
//! [`Link`] fields embedded here, so blocking and waking never allocate.

use crate::arch::{ContextHandle, CpuId};
use crate::sched::SchedulerId;
use crate::sync::WaitQueue;
use crate::time::Instant;
use core::cell::UnsafeCell;
use core::num::NonZeroUsize;
use portable_atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};

extern crate alloc;
use alloc::string::String;
use alloc::sync::Arc;

pub mod builder;
pub mod handle;
pub(crate) mod list;

pub use builder::ThreadBuilder;
pub use handle::JoinHandle;

/// Shared handle to a thread.
pub type ThreadRef = Arc<Thread>;

const NO_SCHEDULER: usize = usize::MAX;
const NO_CPU: usize = usize::MAX;
const TIMER_DISARMED: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroUsize);

impl core::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ThreadId {
    /// Create a new thread ID.
    pub const fn new(id: NonZeroUsize) -> Self {
        Self(id)
    }

    /// Thread ID from a raw value, `None` for zero.
    pub fn from_raw(id: usize) -> Option<Self> {
        NonZeroUsize::new(id).map(Self)
    }

    /// Get the raw ID value.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ThreadState {
    /// Eligible to run, not on a CPU.
    Runnable = 0,
    /// Executing on a CPU.
    Running = 1,
    /// Waiting on a wait queue or sleep timer.
    Blocked = 2,
    /// Terminal.
    Exited = 3,
}

impl ThreadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ThreadState::Runnable,
            1 => ThreadState::Running,
            2 => ThreadState::Blocked,
            _ => ThreadState::Exited,
        }
    }
}

/// Intrusive list membership.
///
/// `next` is only touched by the holder of the lock guarding the list the
/// thread is linked into; a thread is on at most one list per link.
pub(crate) struct Link {
    next: UnsafeCell<Option<ThreadRef>>,
    linked: AtomicBool,
}

impl Link {
    const fn new() -> Self {
        Self {
            next: UnsafeCell::new(None),
            linked: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_linked(&self) -> bool {
        self.linked.load(Ordering::Acquire)
    }

    pub(crate) fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::Release);
    }

    /// # Safety
    ///
    /// Caller holds exclusive access to the list this link belongs to.
    pub(crate) unsafe fn next_mut(&self) -> &mut Option<ThreadRef> {
        unsafe { &mut *self.next.get() }
    }

    /// # Safety
    ///
    /// Caller holds shared access to the list this link belongs to and no
    /// one mutates it for the returned lifetime.
    pub(crate) unsafe fn next_ref(&self) -> Option<&ThreadRef> {
        unsafe { (*self.next.get()).as_ref() }
    }
}

pub struct Thread {
    id: ThreadId,
    name: Option<String>,
    idle: bool,
    state: AtomicU8,
    context: Option<ContextHandle>,
    sched: AtomicUsize,
    priority: AtomicU8,
    affinity: AtomicUsize,
    last_cpu: AtomicUsize,
    on_cpu: AtomicBool,
    saved_irq_depth: AtomicUsize,
    wakeup_time: AtomicU64,
    tls: AtomicUsize,
    sched_data: AtomicU64,
    pub(crate) wait_link: Link,
    pub(crate) run_link: Link,
    pub(crate) sleep_link: Link,
    pub(crate) exit_wq: WaitQueue,
}

// Link::next is guarded by the owning list's lock.
unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    /// Create a runnable thread.
    ///
    /// Threads backed by a context start as if suspended inside the
    /// scheduler, with one level of interrupt masking to unwind.
    pub(crate) fn new(
        id: ThreadId,
        context: Option<ContextHandle>,
        name: Option<String>,
        priority: u8,
        affinity: Option<CpuId>,
    ) -> Self {
        Self {
            id,
            name,
            idle: false,
            state: AtomicU8::new(ThreadState::Runnable as u8),
            context,
            sched: AtomicUsize::new(NO_SCHEDULER),
            priority: AtomicU8::new(priority),
            affinity: AtomicUsize::new(affinity.unwrap_or(NO_CPU)),
            last_cpu: AtomicUsize::new(NO_CPU),
            on_cpu: AtomicBool::new(false),
            saved_irq_depth: AtomicUsize::new(1),
            wakeup_time: AtomicU64::new(TIMER_DISARMED),
            tls: AtomicUsize::new(0),
            sched_data: AtomicU64::new(0),
            wait_link: Link::new(),
            run_link: Link::new(),
            sleep_link: Link::new(),
            exit_wq: WaitQueue::new(()),
        }
    }

    /// The idle thread of `cpu`, adopted from the flow that booted it.
    pub(crate) fn new_idle(id: ThreadId, context: ContextHandle, cpu: CpuId) -> Self {
        let mut thread = Self::new(id, Some(context), None, crate::sched::priority::IDLE, Some(cpu));
        thread.idle = true;
        thread.state = AtomicU8::new(ThreadState::Running as u8);
        thread.on_cpu = AtomicBool::new(true);
        thread.last_cpu = AtomicUsize::new(cpu);
        thread.saved_irq_depth = AtomicUsize::new(0);
        thread
    }

    /// Get the thread's unique identifier.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Get the thread name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether this is a CPU's idle thread.
    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Get the thread's current state.
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, new_state: ThreadState) {
        self.state.store(new_state as u8, Ordering::Release);
    }

    /// Atomically move from `from` to `to`; `false` if the thread was not in `from`.
    pub(crate) fn transition(&self, from: ThreadState, to: ThreadState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Check if this thread is runnable (ready or running).
    pub fn is_runnable(&self) -> bool {
        matches!(self.state(), ThreadState::Runnable | ThreadState::Running)
    }

    pub(crate) fn context(&self) -> Option<ContextHandle> {
        self.context
    }

    /// Scheduler instance that owns this thread, `None` before registration.
    pub fn scheduler(&self) -> Option<SchedulerId> {
        match self.sched.load(Ordering::Acquire) {
            NO_SCHEDULER => None,
            id => Some(id),
        }
    }

    pub(crate) fn set_scheduler(&self, id: SchedulerId) {
        self.sched.store(id, Ordering::Release);
    }

    /// Get the thread's priority.
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    /// Set the thread's priority.
    ///
    /// Takes effect the next time the thread is enqueued.
    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Release);
    }

    /// CPU this thread is pinned to, if any.
    pub fn affinity(&self) -> Option<CpuId> {
        match self.affinity.load(Ordering::Acquire) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_affinity(&self, cpu: Option<CpuId>) {
        self.affinity.store(cpu.unwrap_or(NO_CPU), Ordering::Release);
    }

    /// Whether the thread may be dispatched on `cpu`.
    pub fn can_run_on(&self, cpu: CpuId) -> bool {
        self.affinity().map_or(true, |pinned| pinned == cpu)
    }

    /// CPU the thread last ran on.
    pub fn last_cpu(&self) -> Option<CpuId> {
        match self.last_cpu.load(Ordering::Relaxed) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    pub(crate) fn set_last_cpu(&self, cpu: CpuId) {
        self.last_cpu.store(cpu, Ordering::Relaxed);
    }

    /// Whether the thread's context is still live on some CPU.
    pub fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_cpu(&self, on_cpu: bool) {
        self.on_cpu.store(on_cpu, Ordering::Release);
    }

    pub(crate) fn saved_irq_depth(&self) -> usize {
        self.saved_irq_depth.load(Ordering::Relaxed)
    }

    pub(crate) fn save_irq_depth(&self, depth: usize) {
        self.saved_irq_depth.store(depth, Ordering::Relaxed);
    }

    /// Deadline of the armed sleep timer.
    pub fn wakeup_time(&self) -> Option<Instant> {
        match self.wakeup_time.load(Ordering::Acquire) {
            TIMER_DISARMED => None,
            nanos => Some(Instant::from_nanos(nanos)),
        }
    }

    pub(crate) fn set_wakeup_time(&self, deadline: Option<Instant>) {
        // Zero is the disarmed marker; a deadline at the epoch fires at 1ns.
        let raw = deadline.map_or(TIMER_DISARMED, |d| d.as_nanos().max(1));
        self.wakeup_time.store(raw, Ordering::Release);
    }

    /// Thread-local storage pointer.
    pub fn tls(&self) -> usize {
        self.tls.load(Ordering::Acquire)
    }

    pub fn set_tls(&self, tls: usize) {
        self.tls.store(tls, Ordering::Release);
    }

    /// Word reserved for the owning scheduler's bookkeeping.
    pub fn sched_data(&self) -> u64 {
        self.sched_data.load(Ordering::Relaxed)
    }

    pub fn set_sched_data(&self, data: u64) {
        self.sched_data.store(data, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("priority", &self.priority())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread(id: usize) -> Thread {
        Thread::new(ThreadId::from_raw(id).unwrap(), None, None, 128, None)
    }

    #[test]
    fn test_thread_state_transitions() {
        let t = thread(1);
        assert_eq!(t.state(), ThreadState::Runnable);
        assert!(t.is_runnable());

        t.set_state(ThreadState::Running);
        assert!(t.transition(ThreadState::Running, ThreadState::Blocked));
        assert!(!t.is_runnable());

        // Only one of two racing wakers wins.
        assert!(t.transition(ThreadState::Blocked, ThreadState::Runnable));
        assert!(!t.transition(ThreadState::Blocked, ThreadState::Runnable));
        assert_eq!(t.state(), ThreadState::Runnable);
    }

    #[test]
    fn test_affinity_and_scheduler() {
        let t = thread(2);
        assert_eq!(t.scheduler(), None);
        assert!(t.can_run_on(3));

        t.set_affinity(Some(1));
        t.set_scheduler(0);
        assert_eq!(t.affinity(), Some(1));
        assert!(t.can_run_on(1));
        assert!(!t.can_run_on(0));
        assert_eq!(t.scheduler(), Some(0));
    }

    #[test]
    fn test_wakeup_time_marker() {
        let t = thread(3);
        assert_eq!(t.wakeup_time(), None);
        t.set_wakeup_time(Some(Instant::from_nanos(500)));
        assert_eq!(t.wakeup_time(), Some(Instant::from_nanos(500)));
        t.set_wakeup_time(Some(Instant::ZERO));
        assert_eq!(t.wakeup_time(), Some(Instant::from_nanos(1)));
        t.set_wakeup_time(None);
        assert_eq!(t.wakeup_time(), None);
    }
}
