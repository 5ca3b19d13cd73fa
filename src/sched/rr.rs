//! Round-robin scheduler with per-CPU FIFO run queues.

use super::trait_def::{SchedStats, Scheduler};
use crate::arch::CpuId;
use crate::thread::list::{RunLink, ThreadList};
use crate::thread::{Thread, ThreadRef};
use portable_atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
extern crate alloc;
use alloc::{boxed::Box, vec::Vec};

/// Default number of ticks in a time slice.
pub const DEFAULT_TIME_SLICE_TICKS: u32 = 10;

/// Round-robin scheduler.
///
/// Each CPU owns a FIFO ready queue. A woken or yielding thread goes to the
/// back of the queue of its pinned CPU, or of the least loaded CPU (ties go
/// to the CPU it last ran on). A CPU whose queue runs dry steals unpinned
/// threads from its neighbours. Priorities are ignored, which makes the
/// policy trivially starvation-free: a queued thread is dispatched after at
/// most as many decisions as there are threads ahead of it.
pub struct RoundRobinScheduler {
    /// Number of CPUs in the system
    num_cpus: usize,
    /// Per-CPU run queues
    run_queues: Box<[CpuRunQueue]>,
    /// Ticks a thread may run while others wait
    time_slice_ticks: u32,
    /// Global statistics
    total_threads: AtomicUsize,
    runnable_threads: AtomicUsize,
    dispatched: AtomicU64,
    woken: AtomicU64,
    stolen: AtomicU64,
}

/// Per-CPU run queue.
struct CpuRunQueue {
    queue: spin::Mutex<ThreadList<RunLink>>,
    /// Thread count for load balancing
    thread_count: AtomicUsize,
    /// Ticks consumed by the thread currently running on this CPU
    ticks: AtomicU32,
}

impl CpuRunQueue {
    fn new() -> Self {
        Self {
            queue: spin::Mutex::new(ThreadList::new()),
            thread_count: AtomicUsize::new(0),
            ticks: AtomicU32::new(0),
        }
    }

    fn pop(&self) -> Option<ThreadRef> {
        let thread = self.queue.lock().pop_front()?;
        self.thread_count.fetch_sub(1, Ordering::AcqRel);
        Some(thread)
    }
}

impl RoundRobinScheduler {
    /// Create a new round-robin scheduler for the given number of CPUs.
    pub fn new(num_cpus: usize) -> Self {
        Self::with_time_slice(num_cpus, DEFAULT_TIME_SLICE_TICKS)
    }

    pub fn with_time_slice(num_cpus: usize, time_slice_ticks: u32) -> Self {
        assert!(num_cpus > 0, "scheduler needs at least one CPU");
        let run_queues: Vec<CpuRunQueue> = (0..num_cpus).map(|_| CpuRunQueue::new()).collect();

        Self {
            num_cpus,
            run_queues: run_queues.into_boxed_slice(),
            time_slice_ticks: time_slice_ticks.max(1),
            total_threads: AtomicUsize::new(0),
            runnable_threads: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            woken: AtomicU64::new(0),
            stolen: AtomicU64::new(0),
        }
    }

    /// Select the CPU whose queue receives `thread`.
    fn select_cpu(&self, thread: &Thread) -> CpuId {
        if let Some(cpu) = thread.affinity() {
            debug_assert!(cpu < self.num_cpus, "affinity {} out of range", cpu);
            return cpu;
        }

        let mut best_cpu = thread.last_cpu().filter(|&cpu| cpu < self.num_cpus).unwrap_or(0);
        let mut min_threads = self.run_queues[best_cpu].thread_count.load(Ordering::Acquire);

        for (cpu_id, queue) in self.run_queues.iter().enumerate() {
            let thread_count = queue.thread_count.load(Ordering::Acquire);
            if thread_count < min_threads {
                min_threads = thread_count;
                best_cpu = cpu_id;
            }
        }

        best_cpu
    }

    fn push(&self, cpu: CpuId, thread: ThreadRef) {
        let queue = &self.run_queues[cpu];
        queue.queue.lock().push_back(thread);
        queue.thread_count.fetch_add(1, Ordering::AcqRel);
        self.runnable_threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Attempt work stealing from other CPUs.
    fn try_steal_work(&self, requesting_cpu: CpuId) -> Option<ThreadRef> {
        let start_cpu = (requesting_cpu + 1) % self.num_cpus;

        for i in 0..self.num_cpus {
            let victim_cpu = (start_cpu + i) % self.num_cpus;
            if victim_cpu == requesting_cpu {
                continue;
            }

            let victim = &self.run_queues[victim_cpu];
            if victim.thread_count.load(Ordering::Acquire) == 0 {
                continue;
            }

            let stolen = victim.queue.lock().remove_first(|t| t.can_run_on(requesting_cpu));
            if let Some(thread) = stolen {
                victim.thread_count.fetch_sub(1, Ordering::AcqRel);
                self.stolen.fetch_add(1, Ordering::Relaxed);
                log::trace!("cpu {} stole thread {} from cpu {}", requesting_cpu, thread.id(), victim_cpu);
                return Some(thread);
            }
        }

        None
    }
}

impl Scheduler for RoundRobinScheduler {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn thread_added(&self, _thread: &Thread) {
        self.total_threads.fetch_add(1, Ordering::AcqRel);
    }

    fn enqueue(&self, thread: ThreadRef) -> Option<CpuId> {
        let cpu = self.select_cpu(&thread);
        self.push(cpu, thread);
        Some(cpu)
    }

    fn dispatch_next(&self, cpu: CpuId) -> Option<ThreadRef> {
        if cpu >= self.num_cpus {
            return None;
        }

        let queue = &self.run_queues[cpu];
        let thread = queue.pop().or_else(|| self.try_steal_work(cpu))?;

        self.runnable_threads.fetch_sub(1, Ordering::AcqRel);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        queue.ticks.store(0, Ordering::Relaxed);
        Some(thread)
    }

    fn thread_woken(&self, thread: ThreadRef) -> Option<CpuId> {
        self.woken.fetch_add(1, Ordering::Relaxed);
        self.enqueue(thread)
    }

    fn thread_woken_isr(&self, thread: ThreadRef) -> Option<CpuId> {
        // The queue locks are only ever taken with interrupts masked, so the
        // interrupt path can requeue directly.
        self.thread_woken(thread)
    }

    fn thread_destroy(&self, thread: &Thread) {
        if thread.run_link.is_linked() {
            for queue in self.run_queues.iter() {
                if queue.queue.lock().remove(thread).is_some() {
                    queue.thread_count.fetch_sub(1, Ordering::AcqRel);
                    self.runnable_threads.fetch_sub(1, Ordering::AcqRel);
                    break;
                }
            }
        }
        self.total_threads.fetch_sub(1, Ordering::AcqRel);
    }

    fn on_tick(&self, cpu: CpuId, current: &Thread) -> bool {
        let Some(queue) = self.run_queues.get(cpu) else {
            return false;
        };
        let waiting = queue.thread_count.load(Ordering::Acquire) > 0;
        if current.is_idle() {
            return waiting;
        }

        let used = queue.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if used >= self.time_slice_ticks && waiting {
            queue.ticks.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }

    fn stats(&self) -> SchedStats {
        SchedStats {
            threads: self.total_threads.load(Ordering::Acquire),
            runnable: self.runnable_threads.load(Ordering::Acquire),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            woken: self.woken.load(Ordering::Relaxed),
            stolen: self.stolen.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::detached_thread;

    #[test]
    fn test_scheduler_creation() {
        let scheduler = RoundRobinScheduler::new(4);
        assert_eq!(scheduler.num_cpus, 4);
        assert_eq!(scheduler.stats(), SchedStats::default());
        assert!(scheduler.dispatch_next(0).is_none());
        assert!(scheduler.dispatch_next(9).is_none());
    }

    #[test]
    fn test_fifo_dispatch_on_one_cpu() {
        let scheduler = RoundRobinScheduler::new(1);
        for id in 1..=3 {
            assert_eq!(scheduler.enqueue(detached_thread(id, 128)), Some(0));
        }
        assert_eq!(scheduler.stats().runnable, 3);

        let order: Vec<_> = core::iter::from_fn(|| scheduler.dispatch_next(0))
            .map(|t| t.id().get())
            .collect();
        assert_eq!(order, [1, 2, 3]);
        assert_eq!(scheduler.stats().runnable, 0);
        assert_eq!(scheduler.stats().dispatched, 3);
    }

    #[test]
    fn test_least_loaded_placement_and_affinity() {
        let scheduler = RoundRobinScheduler::new(2);
        assert_eq!(scheduler.enqueue(detached_thread(1, 128)), Some(0));
        assert_eq!(scheduler.enqueue(detached_thread(2, 128)), Some(1));

        let pinned = detached_thread(3, 128);
        pinned.set_affinity(Some(1));
        assert_eq!(scheduler.enqueue(pinned), Some(1));
    }

    #[test]
    fn test_steal_skips_pinned_threads() {
        let scheduler = RoundRobinScheduler::new(2);
        let pinned = detached_thread(1, 128);
        pinned.set_affinity(Some(1));
        scheduler.enqueue(pinned);
        assert!(scheduler.dispatch_next(0).is_none());

        let free = detached_thread(2, 128);
        free.set_affinity(None);
        scheduler.push(1, free);
        assert_eq!(scheduler.dispatch_next(0).unwrap().id().get(), 2);
        assert_eq!(scheduler.stats().stolen, 1);
        assert_eq!(scheduler.dispatch_next(1).unwrap().id().get(), 1);
    }

    #[test]
    fn test_time_slice_preemption() {
        let scheduler = RoundRobinScheduler::with_time_slice(1, 3);
        let running = detached_thread(1, 128);
        assert!(!scheduler.on_tick(0, &running));

        scheduler.enqueue(detached_thread(2, 128));
        assert!(!scheduler.on_tick(0, &running));
        assert!(scheduler.on_tick(0, &running));
        // Fresh slice after the preemption request.
        assert!(!scheduler.on_tick(0, &running));
    }

    #[test]
    fn test_destroy_unlinks_queued_thread() {
        let scheduler = RoundRobinScheduler::new(1);
        let t = detached_thread(1, 128);
        scheduler.thread_added(&t);
        scheduler.enqueue(t.clone());
        scheduler.thread_destroy(&t);
        assert!(!t.run_link.is_linked());
        assert_eq!(scheduler.stats().threads, 0);
        assert!(scheduler.dispatch_next(0).is_none());
    }
}
