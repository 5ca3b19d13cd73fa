//! Multi-level priority scheduler with aging.

use super::rr::DEFAULT_TIME_SLICE_TICKS;
use super::trait_def::{SchedStats, Scheduler};
use crate::arch::CpuId;
use crate::thread::list::{RunLink, ThreadList};
use crate::thread::{Thread, ThreadRef};
use portable_atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
extern crate alloc;
use alloc::{boxed::Box, vec::Vec};

/// Dispatch decisions a non-empty level may be passed over before it is
/// served ahead of higher levels.
pub const DEFAULT_AGING_LIMIT: u32 = 8;

const NUM_LEVELS: usize = 4;

/// Priority bands, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityLevel {
    High = 0,
    Normal = 1,
    Low = 2,
    Idle = 3,
}

impl PriorityLevel {
    pub fn of(priority: u8) -> Self {
        match priority {
            0 => PriorityLevel::Idle,
            1..=63 => PriorityLevel::Low,
            64..=191 => PriorityLevel::Normal,
            192..=255 => PriorityLevel::High,
        }
    }
}

struct Level {
    queue: spin::Mutex<ThreadList<RunLink>>,
    len: AtomicUsize,
    /// Dispatch decisions that skipped this level while it had threads
    passed_over: AtomicU32,
}

impl Level {
    fn new() -> Self {
        Self {
            queue: spin::Mutex::new(ThreadList::new()),
            len: AtomicUsize::new(0),
            passed_over: AtomicU32::new(0),
        }
    }

    fn is_empty(&self) -> bool {
        self.len.load(Ordering::Acquire) == 0
    }

    fn take_for(&self, cpu: CpuId) -> Option<ThreadRef> {
        if self.is_empty() {
            return None;
        }
        let thread = self.queue.lock().remove_first(|t| t.can_run_on(cpu))?;
        self.len.fetch_sub(1, Ordering::AcqRel);
        Some(thread)
    }
}

/// Priority scheduler.
///
/// Threads are kept in four shared FIFO levels selected by
/// [`PriorityLevel::of`]. Dispatch serves the highest non-empty level that
/// holds a thread allowed on the requesting CPU, except that a level passed
/// over `aging_limit` times in a row is served first. That bounds how long
/// any runnable thread can wait regardless of the load above it.
///
/// Wakeups from interrupt context only push onto a pending list; the
/// level placement happens at the next dispatch.
pub struct PriorityScheduler {
    levels: [Level; NUM_LEVELS],
    pending: spin::Mutex<ThreadList<RunLink>>,
    has_pending: AtomicBool,
    pending_len: AtomicUsize,
    /// Per-CPU ticks consumed by the running thread
    ticks: Box<[AtomicU32]>,
    time_slice_ticks: u32,
    aging_limit: u32,
    total_threads: AtomicUsize,
    dispatched: AtomicU64,
    woken: AtomicU64,
}

impl PriorityScheduler {
    pub fn new(num_cpus: usize) -> Self {
        Self::with_params(num_cpus, DEFAULT_TIME_SLICE_TICKS, DEFAULT_AGING_LIMIT)
    }

    pub fn with_params(num_cpus: usize, time_slice_ticks: u32, aging_limit: u32) -> Self {
        assert!(num_cpus > 0, "scheduler needs at least one CPU");
        let ticks: Vec<AtomicU32> = (0..num_cpus).map(|_| AtomicU32::new(0)).collect();
        Self {
            levels: [Level::new(), Level::new(), Level::new(), Level::new()],
            pending: spin::Mutex::new(ThreadList::new()),
            has_pending: AtomicBool::new(false),
            pending_len: AtomicUsize::new(0),
            ticks: ticks.into_boxed_slice(),
            time_slice_ticks: time_slice_ticks.max(1),
            aging_limit: aging_limit.max(1),
            total_threads: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
            woken: AtomicU64::new(0),
        }
    }

    fn level(&self, level: PriorityLevel) -> &Level {
        &self.levels[level as usize]
    }

    fn push(&self, thread: ThreadRef) {
        let level = self.level(PriorityLevel::of(thread.priority()));
        level.queue.lock().push_back(thread);
        level.len.fetch_add(1, Ordering::AcqRel);
    }

    /// Move interrupt-time wakeups into their levels.
    fn drain_pending(&self) {
        if !self.has_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut pending = self.pending.lock();
        while let Some(thread) = pending.pop_front() {
            self.pending_len.fetch_sub(1, Ordering::AcqRel);
            self.push(thread);
        }
    }

    /// Highest level holding a thread allowed on `cpu`, pending wakeups
    /// included.
    fn highest_waiting(&self, cpu: CpuId) -> Option<PriorityLevel> {
        const ORDER: [PriorityLevel; NUM_LEVELS] = [
            PriorityLevel::High,
            PriorityLevel::Normal,
            PriorityLevel::Low,
            PriorityLevel::Idle,
        ];
        if self.pending_len.load(Ordering::Acquire) > 0
            && self.pending.lock().iter().any(|t| t.can_run_on(cpu))
        {
            // Unsorted yet; treat as urgent so the drain happens soon.
            return Some(PriorityLevel::High);
        }
        ORDER.into_iter().find(|&l| {
            let level = self.level(l);
            !level.is_empty() && level.queue.lock().iter().any(|t| t.can_run_on(cpu))
        })
    }

    fn take_from(&self, index: usize, cpu: CpuId) -> Option<ThreadRef> {
        let thread = self.levels[index].take_for(cpu)?;
        self.levels[index].passed_over.store(0, Ordering::Relaxed);
        for lower in &self.levels[index + 1..] {
            if !lower.is_empty() {
                lower.passed_over.fetch_add(1, Ordering::Relaxed);
            }
        }
        Some(thread)
    }
}

impl Scheduler for PriorityScheduler {
    fn name(&self) -> &'static str {
        "priority"
    }

    fn thread_added(&self, _thread: &Thread) {
        self.total_threads.fetch_add(1, Ordering::AcqRel);
    }

    fn enqueue(&self, thread: ThreadRef) -> Option<CpuId> {
        let target = thread.affinity();
        self.push(thread);
        target
    }

    fn dispatch_next(&self, cpu: CpuId) -> Option<ThreadRef> {
        if cpu >= self.ticks.len() {
            return None;
        }
        self.drain_pending();

        let starved = (0..NUM_LEVELS)
            .find(|&i| self.levels[i].passed_over.load(Ordering::Relaxed) >= self.aging_limit);
        let thread = starved
            .and_then(|i| self.take_from(i, cpu))
            .or_else(|| (0..NUM_LEVELS).find_map(|i| self.take_from(i, cpu)))?;

        self.ticks[cpu].store(0, Ordering::Relaxed);
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        log::trace!("cpu {} dispatching thread {} (prio {})", cpu, thread.id(), thread.priority());
        Some(thread)
    }

    fn thread_woken(&self, thread: ThreadRef) -> Option<CpuId> {
        self.woken.fetch_add(1, Ordering::Relaxed);
        self.enqueue(thread)
    }

    fn thread_woken_isr(&self, thread: ThreadRef) -> Option<CpuId> {
        self.woken.fetch_add(1, Ordering::Relaxed);
        let target = thread.affinity();
        self.pending.lock().push_back(thread);
        self.pending_len.fetch_add(1, Ordering::AcqRel);
        self.has_pending.store(true, Ordering::Release);
        target
    }

    fn thread_destroy(&self, thread: &Thread) {
        if thread.run_link.is_linked() {
            if self.pending.lock().remove(thread).is_some() {
                self.pending_len.fetch_sub(1, Ordering::AcqRel);
            } else {
                for level in &self.levels {
                    if level.queue.lock().remove(thread).is_some() {
                        level.len.fetch_sub(1, Ordering::AcqRel);
                        break;
                    }
                }
            }
        }
        self.total_threads.fetch_sub(1, Ordering::AcqRel);
    }

    fn on_tick(&self, cpu: CpuId, current: &Thread) -> bool {
        let Some(ticks) = self.ticks.get(cpu) else {
            return false;
        };
        let Some(waiting) = self.highest_waiting(cpu) else {
            return false;
        };
        if current.is_idle() {
            return true;
        }

        match waiting.cmp(&PriorityLevel::of(current.priority())) {
            core::cmp::Ordering::Less => {
                ticks.store(0, Ordering::Relaxed);
                true
            }
            core::cmp::Ordering::Equal => {
                let used = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                if used >= self.time_slice_ticks {
                    ticks.store(0, Ordering::Relaxed);
                    return true;
                }
                false
            }
            core::cmp::Ordering::Greater => false,
        }
    }

    fn stats(&self) -> SchedStats {
        let queued: usize = self.levels.iter().map(|l| l.len.load(Ordering::Acquire)).sum();
        SchedStats {
            threads: self.total_threads.load(Ordering::Acquire),
            runnable: queued + self.pending_len.load(Ordering::Acquire),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            woken: self.woken.load(Ordering::Relaxed),
            stolen: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::priority;
    use crate::tests::helpers::detached_thread;

    #[test]
    fn test_priority_level_mapping() {
        assert_eq!(PriorityLevel::of(0), PriorityLevel::Idle);
        assert_eq!(PriorityLevel::of(63), PriorityLevel::Low);
        assert_eq!(PriorityLevel::of(priority::NORMAL), PriorityLevel::Normal);
        assert_eq!(PriorityLevel::of(priority::HIGH), PriorityLevel::High);
        assert!(PriorityLevel::High < PriorityLevel::Idle);
    }

    #[test]
    fn test_higher_level_first_fifo_within_level() {
        let scheduler = PriorityScheduler::new(1);
        scheduler.enqueue(detached_thread(1, priority::LOW));
        scheduler.enqueue(detached_thread(2, priority::NORMAL));
        scheduler.enqueue(detached_thread(3, priority::HIGH));
        scheduler.enqueue(detached_thread(4, priority::HIGH));

        let order: Vec<_> = core::iter::from_fn(|| scheduler.dispatch_next(0))
            .map(|t| t.id().get())
            .collect();
        assert_eq!(order, [3, 4, 2, 1]);
    }

    #[test]
    fn test_aging_bounds_starvation() {
        let scheduler = PriorityScheduler::with_params(1, 10, 3);
        scheduler.enqueue(detached_thread(100, priority::LOW));

        // A stream of high-priority threads that keep coming back.
        for id in 1..=3 {
            scheduler.enqueue(detached_thread(id, priority::HIGH));
        }
        let mut served_low_after = None;
        for decision in 1..=10 {
            let t = scheduler.dispatch_next(0).unwrap();
            if t.id().get() == 100 {
                served_low_after = Some(decision);
                break;
            }
            scheduler.yield_current(t);
        }
        assert_eq!(served_low_after, Some(4));
    }

    #[test]
    fn test_affinity_respected_on_shared_levels() {
        let scheduler = PriorityScheduler::new(2);
        let pinned = detached_thread(1, priority::HIGH);
        pinned.set_affinity(Some(1));
        assert_eq!(scheduler.enqueue(pinned), Some(1));
        scheduler.enqueue(detached_thread(2, priority::LOW));

        assert_eq!(scheduler.dispatch_next(0).unwrap().id().get(), 2);
        assert!(scheduler.dispatch_next(0).is_none());
        assert_eq!(scheduler.dispatch_next(1).unwrap().id().get(), 1);
    }

    #[test]
    fn test_isr_wake_is_deferred_to_dispatch() {
        let scheduler = PriorityScheduler::new(1);
        scheduler.thread_woken_isr(detached_thread(1, priority::LOW));
        scheduler.thread_woken_isr(detached_thread(2, priority::HIGH));
        assert_eq!(scheduler.stats().runnable, 2);
        assert!(scheduler.level(PriorityLevel::High).is_empty());

        assert_eq!(scheduler.dispatch_next(0).unwrap().id().get(), 2);
        assert_eq!(scheduler.dispatch_next(0).unwrap().id().get(), 1);
        assert_eq!(scheduler.stats().woken, 2);
    }

    #[test]
    fn test_tick_preempts_for_higher_level() {
        let scheduler = PriorityScheduler::with_params(1, 2, DEFAULT_AGING_LIMIT);
        let running = detached_thread(1, priority::NORMAL);
        assert!(!scheduler.on_tick(0, &running));

        scheduler.enqueue(detached_thread(2, priority::LOW));
        assert!(!scheduler.on_tick(0, &running));
        assert!(!scheduler.on_tick(0, &running));

        scheduler.enqueue(detached_thread(3, priority::HIGH));
        assert!(scheduler.on_tick(0, &running));
    }

    #[test]
    fn test_tick_ignores_threads_pinned_elsewhere() {
        let scheduler = PriorityScheduler::with_params(2, 100, DEFAULT_AGING_LIMIT);
        let running = detached_thread(1, priority::NORMAL);
        let pinned = detached_thread(2, priority::HIGH);
        pinned.set_affinity(Some(1));
        scheduler.enqueue(pinned);

        assert!(!scheduler.on_tick(0, &running));
        assert!(!scheduler.on_tick(0, &running));
        assert!(scheduler.on_tick(1, &running));

        let woken = detached_thread(3, priority::HIGH);
        woken.set_affinity(Some(1));
        scheduler.thread_woken_isr(woken);
        assert!(!scheduler.on_tick(0, &running));
    }

    #[test]
    fn test_destroy_removes_pending_thread() {
        let scheduler = PriorityScheduler::new(1);
        let t = detached_thread(1, priority::NORMAL);
        scheduler.thread_added(&t);
        scheduler.thread_woken_isr(t.clone());
        scheduler.thread_destroy(&t);
        assert_eq!(scheduler.stats().threads, 0);
        assert_eq!(scheduler.stats().runnable, 0);
        assert!(scheduler.dispatch_next(0).is_none());
    }
}
