//! Kernel runtime context for the scheduling core.
//!
//! This module provides the [`Kernel`] struct that owns the per-CPU table,
//! the scheduler instance, the sleep queue and the RCU state, and drives
//! every thread through its lifecycle: spawn, dispatch, block, wake, exit
//! and reap.

use crate::arch::{Arch, CpuId, IrqFlags};
use crate::config::{KernelConfig, SchedPolicy, MIN_STACK_SIZE};
use crate::errors::{KernelResult, SpawnError};
use crate::percpu::{CpuStats, PerCpu};
use crate::sched::prio::DEFAULT_AGING_LIMIT;
use crate::sched::{PriorityScheduler, RoundRobinScheduler, SchedStats, Scheduler, SchedulerId};
use crate::sync::rcu::RcuState;
use crate::thread::{JoinHandle, Thread, ThreadBuilder, ThreadId, ThreadRef, ThreadState};
use crate::time::{Duration, Instant};
use crate::timer::SleepQueue;
use core::marker::PhantomData;
use portable_atomic::{AtomicUsize, Ordering};

extern crate alloc;
use alloc::{boxed::Box, sync::Arc, vec::Vec};

/// Every thread is registered with the kernel's single scheduler instance.
const SCHEDULER_ID: SchedulerId = 0;

/// Main kernel handle that manages the threading system.
///
/// One instance exists per system and must live for the rest of it, hence
/// the `&'static self` receivers on the spawning APIs.
///
/// # Type Parameters
///
/// * `A` - Architecture implementation
pub struct Kernel<A: Arch> {
    config: KernelConfig,
    cpus: Box<[PerCpu]>,
    scheduler: Box<dyn Scheduler>,
    pub(crate) sleepers: SleepQueue,
    pub(crate) rcu: RcuState,
    /// Next thread ID to assign
    next_thread_id: AtomicUsize,
    live_threads: AtomicUsize,
    _arch: PhantomData<fn() -> A>,
}

/// Restores the interrupt state captured by [`Kernel::irq_guard`] on drop.
pub struct IrqGuard<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    flags: IrqFlags,
}

impl<A: Arch> Drop for IrqGuard<'_, A> {
    fn drop(&mut self) {
        self.kernel.irq_restore(self.flags);
    }
}

/// Marks the current CPU as running an interrupt handler.
pub struct IsrGuard<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    flags: IrqFlags,
}

impl<A: Arch> Drop for IsrGuard<'_, A> {
    fn drop(&mut self) {
        self.kernel.this_cpu().isr_depth.fetch_sub(1, Ordering::Relaxed);
        self.kernel.irq_restore(self.flags);
    }
}

/// Keeps the current thread on its CPU until dropped.
pub struct PreemptGuard<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    // Must be released on the CPU that took it.
    _not_send: PhantomData<*const ()>,
}

impl<A: Arch> Drop for PreemptGuard<'_, A> {
    fn drop(&mut self) {
        let flags = self.kernel.irq_save();
        self.kernel.this_cpu().preempt_count.fetch_sub(1, Ordering::Relaxed);
        self.kernel.irq_restore(flags);
    }
}

impl<A: Arch> Kernel<A> {
    /// Create a kernel running the scheduler selected by `config.policy`.
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        config.validate()?;
        let scheduler: Box<dyn Scheduler> = match config.policy {
            SchedPolicy::RoundRobin => Box::new(RoundRobinScheduler::with_time_slice(
                config.num_cpus,
                config.time_slice_ticks,
            )),
            SchedPolicy::Priority => Box::new(PriorityScheduler::with_params(
                config.num_cpus,
                config.time_slice_ticks,
                DEFAULT_AGING_LIMIT,
            )),
        };
        Self::with_scheduler(config, scheduler)
    }

    /// Create a kernel around a caller-supplied scheduler plugin.
    ///
    /// `config.policy` is ignored.
    pub fn with_scheduler(config: KernelConfig, scheduler: Box<dyn Scheduler>) -> KernelResult<Self> {
        config.validate()?;
        let cpus: Vec<PerCpu> = (0..config.num_cpus).map(PerCpu::new).collect();
        log::debug!(
            "kernel: {} cpu(s), {} scheduler",
            config.num_cpus,
            scheduler.name()
        );

        Ok(Self {
            config,
            cpus: cpus.into_boxed_slice(),
            scheduler,
            sleepers: SleepQueue::new(),
            rcu: RcuState::new(),
            next_thread_id: AtomicUsize::new(1), // Start from 1, never use 0
            live_threads: AtomicUsize::new(0),
            _arch: PhantomData,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Run record of `cpu`.
    pub fn cpu(&self, cpu: CpuId) -> Option<&PerCpu> {
        self.cpus.get(cpu)
    }

    pub(crate) fn cpus(&self) -> &[PerCpu] {
        &self.cpus
    }

    pub(crate) fn this_cpu(&self) -> &PerCpu {
        &self.cpus[A::cpu_id()]
    }

    /// Get a reference to the scheduler.
    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.scheduler
    }

    pub fn scheduler_stats(&self) -> SchedStats {
        self.scheduler.stats()
    }

    pub fn cpu_stats(&self, cpu: CpuId) -> Option<CpuStats> {
        self.cpus.get(cpu).map(PerCpu::stats)
    }

    /// Threads spawned and not yet reaped, idle threads excluded.
    pub fn live_threads(&self) -> usize {
        self.live_threads.load(Ordering::Acquire)
    }

    /// Generate a new unique thread ID.
    ///
    /// Thread IDs are never reused for the lifetime of the kernel instance.
    fn next_thread_id(&self) -> ThreadId {
        let raw = self.next_thread_id.fetch_add(1, Ordering::AcqRel);
        ThreadId::from_raw(raw).unwrap_or_else(|| panic!("thread id space exhausted"))
    }

    // ------------------------------------------------------------------
    // Interrupt state
    // ------------------------------------------------------------------

    /// Disable local interrupts, counting the nesting depth on this CPU.
    pub fn irq_save(&self) -> IrqFlags {
        let flags = A::irq_save();
        self.this_cpu().irq_depth.fetch_add(1, Ordering::Relaxed);
        flags
    }

    /// Undo the matching [`Kernel::irq_save`].
    pub fn irq_restore(&self, flags: IrqFlags) {
        let depth = self.this_cpu().irq_depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(depth > 0, "unbalanced irq_restore");
        A::irq_restore(flags);
    }

    pub fn irq_guard(&self) -> IrqGuard<'_, A> {
        IrqGuard {
            kernel: self,
            flags: self.irq_save(),
        }
    }

    /// Enter interrupt context; the guard leaves it.
    ///
    /// Interrupt handlers that touch wait queues or wake threads must hold
    /// one so blocking from them is caught.
    pub fn isr_enter(&self) -> IsrGuard<'_, A> {
        let flags = self.irq_save();
        self.this_cpu().isr_depth.fetch_add(1, Ordering::Relaxed);
        IsrGuard { kernel: self, flags }
    }

    pub fn in_isr(&self) -> bool {
        let flags = self.irq_save();
        let in_isr = self.this_cpu().in_isr();
        self.irq_restore(flags);
        in_isr
    }

    pub fn preempt_disable(&self) -> PreemptGuard<'_, A> {
        let flags = self.irq_save();
        self.this_cpu().preempt_count.fetch_add(1, Ordering::Relaxed);
        self.irq_restore(flags);
        PreemptGuard {
            kernel: self,
            _not_send: PhantomData,
        }
    }

    // ------------------------------------------------------------------
    // CPU bring-up and thread creation
    // ------------------------------------------------------------------

    /// Bring `cpu` online, adopting the calling flow as its idle thread.
    ///
    /// Called once per CPU from its boot path. Afterwards the caller is the
    /// idle thread and should end up in [`Kernel::idle_loop`].
    pub fn boot_cpu(&self, cpu: CpuId) {
        assert!(cpu < self.cpus.len(), "cpu {} out of range", cpu);
        A::init_cpu(cpu);

        let flags = self.irq_save();
        let percpu = &self.cpus[cpu];
        assert!(!percpu.is_online(), "cpu {} booted twice", cpu);

        let idle = Arc::new(Thread::new_idle(self.next_thread_id(), A::current_context(), cpu));
        let idle = percpu.init_idle(idle).clone();
        // SAFETY: we run on `cpu` with interrupts disabled.
        unsafe { percpu.set_current(idle) };
        percpu.set_online();
        self.irq_restore(flags);

        log::debug!("cpu {} online", cpu);
    }

    /// The idle loop: dispatch whatever becomes runnable, forever.
    pub fn idle_loop(&self) -> ! {
        assert!(self.current().is_idle(), "idle_loop entered from a regular thread");
        loop {
            self.schedule();
            A::wait_for_interrupt();
        }
    }

    /// Spawn a thread with default attributes.
    pub fn spawn<F>(&'static self, f: F) -> KernelResult<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        ThreadBuilder::new().spawn(self, f)
    }

    pub(crate) fn spawn_with<F>(&'static self, builder: ThreadBuilder, f: F) -> KernelResult<JoinHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let stack_size = builder.stack_size.unwrap_or(self.config.default_stack_size);
        if stack_size < MIN_STACK_SIZE {
            return Err(SpawnError::InvalidStackSize(stack_size).into());
        }
        if let Some(cpu) = builder.affinity {
            if cpu >= self.cpus.len() {
                return Err(SpawnError::InvalidAffinity(cpu).into());
            }
        }
        if self.live_threads.fetch_add(1, Ordering::AcqRel) >= self.config.max_threads {
            self.live_threads.fetch_sub(1, Ordering::AcqRel);
            return Err(SpawnError::TooManyThreads.into());
        }

        let start = Box::into_raw(Box::new((self, f)));
        let context = match A::create_context(thread_entry::<A, F>, start as usize, stack_size) {
            Ok(context) => context,
            Err(err) => {
                // SAFETY: the context was never created, so nobody else owns `start`.
                drop(unsafe { Box::from_raw(start) });
                self.live_threads.fetch_sub(1, Ordering::AcqRel);
                return Err(err.into());
            }
        };

        let priority = builder.priority.unwrap_or(self.config.default_priority);
        let thread = Arc::new(Thread::new(
            self.next_thread_id(),
            Some(context),
            builder.name,
            priority,
            builder.affinity,
        ));
        thread.set_scheduler(SCHEDULER_ID);
        self.scheduler.thread_added(&thread);
        log::debug!("spawned thread {} {:?} prio {}", thread.id(), thread.name(), priority);

        let flags = self.irq_save();
        let target = self.scheduler.enqueue(thread.clone());
        self.kick(target, &thread);
        self.irq_restore(flags);

        Ok(JoinHandle::new(thread))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Thread running on the calling CPU, `None` before the CPU is booted.
    pub fn current_thread(&self) -> Option<ThreadRef> {
        let flags = self.irq_save();
        // SAFETY: interrupts are disabled and we read our own CPU's slot.
        let current = unsafe { self.this_cpu().current() };
        self.irq_restore(flags);
        current
    }

    pub(crate) fn current(&self) -> ThreadRef {
        match self.current_thread() {
            Some(thread) => thread,
            None => panic!("cpu {} is not online", A::cpu_id()),
        }
    }

    /// Give up the CPU; the caller stays runnable.
    pub fn yield_now(&self) {
        self.schedule();
    }

    /// Make a scheduling decision for this CPU and switch to its outcome.
    ///
    /// The current thread's state decides what happens to it: a running
    /// thread is handed back to the scheduler, a blocked one just leaves,
    /// an exited one is reaped by whichever thread runs next here.
    pub fn schedule(&self) {
        let flags = self.irq_save();
        let cpu = self.this_cpu();
        assert!(!cpu.in_isr(), "schedule() called from interrupt context");
        assert!(!cpu.in_rcu_read(), "schedule() inside an RCU read-side section");
        assert_eq!(cpu.preempt_count(), 0, "schedule() with preemption disabled");
        cpu.clear_need_resched();

        // SAFETY: interrupts are disabled and we read our own CPU's slot.
        let Some(prev) = (unsafe { cpu.current() }) else {
            panic!("cpu {} is not online", cpu.id());
        };
        let Some(idle) = cpu.idle_thread().cloned() else {
            panic!("cpu {} has no idle thread", cpu.id());
        };

        match prev.state() {
            ThreadState::Running => {
                prev.set_state(ThreadState::Runnable);
                if !prev.is_idle() {
                    let target = self.scheduler.yield_current(prev.clone());
                    self.kick(target, &prev);
                }
            }
            ThreadState::Blocked => self.scheduler.thread_blocked(&prev),
            // Already woken again, or about to be reaped.
            ThreadState::Runnable | ThreadState::Exited => {}
        }

        let next = self.scheduler.dispatch_next(cpu.id()).unwrap_or(idle);
        assert_eq!(
            next.state(),
            ThreadState::Runnable,
            "scheduler dispatched thread {} that is not runnable",
            next.id()
        );
        assert!(next.can_run_on(cpu.id()), "thread {} dispatched on cpu {}", next.id(), cpu.id());

        if Arc::ptr_eq(&next, &prev) {
            next.set_state(ThreadState::Running);
            drop((next, prev));
            self.irq_restore(flags);
            return;
        }

        log::trace!("cpu {}: switch {} -> {}", cpu.id(), prev.id(), next.id());

        // The previous CPU of `next` may still be switching away from it.
        while next.is_on_cpu() {
            core::hint::spin_loop();
        }
        next.set_state(ThreadState::Running);
        next.set_on_cpu(true);
        next.set_last_cpu(cpu.id());
        prev.save_irq_depth(cpu.irq_depth());
        cpu.count_switch();

        let (Some(prev_ctx), Some(next_ctx)) = (prev.context(), next.context()) else {
            panic!("thread without an execution context");
        };
        // SAFETY: interrupts are disabled and these are our own CPU's slots.
        // No reference to either thread may stay on this stack across the
        // switch: an exited `prev` never comes back to drop it.
        unsafe {
            cpu.set_current(next);
            cpu.set_prev(prev);
        }
        // SAFETY: `prev_ctx` is executing here and `next_ctx` is parked,
        // as `next.on_cpu` was clear.
        unsafe { A::context_switch(prev_ctx, next_ctx) };

        // Resumed, possibly on another CPU.
        self.finish_switch();
        self.irq_restore(flags);
    }

    /// Second half of a switch, run by the thread switched to.
    fn finish_switch(&self) {
        let cpu = self.this_cpu();
        // SAFETY: interrupts are disabled and these are our own CPU's slots.
        let (me, prev) = unsafe { (cpu.current(), cpu.take_prev()) };
        if let Some(me) = me {
            cpu.irq_depth.store(me.saved_irq_depth(), Ordering::Relaxed);
        }
        if let Some(prev) = prev {
            let exited = prev.state() == ThreadState::Exited;
            prev.set_on_cpu(false);
            if exited {
                self.reap(prev);
            }
        }
    }

    /// First code a new thread runs, from inside the switch that started it.
    fn schedule_tail(&self) {
        self.finish_switch();
        self.irq_restore(IrqFlags::ENABLED);
    }

    fn reap(&self, thread: ThreadRef) {
        self.scheduler.thread_destroy(&thread);
        if let Some(context) = thread.context() {
            // SAFETY: the thread exited and its switch-out has completed.
            unsafe { A::destroy_context(context) };
        }
        self.live_threads.fetch_sub(1, Ordering::AcqRel);
        log::debug!("reaped thread {}", thread.id());
    }

    /// Terminate the calling thread.
    pub fn exit_current(&self) -> ! {
        let me = self.current();
        assert!(!me.is_idle(), "idle thread cannot exit");

        // Interrupts stay off until the next thread restores its own state.
        let _ = self.irq_save();
        {
            let mut joiners = me.exit_wq.lock(self);
            me.set_state(ThreadState::Exited);
            joiners.wake_all();
        }
        log::debug!("thread {} exited", me.id());
        drop(me);

        self.schedule();
        unreachable!("exited thread was rescheduled");
    }

    // ------------------------------------------------------------------
    // Blocking and waking
    // ------------------------------------------------------------------

    pub(crate) fn assert_may_block(&self, me: &Thread) {
        let cpu = self.this_cpu();
        assert!(!cpu.in_isr(), "blocking in interrupt context");
        assert!(!cpu.in_rcu_read(), "blocking inside an RCU read-side section");
        assert!(!me.is_idle(), "idle thread cannot block");
        assert!(me.scheduler().is_some(), "blocking thread {} that no scheduler owns", me.id());
    }

    /// Put the calling thread to sleep for `duration`.
    ///
    /// Returns `true` once the time has passed, `false` when an explicit
    /// [`Kernel::wake`] cut the sleep short.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.sleep_until(A::now() + duration)
    }

    pub fn sleep_until(&self, deadline: Instant) -> bool {
        if A::now() >= deadline {
            return true;
        }
        let me = self.current();
        let flags = self.irq_save();
        self.assert_may_block(&me);

        me.set_state(ThreadState::Blocked);
        self.sleepers.arm(&me, deadline);
        self.schedule();
        self.sleepers.disarm(&me);

        self.irq_restore(flags);
        A::now() >= deadline
    }

    /// Wake a blocked thread from thread context.
    ///
    /// Returns `false`, doing nothing, if the thread was not blocked.
    pub fn wake(&self, thread: &ThreadRef) -> bool {
        self.wake_thread(thread, false)
    }

    /// Interrupt-safe variant of [`Kernel::wake`].
    pub fn wake_isr(&self, thread: &ThreadRef) -> bool {
        self.wake_thread(thread, true)
    }

    fn wake_thread(&self, thread: &ThreadRef, from_isr: bool) -> bool {
        let flags = self.irq_save();
        let woken = thread.transition(ThreadState::Blocked, ThreadState::Runnable);
        if woken {
            self.complete_wake(thread.clone(), from_isr);
        }
        self.irq_restore(flags);
        if woken && !from_isr {
            log::trace!("woke thread {}", thread.id());
        }
        woken
    }

    /// Finish waking a thread the caller moved from blocked to runnable.
    ///
    /// Interrupts must be disabled. Callers may hold a wait-queue or the
    /// sleep-queue lock, so nothing below this point logs.
    pub(crate) fn complete_wake(&self, thread: ThreadRef, from_isr: bool) {
        self.sleepers.disarm(&thread);
        self.requeue_woken(thread, from_isr);
    }

    fn requeue_woken(&self, thread: ThreadRef, from_isr: bool) {
        assert!(
            thread.scheduler().is_some(),
            "waking thread {} that no scheduler owns",
            thread.id()
        );

        let target = if from_isr {
            self.scheduler.thread_woken_isr(thread.clone())
        } else {
            self.scheduler.thread_woken(thread.clone())
        };
        self.kick(target, &thread);
    }

    /// Make sure a CPU that may run `woken` notices it.
    ///
    /// With no target CPU the local one is asked first; if its current
    /// thread outranks `woken`, the best other candidate gets an IPI.
    fn kick(&self, target: Option<CpuId>, woken: &Thread) {
        let here = self.this_cpu();
        match target {
            Some(cpu) if cpu != here.id() => self.send_reschedule(cpu),
            Some(_) => {
                if here.preemptible_by(woken.priority()) {
                    here.set_need_resched();
                }
            }
            None => {
                if here.preemptible_by(woken.priority()) && woken.can_run_on(here.id()) {
                    here.set_need_resched();
                } else if let Some(cpu) = self.preemptible_cpu(woken) {
                    self.send_reschedule(cpu);
                }
            }
        }
    }

    /// Another online CPU whose current thread `woken` would displace,
    /// idle CPUs first.
    fn preemptible_cpu(&self, woken: &Thread) -> Option<CpuId> {
        let here = A::cpu_id();
        self.cpus
            .iter()
            .filter(|cpu| cpu.id() != here && cpu.is_online() && woken.can_run_on(cpu.id()))
            .filter(|cpu| cpu.preemptible_by(woken.priority()))
            .min_by_key(|cpu| cpu.running_rank())
            .map(PerCpu::id)
    }

    fn send_reschedule(&self, cpu: CpuId) {
        let remote = &self.cpus[cpu];
        remote.set_need_resched();
        if remote.is_online() {
            remote.count_ipi();
            A::send_reschedule_ipi(cpu);
        }
    }

    // ------------------------------------------------------------------
    // Timer and interrupt entry points
    // ------------------------------------------------------------------

    /// Wake every thread whose sleep timer is due at `now`.
    ///
    /// Returns the number of threads woken.
    pub fn expire_timers(&self, now: Instant) -> usize {
        let flags = self.irq_save();
        let mut woken = 0;
        self.sleepers.expire(now, |thread| {
            if thread.transition(ThreadState::Blocked, ThreadState::Runnable) {
                self.requeue_woken(thread, true);
                woken += 1;
            }
        });
        self.irq_restore(flags);
        woken
    }

    /// Periodic timer interrupt handler body.
    ///
    /// Follow with [`Kernel::preempt_if_needed`] on the way out of the
    /// interrupt.
    pub fn timer_interrupt(&self) {
        let _isr = self.isr_enter();
        self.expire_timers(A::now());

        let cpu = self.this_cpu();
        // SAFETY: interrupts are disabled inside the ISR guard.
        if let Some(current) = unsafe { cpu.current() } {
            if self.scheduler.on_tick(cpu.id(), &current) {
                cpu.set_need_resched();
            }
        }
    }

    /// Reschedule interrupt handler body.
    pub fn handle_reschedule_ipi(&self) {
        let _isr = self.isr_enter();
        self.this_cpu().set_need_resched();
    }

    /// Switch away if a reschedule was requested and preemption is allowed.
    ///
    /// Returns whether a scheduling decision was made.
    pub fn preempt_if_needed(&self) -> bool {
        let flags = self.irq_save();
        let cpu = self.this_cpu();
        let preempt = cpu.is_online()
            && cpu.need_resched()
            && !cpu.in_isr()
            && cpu.preempt_count() == 0;
        if preempt {
            self.schedule();
        }
        self.irq_restore(flags);
        preempt
    }
}

/// Entry point of every spawned thread.
fn thread_entry<A: Arch, F: FnOnce() + Send + 'static>(arg: usize) {
    // SAFETY: `arg` is the pointer spawn_with leaked for exactly this `F`.
    let start = unsafe { Box::from_raw(arg as *mut (&'static Kernel<A>, F)) };
    let (kernel, f) = *start;
    kernel.schedule_tail();
    f();
    kernel.exit_current();
}
