//! Read-copy-update.
//!
//! Readers mark their CPU busy for the duration of an [`RcuReadGuard`]; the
//! section may not block and keeps the reader on its CPU. Writers publish a
//! new version with a release store, then wait for a grace period before
//! reclaiming the old one, either synchronously ([`Kernel::synchronize_rcu`])
//! or through a callback ([`Kernel::call_rcu`]).
//!
//! Grace periods are numbered. Each writer opens a new one by bumping the
//! sequence counter and then waits, per online CPU, until that CPU is not
//! reading or its current read section started after the bump. Concurrent
//! writers each wait for their own number and never for each other.

use crate::arch::Arch;
use crate::config::RcuWaitPolicy;
use crate::kernel::Kernel;
use core::marker::PhantomData;
use core::ptr::NonNull;
use portable_atomic::{AtomicPtr, AtomicU64, Ordering};

extern crate alloc;
use alloc::{boxed::Box, vec::Vec};

/// Polls after which a grace period is reported as slow.
const SLOW_GRACE_PERIOD_POLLS: u64 = 1 << 20;

type RcuCallback = Box<dyn FnOnce() + Send>;

pub(crate) struct RcuState {
    /// Last grace period opened.
    gp_seq: AtomicU64,
    /// Highest grace period known to be complete.
    completed: AtomicU64,
    callbacks: spin::Mutex<Vec<(u64, RcuCallback)>>,
}

impl RcuState {
    pub(crate) const fn new() -> Self {
        Self {
            gp_seq: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            callbacks: spin::Mutex::new(Vec::new()),
        }
    }
}

/// An RCU read-side critical section on the CPU that opened it.
pub struct RcuReadGuard<'k, A: Arch> {
    kernel: &'k Kernel<A>,
    // Must be dropped on the CPU that created it.
    _not_send: PhantomData<*const ()>,
}

impl<A: Arch> Drop for RcuReadGuard<'_, A> {
    fn drop(&mut self) {
        let kernel = self.kernel;
        let flags = kernel.irq_save();
        let cpu = kernel.this_cpu();
        let nesting = cpu.rcu_nesting.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(nesting > 0, "unbalanced rcu read unlock");
        cpu.preempt_count.fetch_sub(1, Ordering::Relaxed);
        kernel.irq_restore(flags);
    }
}

impl<A: Arch> Kernel<A> {
    /// Enter a read-side critical section. Sections nest.
    pub fn rcu_read_lock(&self) -> RcuReadGuard<'_, A> {
        let flags = self.irq_save();
        let cpu = self.this_cpu();
        cpu.preempt_count.fetch_add(1, Ordering::Relaxed);
        if cpu.rcu_nesting.fetch_add(1, Ordering::SeqCst) == 0 {
            cpu.rcu_epoch.store(self.rcu.gp_seq.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        self.irq_restore(flags);
        RcuReadGuard {
            kernel: self,
            _not_send: PhantomData,
        }
    }

    /// Wait until every read section that began before the call has ended,
    /// then run callbacks whose grace period is over.
    pub fn synchronize_rcu(&self) {
        assert!(
            !self.this_cpu().in_rcu_read(),
            "synchronize_rcu() inside an RCU read-side section"
        );
        let target = self.rcu.gp_seq.fetch_add(1, Ordering::SeqCst) + 1;

        for cpu in self.cpus().iter().filter(|cpu| cpu.is_online()) {
            let mut polls: u64 = 0;
            while cpu.rcu_nesting.load(Ordering::SeqCst) > 0
                && cpu.rcu_epoch.load(Ordering::SeqCst) < target
            {
                polls += 1;
                if polls == SLOW_GRACE_PERIOD_POLLS {
                    log::warn!("rcu: grace period {} still waiting for cpu {}", target, cpu.id());
                }
                self.rcu_wait();
            }
        }

        self.rcu.completed.fetch_max(target, Ordering::SeqCst);
        log::trace!("rcu: grace period {} complete", target);
        self.run_rcu_callbacks();
    }

    fn rcu_wait(&self) {
        let can_yield = self.config().rcu_wait == RcuWaitPolicy::Yield && {
            let flags = self.irq_save();
            let cpu = self.this_cpu();
            let ok = cpu.is_online() && !cpu.in_isr() && cpu.preempt_count() == 0;
            self.irq_restore(flags);
            ok
        };
        if can_yield {
            self.yield_now();
        } else {
            core::hint::spin_loop();
        }
    }

    /// Run `callback` after a grace period that starts after this call.
    pub fn call_rcu<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let callback: RcuCallback = Box::new(callback);
        let after = self.rcu.gp_seq.load(Ordering::SeqCst) + 1;
        let flags = self.irq_save();
        self.rcu.callbacks.lock().push((after, callback));
        self.irq_restore(flags);
    }

    /// Wait for every callback queued so far to have run.
    pub fn rcu_barrier(&self) {
        self.synchronize_rcu();
    }

    /// Callbacks queued and not yet run.
    pub fn rcu_pending_callbacks(&self) -> usize {
        let flags = self.irq_save();
        let pending = self.rcu.callbacks.lock().len();
        self.irq_restore(flags);
        pending
    }

    fn run_rcu_callbacks(&self) {
        let completed = self.rcu.completed.load(Ordering::SeqCst);
        let flags = self.irq_save();
        let ready: Vec<RcuCallback> = {
            let mut queue = self.rcu.callbacks.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < queue.len() {
                if queue[i].0 <= completed {
                    ready.push(queue.remove(i).1);
                } else {
                    i += 1;
                }
            }
            ready
        };
        self.irq_restore(flags);

        for callback in ready {
            callback();
        }
    }
}

/// A pointer readers dereference under RCU and writers replace.
pub struct RcuCell<T> {
    ptr: AtomicPtr<T>,
    _owns: PhantomData<Box<T>>,
}

unsafe impl<T: Send + Sync> Send for RcuCell<T> {}
unsafe impl<T: Send + Sync> Sync for RcuCell<T> {}

impl<T> RcuCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _owns: PhantomData,
        }
    }

    /// The current version, valid for the read section.
    pub fn read<'g, A: Arch>(&'g self, _guard: &'g RcuReadGuard<'_, A>) -> &'g T {
        let ptr = self.ptr.load(Ordering::Acquire);
        // SAFETY: the pointer is always a live box; a replaced version is
        // only freed after a grace period, which waits for `_guard`.
        unsafe { &*ptr }
    }

    /// Publish `value` and return the old version once no reader can see it.
    pub fn replace<A: Arch>(&self, kernel: &Kernel<A>, value: T) -> Box<T> {
        let old = self.publish(value);
        kernel.synchronize_rcu();
        // SAFETY: unpublished and past a grace period.
        unsafe { Box::from_raw(old.as_ptr()) }
    }

    fn publish(&self, value: T) -> NonNull<T> {
        let new = Box::into_raw(Box::new(value));
        let old = self.ptr.swap(new, Ordering::AcqRel);
        match NonNull::new(old) {
            Some(old) => old,
            None => unreachable!("RcuCell holds a null pointer"),
        }
    }
}

impl<T: Send + 'static> RcuCell<T> {
    /// Publish `value` and free the old version after a grace period.
    pub fn replace_deferred<A: Arch>(&self, kernel: &Kernel<A>, value: T) {
        let old = self.publish(value);
        // SAFETY: unpublished; the box is only touched after the grace period.
        let old = unsafe { Box::from_raw(old.as_ptr()) };
        kernel.call_rcu(move || drop(old));
    }
}

impl<T> Drop for RcuCell<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; no reader can hold a section borrowing us.
        drop(unsafe { Box::from_raw(*self.ptr.get_mut()) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot_kernel;
    use alloc::sync::Arc;
    use portable_atomic::AtomicUsize;

    #[test]
    fn test_read_sections_nest() {
        let kernel = boot_kernel(1);
        let cpu = kernel.cpu(0).unwrap();
        {
            let _outer = kernel.rcu_read_lock();
            let _inner = kernel.rcu_read_lock();
            assert!(cpu.in_rcu_read());
            assert_eq!(cpu.preempt_count(), 2);
        }
        assert!(!cpu.in_rcu_read());
        assert_eq!(cpu.preempt_count(), 0);
    }

    #[test]
    fn test_replace_returns_old_version() {
        let kernel = boot_kernel(1);
        let cell = RcuCell::new(1u32);
        {
            let guard = kernel.rcu_read_lock();
            assert_eq!(*cell.read(&guard), 1);
        }
        let old = cell.replace(kernel, 2);
        assert_eq!(*old, 1);
        let guard = kernel.rcu_read_lock();
        assert_eq!(*cell.read(&guard), 2);
    }

    #[test]
    fn test_callbacks_run_after_grace_period() {
        let kernel = boot_kernel(1);
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let ran = ran.clone();
            kernel.call_rcu(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(kernel.rcu_pending_callbacks(), 3);
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        kernel.rcu_barrier();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(kernel.rcu_pending_callbacks(), 0);
    }

    #[test]
    fn test_deferred_replace_frees_after_barrier() {
        let kernel = boot_kernel(1);
        let marker = Arc::new(());
        let cell = RcuCell::new(marker.clone());
        cell.replace_deferred(kernel, Arc::new(()));
        assert_eq!(Arc::strong_count(&marker), 2);
        kernel.rcu_barrier();
        assert_eq!(Arc::strong_count(&marker), 1);
    }

    #[test]
    #[should_panic(expected = "inside an RCU read-side section")]
    fn test_synchronize_inside_reader_panics() {
        let kernel = boot_kernel(1);
        let _guard = kernel.rcu_read_lock();
        kernel.synchronize_rcu();
    }
}
