//! Wait queues.
//!
//! A [`WaitQueue`] couples three things under one spinlock: the FIFO of
//! threads blocked on it, the state `T` those threads are waiting to see
//! change, and local interrupt masking. Checking the state and going to
//! sleep therefore happen atomically with respect to any waker, including
//! one running in an interrupt handler on the same CPU.
//!
//! ```ignore
//! static READY: WaitQueue<bool> = WaitQueue::new(false);
//!
//! // consumer
//! let guard = READY.wait_event(kernel, |ready| *ready);
//!
//! // producer, thread or interrupt context
//! let mut guard = READY.lock(kernel);
//! *guard = true;
//! guard.wake_all();
//! ```

use super::mutex::Mutex;
use crate::arch::{Arch, IrqFlags};
use crate::kernel::Kernel;
use crate::thread::list::{ThreadList, WaitLink};
use crate::thread::ThreadState;
use crate::time::{Duration, Instant};
use core::ops::{Deref, DerefMut};

struct Inner<T> {
    waiters: ThreadList<WaitLink>,
    state: T,
}

pub struct WaitQueue<T = ()> {
    inner: spin::Mutex<Inner<T>>,
}

impl<T> WaitQueue<T> {
    pub const fn new(state: T) -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                waiters: ThreadList::new(),
                state,
            }),
        }
    }

    /// Disable local interrupts and take the queue lock.
    pub fn lock<'a, A: Arch>(&'a self, kernel: &'a Kernel<A>) -> WaitQueueGuard<'a, T, A> {
        let flags = kernel.irq_save();
        WaitQueueGuard {
            inner: Some(self.inner.lock()),
            queue: self,
            kernel,
            flags,
        }
    }

    /// Block until woken.
    pub fn wait<A: Arch>(&self, kernel: &Kernel<A>) {
        self.lock(kernel).wait();
    }

    /// Block until `cond` holds for the queue state.
    ///
    /// `cond` runs under the lock; the returned guard still holds it, so
    /// the caller can consume what it waited for.
    pub fn wait_event<'a, A, F>(&'a self, kernel: &'a Kernel<A>, mut cond: F) -> WaitQueueGuard<'a, T, A>
    where
        A: Arch,
        F: FnMut(&mut T) -> bool,
    {
        let mut guard = self.lock(kernel);
        while !cond(&mut *guard) {
            guard.wait();
        }
        guard
    }

    /// [`WaitQueue::wait_event`] with a deadline.
    ///
    /// The flag is `true` if the deadline passed with `cond` still false.
    pub fn wait_event_deadline<'a, A, F>(
        &'a self,
        kernel: &'a Kernel<A>,
        deadline: Instant,
        mut cond: F,
    ) -> (WaitQueueGuard<'a, T, A>, bool)
    where
        A: Arch,
        F: FnMut(&mut T) -> bool,
    {
        let mut guard = self.lock(kernel);
        loop {
            if cond(&mut *guard) {
                return (guard, false);
            }
            if guard.wait_deadline(deadline) {
                let timed_out = !cond(&mut *guard);
                return (guard, timed_out);
            }
        }
    }

    pub fn wait_event_timeout<'a, A, F>(
        &'a self,
        kernel: &'a Kernel<A>,
        timeout: Duration,
        cond: F,
    ) -> (WaitQueueGuard<'a, T, A>, bool)
    where
        A: Arch,
        F: FnMut(&mut T) -> bool,
    {
        self.wait_event_deadline(kernel, A::now() + timeout, cond)
    }

    /// Block until `cond` holds, with `mutex` protecting what it reads.
    ///
    /// The caller holds `mutex`. Each time `cond` is false the caller is
    /// queued first and only then releases the mutex, so a waker that
    /// takes the mutex, changes the data and wakes this queue cannot be
    /// missed. The mutex is held again, at its previous depth, on return.
    pub fn wait_event_mutex<A, F>(&self, kernel: &Kernel<A>, mutex: &Mutex, mut cond: F)
    where
        A: Arch,
        F: FnMut() -> bool,
    {
        while !cond() {
            let mut depth = 0;
            let mut guard = self.lock(kernel);
            guard.block(None, || depth = mutex.release(kernel));
            drop(guard);
            mutex.reacquire(kernel, depth);
        }
    }

    pub fn wake_one<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        self.lock(kernel).wake_one()
    }

    pub fn wake_all<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        self.lock(kernel).wake_all()
    }

    pub fn wake_one_isr<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        self.lock(kernel).wake_one_isr()
    }

    pub fn wake_all_isr<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        self.lock(kernel).wake_all_isr()
    }

    /// Whether no thread is queued.
    pub fn is_empty<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        self.lock(kernel).is_empty()
    }
}

impl<T: Default> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// The queue lock, with local interrupts disabled.
///
/// Dereferences to the queue state.
pub struct WaitQueueGuard<'a, T, A: Arch> {
    // `None` only while the owner is switched out inside `block`.
    inner: Option<spin::MutexGuard<'a, Inner<T>>>,
    queue: &'a WaitQueue<T>,
    kernel: &'a Kernel<A>,
    flags: IrqFlags,
}

impl<'a, T, A: Arch> WaitQueueGuard<'a, T, A> {
    fn inner(&self) -> &Inner<T> {
        match &self.inner {
            Some(inner) => inner,
            None => unreachable!("wait queue lock not held"),
        }
    }

    fn inner_mut(&mut self) -> &mut Inner<T> {
        match &mut self.inner {
            Some(inner) => inner,
            None => unreachable!("wait queue lock not held"),
        }
    }

    /// Number of queued entries, including waiters that timed out and have
    /// not yet run to unlink themselves.
    pub fn len(&self) -> usize {
        self.inner().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner().waiters.is_empty()
    }

    /// Wake the longest-waiting blocked thread.
    pub fn wake_one(&mut self) -> bool {
        self.wake(1, false) == 1
    }

    /// Wake every blocked thread; returns how many.
    pub fn wake_all(&mut self) -> usize {
        self.wake(usize::MAX, false)
    }

    pub fn wake_one_isr(&mut self) -> bool {
        self.wake(1, true) == 1
    }

    pub fn wake_all_isr(&mut self) -> usize {
        self.wake(usize::MAX, true)
    }

    fn wake(&mut self, max: usize, from_isr: bool) -> usize {
        let kernel = self.kernel;
        let waiters = &mut self.inner_mut().waiters;
        let mut woken = 0;
        while woken < max {
            // Entries already made runnable by their timer or an explicit
            // wake stay put; their owners unlink themselves.
            let Some(thread) =
                waiters.remove_first(|t| t.transition(ThreadState::Blocked, ThreadState::Runnable))
            else {
                break;
            };
            kernel.complete_wake(thread, from_isr);
            woken += 1;
        }
        woken
    }

    /// Release the lock, block until woken and retake it.
    pub fn wait(&mut self) {
        self.block(None, || {});
    }

    /// Like [`WaitQueueGuard::wait`], but give up at `deadline`.
    ///
    /// Returns `true` on timeout.
    pub fn wait_deadline(&mut self, deadline: Instant) -> bool {
        if A::now() >= deadline {
            return true;
        }
        self.block(Some(deadline), || {})
    }

    /// Queue the caller, run `queued`, then sleep with the lock dropped.
    fn block<F: FnOnce()>(&mut self, deadline: Option<Instant>, queued: F) -> bool {
        let kernel = self.kernel;
        let me = kernel.current();
        kernel.assert_may_block(&me);

        me.set_state(ThreadState::Blocked);
        self.inner_mut().waiters.push_back(me.clone());
        if let Some(deadline) = deadline {
            kernel.sleepers.arm(&me, deadline);
        }
        queued();

        // Interrupts stay disabled until the switch.
        self.inner = None;
        kernel.schedule();
        self.inner = Some(self.queue.inner.lock());

        // A waker unlinks the entry; if it is still here the timer or a
        // spurious wake got us.
        let still_linked = self.inner_mut().waiters.remove(&me).is_some();
        kernel.sleepers.disarm(&me);
        still_linked && deadline.map_or(false, |deadline| A::now() >= deadline)
    }
}

impl<T, A: Arch> Deref for WaitQueueGuard<'_, T, A> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().state
    }
}

impl<T, A: Arch> DerefMut for WaitQueueGuard<'_, T, A> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner_mut().state
    }
}

impl<T, A: Arch> Drop for WaitQueueGuard<'_, T, A> {
    fn drop(&mut self) {
        self.inner = None;
        self.kernel.irq_restore(self.flags);
    }
}
