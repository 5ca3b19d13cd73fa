//! Counting semaphore.

use super::waitqueue::WaitQueue;
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::time::Duration;

/// Counting semaphore on top of a [`WaitQueue`].
///
/// The count lives under the queue lock, so `up` increments and wakes in
/// one critical section and a `down` that finds zero is already queued
/// before any `up` can look for waiters. A woken `down` re-checks the
/// count, since another thread may have taken the unit first.
pub struct Semaphore {
    wq: WaitQueue<usize>,
    name: Option<&'static str>,
}

impl Semaphore {
    pub const fn new(count: usize) -> Self {
        Self {
            wq: WaitQueue::new(count),
            name: None,
        }
    }

    pub const fn named(name: &'static str, count: usize) -> Self {
        Self {
            wq: WaitQueue::new(count),
            name: Some(name),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// Take one unit, blocking while none is available.
    pub fn down<A: Arch>(&self, kernel: &Kernel<A>) {
        let mut count = self.wq.wait_event(kernel, |count| *count > 0);
        *count -= 1;
    }

    /// Take one unit, giving up after `timeout`.
    ///
    /// Returns whether a unit was taken.
    pub fn down_timeout<A: Arch>(&self, kernel: &Kernel<A>, timeout: Duration) -> bool {
        let (mut count, timed_out) = self.wq.wait_event_timeout(kernel, timeout, |count| *count > 0);
        if timed_out {
            return false;
        }
        *count -= 1;
        true
    }

    /// Take one unit if one is available right now.
    pub fn down_try<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        let mut count = self.wq.lock(kernel);
        if *count == 0 {
            return false;
        }
        *count -= 1;
        true
    }

    /// [`Semaphore::down_try`] for interrupt handlers.
    pub fn down_try_isr<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        self.down_try(kernel)
    }

    /// Release one unit and wake one waiter.
    pub fn up<A: Arch>(&self, kernel: &Kernel<A>) {
        let mut count = self.wq.lock(kernel);
        *count += 1;
        count.wake_one();
    }

    /// [`Semaphore::up`] for interrupt handlers.
    pub fn up_isr<A: Arch>(&self, kernel: &Kernel<A>) {
        let mut count = self.wq.lock(kernel);
        *count += 1;
        count.wake_one_isr();
    }

    /// Current count.
    pub fn count<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        *self.wq.lock(kernel)
    }
}

impl core::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Semaphore").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot_kernel;

    #[test]
    fn test_down_try_drains_count() {
        let kernel = boot_kernel(1);
        let sem = Semaphore::named("tokens", 2);
        assert_eq!(sem.name(), Some("tokens"));
        assert!(sem.down_try(kernel));
        assert!(sem.down_try_isr(kernel));
        assert!(!sem.down_try(kernel));
        assert_eq!(sem.count(kernel), 0);
    }

    #[test]
    fn test_up_without_waiters_increments() {
        let kernel = boot_kernel(1);
        let sem = Semaphore::new(0);
        sem.up(kernel);
        sem.up_isr(kernel);
        assert_eq!(sem.count(kernel), 2);
        // Units are available, so the idle thread never has to block.
        sem.down(kernel);
        assert!(sem.down_timeout(kernel, Duration::from_millis(1)));
        assert_eq!(sem.count(kernel), 0);
    }
}
