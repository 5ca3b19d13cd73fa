//! Sleeping mutex.

use super::waitqueue::WaitQueue;
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::thread::ThreadId;

#[derive(Debug, Default)]
struct Owner {
    thread: Option<ThreadId>,
    depth: usize,
}

/// Recursive mutex whose contenders sleep on a wait queue.
///
/// The owner may lock it again; it is released when `unlock` has been
/// called as many times as `lock`. Unlocking from a thread that does not
/// own it is a contract violation and panics.
pub struct Mutex {
    wq: WaitQueue<Owner>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            wq: WaitQueue::new(Owner {
                thread: None,
                depth: 0,
            }),
        }
    }

    pub fn lock<A: Arch>(&self, kernel: &Kernel<A>) {
        self.reacquire(kernel, 1);
    }

    /// Take the mutex `depth` levels deep.
    pub(crate) fn reacquire<A: Arch>(&self, kernel: &Kernel<A>, depth: usize) {
        let me = kernel.current().id();
        let mut owner = self
            .wq
            .wait_event(kernel, |owner| owner.thread.map_or(true, |id| id == me));
        owner.thread = Some(me);
        owner.depth += depth;
    }

    /// Drop every level the caller holds; returns how many there were.
    pub(crate) fn release<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        let me = kernel.current().id();
        let mut owner = self.wq.lock(kernel);
        assert_eq!(owner.thread, Some(me), "thread {} unlocked a mutex it does not own", me);
        let depth = core::mem::take(&mut owner.depth);
        owner.thread = None;
        owner.wake_one();
        depth
    }

    pub fn try_lock<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        let me = kernel.current().id();
        let mut owner = self.wq.lock(kernel);
        if owner.thread.map_or(false, |id| id != me) {
            return false;
        }
        owner.thread = Some(me);
        owner.depth += 1;
        true
    }

    pub fn unlock<A: Arch>(&self, kernel: &Kernel<A>) {
        let me = kernel.current().id();
        let mut owner = self.wq.lock(kernel);
        assert_eq!(owner.thread, Some(me), "thread {} unlocked a mutex it does not own", me);
        owner.depth -= 1;
        if owner.depth == 0 {
            owner.thread = None;
            owner.wake_one();
        }
    }

    pub fn is_locked<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        self.wq.lock(kernel).thread.is_some()
    }

    /// Thread holding the mutex.
    pub fn owner<A: Arch>(&self, kernel: &Kernel<A>) -> Option<ThreadId> {
        self.wq.lock(kernel).thread
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot_kernel;

    #[test]
    fn test_recursive_lock_and_release() {
        let kernel = boot_kernel(1);
        let me = kernel.current().id();
        let mutex = Mutex::new();
        assert!(!mutex.is_locked(kernel));

        mutex.lock(kernel);
        assert!(mutex.try_lock(kernel));
        assert_eq!(mutex.owner(kernel), Some(me));

        mutex.unlock(kernel);
        assert!(mutex.is_locked(kernel));
        mutex.unlock(kernel);
        assert!(!mutex.is_locked(kernel));
    }

    #[test]
    #[should_panic(expected = "does not own")]
    fn test_unlock_without_owning_panics() {
        let kernel = boot_kernel(1);
        Mutex::new().unlock(kernel);
    }
}
