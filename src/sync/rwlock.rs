//! Sleeping reader-writer lock.

use super::waitqueue::WaitQueue;
use crate::arch::Arch;
use crate::kernel::Kernel;
use crate::thread::ThreadId;

#[derive(Debug, Default)]
struct RwState {
    readers: usize,
    writer: Option<ThreadId>,
    write_depth: usize,
    writers_waiting: usize,
}

impl RwState {
    fn can_read(&self) -> bool {
        self.writer.is_none() && self.writers_waiting == 0
    }

    fn can_write(&self, me: ThreadId) -> bool {
        self.readers == 0 && self.writer.map_or(true, |id| id == me)
    }
}

/// Reader-writer lock whose contenders sleep on a wait queue.
///
/// Any number of readers or one writer hold it at a time. A waiting writer
/// stops new readers from entering, so a steady stream of readers cannot
/// starve it. The writer may take the write side again recursively; a
/// reader that takes the read side again while a writer waits deadlocks.
pub struct RwLock {
    wq: WaitQueue<RwState>,
}

impl RwLock {
    pub const fn new() -> Self {
        Self {
            wq: WaitQueue::new(RwState {
                readers: 0,
                writer: None,
                write_depth: 0,
                writers_waiting: 0,
            }),
        }
    }

    pub fn read_lock<A: Arch>(&self, kernel: &Kernel<A>) {
        let mut state = self.wq.wait_event(kernel, |state| state.can_read());
        state.readers += 1;
    }

    pub fn try_read_lock<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        let mut state = self.wq.lock(kernel);
        if !state.can_read() {
            return false;
        }
        state.readers += 1;
        true
    }

    pub fn read_unlock<A: Arch>(&self, kernel: &Kernel<A>) {
        let mut state = self.wq.lock(kernel);
        assert!(state.readers > 0, "read_unlock without a reader");
        state.readers -= 1;
        if state.readers == 0 {
            state.wake_all();
        }
    }

    pub fn write_lock<A: Arch>(&self, kernel: &Kernel<A>) {
        let me = kernel.current().id();
        let mut state = self.wq.lock(kernel);
        if !state.can_write(me) {
            state.writers_waiting += 1;
            while !state.can_write(me) {
                state.wait();
            }
            state.writers_waiting -= 1;
        }
        state.writer = Some(me);
        state.write_depth += 1;
    }

    pub fn try_write_lock<A: Arch>(&self, kernel: &Kernel<A>) -> bool {
        let me = kernel.current().id();
        let mut state = self.wq.lock(kernel);
        if !state.can_write(me) {
            return false;
        }
        state.writer = Some(me);
        state.write_depth += 1;
        true
    }

    pub fn write_unlock<A: Arch>(&self, kernel: &Kernel<A>) {
        let me = kernel.current().id();
        let mut state = self.wq.lock(kernel);
        assert_eq!(state.writer, Some(me), "thread {} released a write lock it does not hold", me);
        state.write_depth -= 1;
        if state.write_depth == 0 {
            state.writer = None;
            state.wake_all();
        }
    }

    /// Turn the caller's read lock into the write lock.
    ///
    /// The read side is given up first, so another writer may get in
    /// between; whatever was read must be checked again afterwards.
    pub fn upgrade<A: Arch>(&self, kernel: &Kernel<A>) {
        {
            let mut state = self.wq.lock(kernel);
            assert!(state.readers > 0, "upgrade without a read lock");
            state.readers -= 1;
            if state.readers == 0 {
                state.wake_all();
            }
        }
        self.write_lock(kernel);
    }

    /// Turn the caller's write lock into a read lock without letting a
    /// writer in between.
    pub fn downgrade<A: Arch>(&self, kernel: &Kernel<A>) {
        let me = kernel.current().id();
        let mut state = self.wq.lock(kernel);
        assert_eq!(state.writer, Some(me), "thread {} downgraded a write lock it does not hold", me);
        assert_eq!(state.write_depth, 1, "downgrade of a recursively held write lock");
        state.write_depth = 0;
        state.writer = None;
        state.readers += 1;
        state.wake_all();
    }

    pub fn readers<A: Arch>(&self, kernel: &Kernel<A>) -> usize {
        self.wq.lock(kernel).readers
    }

    /// Thread holding the write side.
    pub fn writer<A: Arch>(&self, kernel: &Kernel<A>) -> Option<ThreadId> {
        self.wq.lock(kernel).writer
    }
}

impl Default for RwLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::boot_kernel;

    #[test]
    fn test_readers_share_writer_excludes() {
        let kernel = boot_kernel(1);
        let lock = RwLock::new();

        lock.read_lock(kernel);
        assert!(lock.try_read_lock(kernel));
        assert_eq!(lock.readers(kernel), 2);
        assert!(!lock.try_write_lock(kernel));

        lock.read_unlock(kernel);
        lock.read_unlock(kernel);
        assert!(lock.try_write_lock(kernel));
        assert!(!lock.try_read_lock(kernel));
        assert_eq!(lock.writer(kernel), Some(kernel.current().id()));
        lock.write_unlock(kernel);
        assert_eq!(lock.writer(kernel), None);
    }

    #[test]
    fn test_recursive_write_and_downgrade() {
        let kernel = boot_kernel(1);
        let lock = RwLock::new();

        lock.write_lock(kernel);
        lock.write_lock(kernel);
        lock.write_unlock(kernel);
        assert!(lock.writer(kernel).is_some());

        lock.downgrade(kernel);
        assert_eq!(lock.writer(kernel), None);
        assert_eq!(lock.readers(kernel), 1);
        assert!(lock.try_read_lock(kernel));

        lock.read_unlock(kernel);
        lock.upgrade(kernel);
        assert_eq!(lock.readers(kernel), 0);
        assert!(lock.writer(kernel).is_some());
        lock.write_unlock(kernel);
    }

    #[test]
    #[should_panic(expected = "does not hold")]
    fn test_write_unlock_without_holding_panics() {
        let kernel = boot_kernel(1);
        RwLock::new().write_unlock(kernel);
    }
}
