use super::{ThreadId, ThreadRef, ThreadState};
use crate::arch::Arch;
use crate::kernel::Kernel;

/// Owned permission to wait for a thread's termination.
#[derive(Debug)]
pub struct JoinHandle {
    thread: ThreadRef,
}

impl JoinHandle {
    pub(crate) fn new(thread: ThreadRef) -> Self {
        Self { thread }
    }

    pub fn thread(&self) -> &ThreadRef {
        &self.thread
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread.id()
    }

    pub fn is_finished(&self) -> bool {
        self.thread.state() == ThreadState::Exited
    }

    /// Wait for the thread to exit.
    ///
    /// Blocks on the thread's exit queue. From an idle thread, which may
    /// not block, it keeps yielding instead.
    pub fn join<A: Arch>(self, kernel: &Kernel<A>) {
        if kernel.current().is_idle() {
            while !self.is_finished() {
                kernel.yield_now();
            }
            return;
        }
        let thread = &self.thread;
        drop(thread.exit_wq.wait_event(kernel, |_| thread.state() == ThreadState::Exited));
    }
}
