//! Sleep timers.
//!
//! Threads waiting with a deadline are kept on one deadline-ordered list.
//! The kernel expires it from the timer interrupt; the expiry callback runs
//! under the list lock and must only use the interrupt-safe wake path.
//!
//! All methods expect local interrupts to be disabled by the caller.

use crate::thread::list::{SleepLink, ThreadList};
use crate::thread::{Thread, ThreadRef};
use crate::time::Instant;

pub struct SleepQueue {
    sleepers: spin::Mutex<ThreadList<SleepLink>>,
}

impl SleepQueue {
    pub const fn new() -> Self {
        Self {
            sleepers: spin::Mutex::new(ThreadList::new()),
        }
    }

    /// Arm (or re-arm) the sleep timer of `thread` for `deadline`.
    ///
    /// Threads with equal deadlines expire in arming order.
    pub fn arm(&self, thread: &ThreadRef, deadline: Instant) {
        let mut sleepers = self.sleepers.lock();
        sleepers.remove(thread);
        thread.set_wakeup_time(Some(deadline));
        let deadline = thread.wakeup_time();
        sleepers.insert_before(thread.clone(), |member| member.wakeup_time() > deadline);
    }

    /// Cancel the sleep timer of `thread`; `false` if none was armed.
    pub fn disarm(&self, thread: &Thread) -> bool {
        if !thread.sleep_link.is_linked() {
            return false;
        }
        let removed = self.sleepers.lock().remove(thread).is_some();
        thread.set_wakeup_time(None);
        removed
    }

    /// Remove every timer due at `now` and hand its thread to `on_expired`.
    ///
    /// Returns the number of expired timers.
    pub fn expire<F>(&self, now: Instant, mut on_expired: F) -> usize
    where
        F: FnMut(ThreadRef),
    {
        let mut sleepers = self.sleepers.lock();
        let mut expired = 0;
        while sleepers
            .front()
            .and_then(|t| t.wakeup_time())
            .map_or(false, |deadline| deadline <= now)
        {
            let Some(thread) = sleepers.pop_front() else {
                break;
            };
            thread.set_wakeup_time(None);
            on_expired(thread);
            expired += 1;
        }
        expired
    }

    /// Earliest armed deadline, for programming a one-shot timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sleepers.lock().front().and_then(|t| t.wakeup_time())
    }

    pub fn len(&self) -> usize {
        self.sleepers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sleepers.lock().is_empty()
    }
}

impl Default for SleepQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::helpers::detached_thread;
    use alloc::vec::Vec;

    fn at(nanos: u64) -> Instant {
        Instant::from_nanos(nanos)
    }

    #[test]
    fn test_expire_in_deadline_order() {
        let queue = SleepQueue::new();
        let threads: Vec<_> = (1..=3).map(|id| detached_thread(id, 128)).collect();
        queue.arm(&threads[0], at(300));
        queue.arm(&threads[1], at(100));
        queue.arm(&threads[2], at(200));
        assert_eq!(queue.next_deadline(), Some(at(100)));

        let mut fired = Vec::new();
        assert_eq!(queue.expire(at(250), |t| fired.push(t.id().get())), 2);
        assert_eq!(fired, [2, 3]);
        assert_eq!(threads[1].wakeup_time(), None);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(at(300)));
    }

    #[test]
    fn test_equal_deadlines_fire_in_arming_order() {
        let queue = SleepQueue::new();
        let a = detached_thread(1, 128);
        let b = detached_thread(2, 128);
        queue.arm(&a, at(50));
        queue.arm(&b, at(50));

        let mut fired = Vec::new();
        queue.expire(at(50), |t| fired.push(t.id().get()));
        assert_eq!(fired, [1, 2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_disarm_and_rearm() {
        let queue = SleepQueue::new();
        let t = detached_thread(1, 128);
        assert!(!queue.disarm(&t));

        queue.arm(&t, at(10));
        queue.arm(&t, at(500));
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.expire(at(100), |_| {}), 0);

        assert!(queue.disarm(&t));
        assert_eq!(t.wakeup_time(), None);
        assert!(!t.sleep_link.is_linked());
        assert_eq!(queue.expire(at(1_000), |_| {}), 0);
    }
}
