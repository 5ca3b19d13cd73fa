//! Intrusive FIFO of threads.
//!
//! The list owns a strong reference to every member; the links live inside
//! the threads themselves. Which embedded [`Link`] a list uses is chosen by
//! the `L` marker, so a thread can sit on one wait queue, one ready queue
//! and the sleep queue at the same time without any allocation.

use super::{Link, Thread, ThreadRef};
use core::marker::PhantomData;

extern crate alloc;
use alloc::sync::Arc;

pub(crate) trait LinkField {
    fn link(thread: &Thread) -> &Link;
}

pub(crate) struct WaitLink;
pub(crate) struct RunLink;
pub(crate) struct SleepLink;

impl LinkField for WaitLink {
    fn link(thread: &Thread) -> &Link {
        &thread.wait_link
    }
}

impl LinkField for RunLink {
    fn link(thread: &Thread) -> &Link {
        &thread.run_link
    }
}

impl LinkField for SleepLink {
    fn link(thread: &Thread) -> &Link {
        &thread.sleep_link
    }
}

pub(crate) struct ThreadList<L: LinkField> {
    head: Option<ThreadRef>,
    tail: Option<ThreadRef>,
    len: usize,
    _link: PhantomData<L>,
}

impl<L: LinkField> ThreadList<L> {
    pub(crate) const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            _link: PhantomData,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub(crate) fn front(&self) -> Option<&ThreadRef> {
        self.head.as_ref()
    }

    pub(crate) fn push_back(&mut self, thread: ThreadRef) {
        let link = L::link(&thread);
        assert!(!link.is_linked(), "thread {} is already linked", thread.id());
        link.set_linked(true);

        match self.tail.take() {
            // SAFETY: &mut self is exclusive access to every link in the list.
            Some(tail) => unsafe { *L::link(&tail).next_mut() = Some(thread.clone()) },
            None => self.head = Some(thread.clone()),
        }
        self.tail = Some(thread);
        self.len += 1;
    }

    pub(crate) fn pop_front(&mut self) -> Option<ThreadRef> {
        let head = self.head.take()?;
        let link = L::link(&head);
        // SAFETY: &mut self is exclusive access to every link in the list.
        self.head = unsafe { link.next_mut().take() };
        if self.head.is_none() {
            self.tail = None;
        }
        link.set_linked(false);
        self.len -= 1;
        Some(head)
    }

    /// Insert `thread` in front of the first member for which `goes_before`
    /// holds, or at the back if none does.
    pub(crate) fn insert_before<F>(&mut self, thread: ThreadRef, mut goes_before: F)
    where
        F: FnMut(&ThreadRef) -> bool,
    {
        let mut prev: Option<ThreadRef> = None;
        let mut cursor = self.head.clone();
        while let Some(node) = cursor.take() {
            if goes_before(&node) {
                cursor = Some(node);
                break;
            }
            // SAFETY: &mut self is exclusive access to every link in the list.
            cursor = unsafe { L::link(&node).next_ref().cloned() };
            prev = Some(node);
        }

        if cursor.is_none() {
            self.push_back(thread);
            return;
        }

        let link = L::link(&thread);
        assert!(!link.is_linked(), "thread {} is already linked", thread.id());
        link.set_linked(true);
        // SAFETY: as above; `thread` was unlinked so its link is ours.
        unsafe {
            *link.next_mut() = cursor;
            match prev {
                None => self.head = Some(thread),
                Some(prev) => *L::link(&prev).next_mut() = Some(thread),
            }
        }
        self.len += 1;
    }

    /// Unlink and return the first member matching `pred`.
    pub(crate) fn remove_first<F>(&mut self, mut pred: F) -> Option<ThreadRef>
    where
        F: FnMut(&ThreadRef) -> bool,
    {
        let mut prev: Option<ThreadRef> = None;
        let mut cursor = self.head.clone();
        while let Some(node) = cursor {
            if pred(&node) {
                let link = L::link(&node);
                // SAFETY: &mut self is exclusive access to every link in the list.
                unsafe {
                    let next = link.next_mut().take();
                    match &prev {
                        None => self.head = next,
                        Some(prev) => *L::link(prev).next_mut() = next,
                    }
                }
                if self.tail.as_ref().map_or(false, |tail| Arc::ptr_eq(tail, &node)) {
                    self.tail = prev;
                }
                link.set_linked(false);
                self.len -= 1;
                return Some(node);
            }
            // SAFETY: see above.
            cursor = unsafe { L::link(&node).next_ref().cloned() };
            prev = Some(node);
        }
        None
    }

    /// Unlink `thread` if it is a member.
    pub(crate) fn remove(&mut self, thread: &Thread) -> Option<ThreadRef> {
        if !L::link(thread).is_linked() {
            return None;
        }
        self.remove_first(|member| core::ptr::eq(&**member, thread))
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, thread: &Thread) -> bool {
        L::link(thread).is_linked() && self.iter().any(|member| core::ptr::eq(&**member, thread))
    }

    pub(crate) fn iter(&self) -> Iter<'_, L> {
        Iter {
            next: self.head.as_ref(),
            _link: PhantomData,
        }
    }
}

impl<L: LinkField> Drop for ThreadList<L> {
    fn drop(&mut self) {
        while self.pop_front().is_some() {}
    }
}

pub(crate) struct Iter<'a, L: LinkField> {
    next: Option<&'a ThreadRef>,
    _link: PhantomData<L>,
}

impl<'a, L: LinkField> Iterator for Iter<'a, L> {
    type Item = &'a ThreadRef;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        // SAFETY: the list is borrowed shared for 'a, so nobody relinks it.
        self.next = unsafe { L::link(current).next_ref() };
        Some(current)
    }
}
