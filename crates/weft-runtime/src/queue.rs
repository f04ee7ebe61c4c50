//! Multi-producer/multi-consumer FIFO for fibers on one thread.
//!
//! Invariant: if values are queued, no shifter is parked; a push wakes
//! one parked shifter *before* enqueueing, and a shifter loops until it
//! actually obtains a value, so spurious wakeups are harmless and
//! delivery order follows push order.

use std::cell::RefCell;
use std::rc::Rc;

use weft_core::{FiberId, Resume, Result, RingBuffer};

use crate::fiber::current_fiber;
use crate::scheduler;

pub struct Queue<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

struct Inner<T> {
    values: RingBuffer<T>,
    waiters: RingBuffer<FiberId>,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                values: RingBuffer::new(),
                waiters: RingBuffer::new(),
            })),
        }
    }

    fn wake_one_waiter(inner: &mut Inner<T>) {
        if let Some(waiter) = inner.waiters.shift() {
            let _ = scheduler::schedule(waiter, Resume::Unit);
        }
    }

    /// Append a value, waking one parked shifter.
    pub fn push(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        Self::wake_one_waiter(&mut inner);
        inner.values.push(value);
    }

    /// Prepend a value, waking one parked shifter.
    pub fn unshift(&self, value: T) {
        let mut inner = self.inner.borrow_mut();
        Self::wake_one_waiter(&mut inner);
        inner.values.unshift(value);
    }

    /// Remove and return the head value, parking until one is available.
    pub fn shift(&self) -> Result<T> {
        let me = current_fiber()?;
        loop {
            {
                let mut inner = self.inner.borrow_mut();
                inner.waiters.push(me);
                if !inner.values.is_empty() {
                    // A value is already there; schedule ourselves so the
                    // wait below returns immediately without blocking.
                    let _ = scheduler::schedule(me, Resume::Unit);
                }
            }
            let resumed = crate::backend::wait_event(false);
            {
                let mut inner = self.inner.borrow_mut();
                inner.waiters.delete(&me);
            }
            resumed?.into_result()?;
            let mut inner = self.inner.borrow_mut();
            if let Some(value) = inner.values.shift() {
                return Ok(value);
            }
        }
    }

    /// Remove and return the head value if one is present.
    pub fn shift_no_wait(&self) -> Option<T> {
        self.inner.borrow_mut().values.shift()
    }

    /// Remove all queued values, in order.
    pub fn shift_all(&self) -> Vec<T> {
        self.inner.borrow_mut().values.shift_all()
    }

    /// Consume all queued values through `f`.
    pub fn shift_each(&self, f: impl FnMut(T)) {
        self.inner.borrow_mut().values.shift_each(f);
    }

    pub fn clear(&self) {
        self.inner.borrow_mut().values.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().values.is_empty()
    }

    /// Whether any fiber is parked waiting to shift.
    pub fn pending(&self) -> bool {
        !self.inner.borrow().waiters.is_empty()
    }

    /// Wake every parked shifter with `value` (typically an error). The
    /// woken fibers observe it at their suspension point.
    pub fn flush_waiters(&self, value: Resume) {
        loop {
            let waiter = self.inner.borrow_mut().waiters.shift();
            match waiter {
                Some(w) => {
                    let _ = scheduler::schedule(w, value.clone());
                }
                None => return,
            }
        }
    }
}

impl<T: PartialEq> Queue<T> {
    /// Remove the first queued value equal to `value`.
    pub fn delete(&self, value: &T) -> Option<T> {
        self.inner.borrow_mut().values.delete(value)
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_blocking_surface() {
        let q: Queue<i32> = Queue::new();
        assert!(q.is_empty());
        q.push(1);
        q.push(2);
        q.unshift(0);
        assert_eq!(q.len(), 3);
        assert_eq!(q.shift_no_wait(), Some(0));
        assert_eq!(q.delete(&2), Some(2));
        assert_eq!(q.shift_all(), vec![1]);
        assert!(q.is_empty());
        assert!(!q.pending());
    }
}
