//! One-shot park/signal primitive.
//!
//! At most one fiber awaits an event at a time. `signal` stashes a value
//! and makes the waiter runnable; `wait` parks the calling fiber until
//! signalled. Events are thread-local (cloning shares the same slot).

use std::cell::RefCell;
use std::rc::Rc;

use weft_core::{Error, FiberId, Resume, Result};

use crate::fiber::current_fiber;
use crate::scheduler;

pub struct Event<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

struct Inner<T> {
    waiter: Option<FiberId>,
    value: Option<T>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(Inner {
                waiter: None,
                value: None,
            })),
        }
    }

    /// Wake the waiter, if any, delivering `value`. Without a waiter the
    /// signal (and its value) is dropped. Returns whether a fiber was
    /// woken.
    pub fn signal(&self, value: T) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.waiter.take() {
            Some(waiter) => {
                inner.value = Some(value);
                drop(inner);
                let _ = scheduler::schedule(waiter, Resume::Unit);
                true
            }
            None => false,
        }
    }

    /// Park the current fiber until the event is signalled; returns the
    /// signalled value. Fails with [`Error::AlreadyAwaited`] if another
    /// fiber is parked here, and `None` if the fiber was woken by a plain
    /// schedule rather than a signal.
    pub fn wait(&self) -> Result<Option<T>> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.waiter.is_some() {
                return Err(Error::AlreadyAwaited);
            }
            inner.waiter = Some(current_fiber()?);
        }
        let resumed = crate::backend::wait_event(false);
        self.inner.borrow_mut().waiter = None;
        resumed?.into_result()?;
        Ok(self.inner.borrow_mut().value.take())
    }

    /// Whether a fiber is currently parked on this event.
    pub fn awaited(&self) -> bool {
        self.inner.borrow().waiter.is_some()
    }
}

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_without_waiter_is_dropped() {
        let ev: Event<u32> = Event::new();
        assert!(!ev.signal(1));
        assert!(!ev.awaited());
    }
}
