//! Cross-thread wakeup.
//!
//! A `Notifier` wraps an eventfd another thread writes to in order to
//! break the owning thread out of a blocked backend poll. Writes coalesce
//! (eventfd counter semantics); a notify when the counter would overflow
//! means a wakeup is already pending, which is fine.
//!
//! The paired `Inbox` carries cross-thread schedule requests. The
//! `polling` flag closes the lost-wakeup window: the poller raises it
//! *before* its final emptiness check, and remote senders push *before*
//! they read it, so one side always sees the other.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_queue::SegQueue;

use weft_core::{Error, FiberId, Resume, Result};

pub struct Notifier {
    fd: RawFd,
    polling: AtomicBool,
}

impl Notifier {
    /// Create a notifier with its own eventfd (closed on drop).
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }
        Ok(Self {
            fd,
            polling: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn set_polling(&self, polling: bool) {
        self.polling.store(polling, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_polling(&self) -> bool {
        self.polling.load(Ordering::SeqCst)
    }

    /// Signal the owning thread. Never blocks.
    pub fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd,
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // EAGAIN means the counter would overflow: a signal is
            // already pending.
            if errno != libc::EAGAIN {
                return Err(Error::Sys(errno));
            }
        }
        Ok(())
    }

    /// Drain the counter after a wakeup.
    pub fn drain(&self) {
        let mut val: u64 = 0;
        unsafe {
            libc::read(
                self.fd,
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe {
                libc::close(self.fd);
            }
            self.fd = -1;
        }
    }
}

/// Cross-thread schedule requests bound for one runtime.
pub struct Inbox {
    queue: SegQueue<InboxEntry>,
    pub notifier: Notifier,
}

pub(crate) struct InboxEntry {
    pub fiber: FiberId,
    pub value: Resume,
    pub prioritize: bool,
}

impl Inbox {
    pub fn new() -> Result<Self> {
        Ok(Self {
            queue: SegQueue::new(),
            notifier: Notifier::create()?,
        })
    }

    /// Called from any thread: stage a schedule request and wake the
    /// target if it is blocked in its poll.
    pub fn schedule(&self, fiber: FiberId, value: Resume, prioritize: bool) -> Result<()> {
        self.queue.push(InboxEntry {
            fiber,
            value,
            prioritize,
        });
        if self.notifier.is_polling() {
            self.notifier.notify()?;
        }
        Ok(())
    }

    /// Force the target thread's blocked poll to return.
    pub fn wakeup(&self) -> Result<()> {
        if self.notifier.is_polling() {
            self.notifier.notify()?;
        }
        Ok(())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pop(&self) -> Option<InboxEntry> {
        self.queue.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_and_drain() {
        let n = Notifier::create().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        n.drain();
        // Counter cleared; a further drain must not block (fd is
        // nonblocking and read just fails with EAGAIN).
        n.drain();
    }

    #[test]
    fn test_inbox_entries_pop_in_order() {
        let inbox = Inbox::new().unwrap();
        inbox
            .schedule(FiberId::new(1, 0), Resume::Unit, false)
            .unwrap();
        inbox
            .schedule(FiberId::new(2, 0), Resume::Value(9), true)
            .unwrap();
        let a = inbox.pop().unwrap();
        let b = inbox.pop().unwrap();
        assert_eq!(a.fiber, FiberId::new(1, 0));
        assert_eq!(b.fiber, FiberId::new(2, 0));
        assert!(b.prioritize);
        assert!(inbox.is_empty());
    }
}
