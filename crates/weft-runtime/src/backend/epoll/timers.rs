//! Deadline heap for the readiness backend.
//!
//! One-shot deadlines targeting a fiber with a staged resume value. The
//! epoll wait timeout is derived from the nearest live deadline;
//! cancellation is a flag on the entry so the heap never needs random
//! removal.

use std::cell::Cell;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::Instant;

use weft_core::{FiberId, Resume};

use crate::fiber::FiberArena;
use crate::scheduler::{schedule_raw, Base};

/// Cancellation/completion flags shared with the registering op.
pub struct TimerHandle {
    flags: Rc<TimerFlags>,
}

struct TimerFlags {
    cancelled: Cell<bool>,
    fired: Cell<bool>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.flags.cancelled.set(true);
    }

    pub fn fired(&self) -> bool {
        self.flags.fired.get()
    }
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    fiber: FiberId,
    resume: Resume,
    flags: Rc<TimerFlags>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse: BinaryHeap is a max-heap, we want the nearest deadline
        // on top.
        other
            .deadline
            .cmp(&self.deadline)
            .then(other.seq.cmp(&self.seq))
    }
}

pub struct TimerHeap {
    heap: BinaryHeap<TimerEntry>,
    seq: u64,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn register(&mut self, deadline: Instant, fiber: FiberId, resume: Resume) -> TimerHandle {
        let flags = Rc::new(TimerFlags {
            cancelled: Cell::new(false),
            fired: Cell::new(false),
        });
        self.seq += 1;
        self.heap.push(TimerEntry {
            deadline,
            seq: self.seq,
            fiber,
            resume,
            flags: flags.clone(),
        });
        TimerHandle { flags }
    }

    /// Nearest live deadline, discarding cancelled entries on the way.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(top) = self.heap.peek() {
            if top.flags.cancelled.get() {
                self.heap.pop();
                continue;
            }
            return Some(top.deadline);
        }
        None
    }

    /// Schedule every fiber whose deadline has passed.
    pub(crate) fn fire_due(&mut self, now: Instant, fibers: &mut FiberArena, base: &mut Base) {
        while let Some(top) = self.heap.peek() {
            if top.flags.cancelled.get() {
                self.heap.pop();
                continue;
            }
            if top.deadline > now {
                return;
            }
            let entry = self.heap.pop().unwrap();
            entry.flags.fired.set(true);
            schedule_raw(fibers, base, entry.fiber, entry.resume, false);
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn compact(&mut self) {
        self.heap.shrink_to_fit();
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_nearest_deadline_wins() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let far = now + Duration::from_secs(10);
        let near = now + Duration::from_secs(1);
        heap.register(far, FiberId::new(1, 0), Resume::Unit);
        heap.register(near, FiberId::new(2, 0), Resume::Unit);
        assert_eq!(heap.next_deadline(), Some(near));
    }

    #[test]
    fn test_cancelled_entries_are_skipped() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let near = heap.register(now + Duration::from_secs(1), FiberId::new(1, 0), Resume::Unit);
        heap.register(now + Duration::from_secs(5), FiberId::new(2, 0), Resume::Unit);
        near.cancel();
        assert_eq!(heap.next_deadline(), Some(now + Duration::from_secs(5)));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_fire_due_marks_fired() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let handle = heap.register(now, FiberId::new(1, 0), Resume::Unit);
        let mut fibers = FiberArena::new();
        let mut base = Base::new(Duration::ZERO, None, None);
        heap.fire_due(now + Duration::from_millis(1), &mut fibers, &mut base);
        assert!(handle.fired());
        assert!(heap.is_empty());
    }
}
