//! Runnability bookkeeping and suspension points.
//!
//! All fiber switches funnel through the dispatch loop in
//! [`crate::runtime`]; this module holds the state the loop operates on
//! (runqueues, counters, trace hook) and the primitives fibers use to
//! give up control: [`suspend`], [`snooze`], [`backend_await`].

use std::cell::Cell;
use std::ptr;
use std::time::{Duration, Instant};

use corosensei::Yielder;

use weft_core::trace::TraceFn;
use weft_core::{Error, FiberId, Resume, Result, Runqueue, TraceEvent};

use crate::fiber::FiberArena;
use crate::runtime::{try_with_rt, with_rt};

/// While ops are pending, a non-blocking poll runs at least once per this
/// many switches, so a runqueue that never empties cannot starve I/O.
pub(crate) const ANTI_STARVE_SWITCH_THRESHOLD: u64 = 64;

/// Backend-agnostic scheduler state: the runqueues and the counters both
/// backends and the dispatch loop share.
pub(crate) struct Base {
    pub run_queue: Runqueue,
    pub parked: Runqueue,

    /// Fibers currently suspended inside a backend op.
    pub pending_count: usize,
    /// Set while the backend is blocked in its poll syscall.
    pub currently_polling: bool,

    pub op_count: u64,
    pub switch_count: u64,
    pub poll_count: u64,

    pub idle_period: Duration,
    pub idle_last: Instant,
    pub idle_proc: Option<Box<dyn FnMut()>>,
    pub trace_proc: Option<TraceFn>,
}

impl Base {
    pub fn new(
        idle_period: Duration,
        idle_proc: Option<Box<dyn FnMut()>>,
        trace_proc: Option<TraceFn>,
    ) -> Self {
        Self {
            run_queue: Runqueue::new(),
            parked: Runqueue::new(),
            pending_count: 0,
            currently_polling: false,
            op_count: 0,
            switch_count: 0,
            poll_count: 0,
            idle_period,
            idle_last: Instant::now(),
            idle_proc,
            trace_proc,
        }
    }

    /// Emit a trace record, building it only when a hook is installed.
    #[inline]
    pub fn trace_with(&mut self, build: impl FnOnce() -> TraceEvent) {
        if let Some(proc) = self.trace_proc.as_mut() {
            proc(&build());
        }
    }

    /// Reset runqueues and counters; used after fork.
    pub fn reset(&mut self) {
        self.run_queue.clear();
        self.parked.clear();
        self.pending_count = 0;
        self.currently_polling = false;
        self.op_count = 0;
        self.switch_count = 0;
        self.poll_count = 0;
        self.idle_last = Instant::now();
    }
}

/// Stage `fiber` with `value` on the appropriate runqueue.
///
/// This is the single scheduling path: the public `schedule`, queue and
/// event wakeups, backend completions and cross-thread inbox entries all
/// come through here. A fiber already runnable has its entry replaced
/// (never duplicated); a stale or dead id is ignored.
pub(crate) fn schedule_raw(
    fibers: &mut FiberArena,
    base: &mut Base,
    fiber: FiberId,
    value: Resume,
    prioritize: bool,
) {
    let Some(cell) = fibers.get_mut(fiber) else {
        return;
    };
    if !cell.state.is_alive() {
        return;
    }
    let already_runnable = cell.runnable;
    let parked = cell.parked;

    base.trace_with(|| TraceEvent::Schedule {
        fiber,
        value: value.clone(),
        prioritized: prioritize,
    });

    let queue = if parked {
        &mut base.parked
    } else {
        &mut base.run_queue
    };
    if prioritize {
        queue.unshift(fiber, value, already_runnable);
    } else {
        queue.push(fiber, value, already_runnable);
    }

    if !already_runnable {
        let cell = fibers.get_mut(fiber).unwrap();
        cell.runnable = true;
        if cell.state == weft_core::FiberState::Waiting {
            cell.state = weft_core::FiberState::Runnable;
        }
    }
}

/// Schedule a fiber on the current thread's runtime.
pub fn schedule(fiber: FiberId, value: Resume) -> Result<()> {
    try_with_rt(|rt| {
        schedule_raw(&mut rt.fibers, &mut rt.base, fiber, value, false);
    })
}

/// Schedule a fiber at the head of the runqueue.
pub fn schedule_with_priority(fiber: FiberId, value: Resume) -> Result<()> {
    try_with_rt(|rt| {
        schedule_raw(&mut rt.fibers, &mut rt.base, fiber, value, true);
    })
}

/// Remove a fiber's entry from the runqueue without running it.
pub fn unschedule(fiber: FiberId) -> Result<()> {
    try_with_rt(|rt| {
        rt.base.run_queue.delete(fiber);
        rt.base.parked.delete(fiber);
        if let Some(cell) = rt.fibers.get_mut(fiber) {
            cell.runnable = false;
            if cell.state == weft_core::FiberState::Runnable {
                cell.state = weft_core::FiberState::Waiting;
            }
        }
    })
}

thread_local! {
    /// Yielder of the fiber currently executing on this thread. Null on
    /// the dispatcher stack. Maintained by `suspend` and the fiber entry
    /// trampoline.
    static YIELDER: Cell<*const Yielder<Resume, ()>> = const { Cell::new(ptr::null()) };
}

pub(crate) fn set_yielder(ptr: *const Yielder<Resume, ()>) {
    YIELDER.with(|c| c.set(ptr));
}

/// Give control back to the dispatcher and return the value the fiber is
/// eventually resumed with. The caller must have arranged its own wakeup
/// (runqueue entry, op context, event waiter slot) beforehand.
pub(crate) fn suspend() -> Resume {
    let yielder = YIELDER.with(|c| c.get());
    assert!(
        !yielder.is_null(),
        "suspension point reached outside a fiber"
    );
    with_rt(|rt| {
        let fiber = rt.current.expect("suspending with no current fiber");
        rt.base.trace_with(|| TraceEvent::Block { fiber });
    });
    let value = unsafe { (*yielder).suspend(()) };
    // Another fiber ran in between and replaced the slot.
    YIELDER.with(|c| c.set(yielder));
    value
}

/// Suspend while a backend op is outstanding. The pending-count keeps the
/// dispatch loop polling instead of terminating.
pub(crate) fn backend_await() -> Resume {
    with_rt(|rt| rt.base.pending_count += 1);
    let value = suspend();
    with_rt(|rt| rt.base.pending_count -= 1);
    value
}

/// Voluntarily yield: reschedule the current fiber and switch away. This
/// is the unit of cooperation; N snoozes cost exactly N switches.
pub fn snooze() -> Result<()> {
    let me = crate::fiber::current_fiber()?;
    with_rt(|rt| {
        schedule_raw(&mut rt.fibers, &mut rt.base, me, Resume::Unit, false);
    });
    suspend().into_result().map(|_| ())
}

/// Hand control to `target` with `value`, parking the current fiber until
/// somebody schedules it again. An error resume is returned as `Err`.
pub(crate) fn transfer_raw(target: FiberId, value: Resume) -> Result<Resume> {
    let ok = try_with_rt(|rt| {
        if rt.fibers.get(target).is_none() {
            return false;
        }
        schedule_raw(&mut rt.fibers, &mut rt.base, target, value, true);
        true
    })?;
    if !ok {
        return Err(Error::Terminated);
    }
    suspend().into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_reset_clears_counters() {
        let mut base = Base::new(Duration::ZERO, None, None);
        base.op_count = 5;
        base.switch_count = 9;
        base.pending_count = 2;
        base.run_queue
            .push(FiberId::new(0, 0), Resume::Unit, false);
        base.reset();
        assert_eq!(base.op_count, 0);
        assert_eq!(base.switch_count, 0);
        assert_eq!(base.pending_count, 0);
        assert!(base.run_queue.is_empty());
    }

    #[test]
    fn test_trace_with_only_calls_installed_hook() {
        let mut base = Base::new(Duration::ZERO, None, None);
        // No hook: the closure must not run.
        base.trace_with(|| panic!("built without a hook"));
    }
}
