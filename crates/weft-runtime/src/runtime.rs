//! Per-thread runtime: ownership, entry point, dispatch loop.
//!
//! Each OS thread owns at most one `Runtime`, stored in a thread-local
//! cell. The dispatch loop runs on the thread's own stack and is the only
//! place coroutines are resumed; fibers re-enter it by suspending.

use std::cell::RefCell;
use std::sync::Arc;
use std::time::Instant;

use corosensei::CoroutineResult;

use weft_core::{Error, FiberId, FiberState, Resume, Result, Stats, TraceEvent};

use crate::backend::Backend;
use crate::config::Config;
use crate::fiber::{self, FiberArena};
use crate::notifier::Inbox;
use crate::scheduler::{schedule_raw, Base, ANTI_STARVE_SWITCH_THRESHOLD};

pub struct Runtime {
    pub(crate) fibers: FiberArena,
    pub(crate) base: Base,
    pub(crate) backend: Backend,
    pub(crate) inbox: Arc<Inbox>,
    /// Fiber currently executing; `None` on the dispatcher stack.
    pub(crate) current: Option<FiberId>,
    /// Fiber most recently resumed; drives the self-switch half of the
    /// anti-starvation policy.
    pub(crate) last_ran: Option<FiberId>,
    pub(crate) stack_size: usize,
}

thread_local! {
    static RUNTIME: RefCell<Option<Runtime>> = const { RefCell::new(None) };
}

/// Run `f` against the current thread's runtime. Panics without one; use
/// only on paths that are unreachable outside `run`.
pub(crate) fn with_rt<R>(f: impl FnOnce(&mut Runtime) -> R) -> R {
    RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        let rt = slot.as_mut().expect("no runtime on this thread");
        f(rt)
    })
}

/// Fallible variant for public entry points.
pub(crate) fn try_with_rt<R>(f: impl FnOnce(&mut Runtime) -> R) -> Result<R> {
    RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        match slot.as_mut() {
            Some(rt) => Ok(f(rt)),
            None => Err(Error::NoRuntime),
        }
    })
}

impl Runtime {
    fn new(mut config: Config) -> Result<Self> {
        config.validate()?;
        let inbox = Arc::new(Inbox::new()?);
        let backend = Backend::new(&config, inbox.clone())?;
        let base = Base::new(
            config.idle_period,
            config.idle_proc.take(),
            config.trace_proc.take(),
        );
        Ok(Self {
            fibers: FiberArena::new(),
            base,
            backend,
            inbox,
            current: None,
            last_ran: None,
            stack_size: config.stack_size,
        })
    }

    pub(crate) fn stats(&mut self) -> Stats {
        let stats = Stats {
            runqueue_size: self.base.run_queue.capacity(),
            runqueue_length: self.base.run_queue.len(),
            runqueue_max_length: self.base.run_queue.take_max_len(),
            op_count: self.base.op_count,
            switch_count: self.base.switch_count,
            poll_count: self.base.poll_count,
            pending_ops: self.base.pending_count,
        };
        self.base.op_count = 0;
        self.base.switch_count = 0;
        self.base.poll_count = 0;
        stats
    }
}

/// Run `f` as the root fiber of a fresh runtime on the current thread.
///
/// Returns when `f` and every fiber it spawned (directly or indirectly)
/// have finished and no backend ops remain pending.
pub fn run<T, F>(config: Config, f: F) -> Result<T>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    RUNTIME.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_some() {
            return Err(Error::Arg("a runtime is already running on this thread"));
        }
        *slot = Some(Runtime::new(config)?);
        Ok(())
    })?;

    let outcome = (|| {
        let handle = fiber::spawn(f)?;
        dispatch_loop(handle.id());
        handle.try_result().unwrap_or(Err(Error::Terminated))
    })();

    // Tear down: leaked fibers are force-unwound when their coroutines
    // drop, so the runtime must leave the cell only after that.
    let rt = RUNTIME.with(|cell| cell.borrow_mut().take());
    drop(rt);
    outcome
}

/// Convenience entry point with the default configuration.
pub fn run_default<T, F>(f: F) -> Result<T>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    run(Config::default(), f)
}

enum Step {
    Run { entry: weft_core::RunqueueEntry, starve_poll: bool },
    Empty,
}

/// The switcher: shift the next runnable fiber and resume it; when the
/// runqueue is empty, run idle tasks once, then poll the backend
/// (blocking while ops are pending) or terminate. The loop also ends
/// when the root fiber is gone, so stray waiters cannot keep the thread
/// parked forever.
fn dispatch_loop(root: FiberId) {
    let mut idled_this_pass = false;
    loop {
        drain_inbox();

        let step = with_rt(|rt| match rt.base.run_queue.shift() {
            Some(entry) => {
                rt.base.switch_count += 1;
                let starve_poll = rt.base.pending_count > 0
                    && (rt.base.switch_count % ANTI_STARVE_SWITCH_THRESHOLD == 0
                        || rt.last_ran == Some(entry.fiber));
                Step::Run { entry, starve_poll }
            }
            None => Step::Empty,
        });

        match step {
            Step::Run { entry, starve_poll } => {
                idled_this_pass = false;
                if starve_poll {
                    with_rt(|rt| {
                        let Runtime {
                            fibers,
                            base,
                            backend,
                            ..
                        } = rt;
                        backend.poll(false, fibers, base);
                    });
                }
                resume_entry(entry);
            }
            Step::Empty => {
                if !idled_this_pass {
                    idled_this_pass = true;
                    run_idle_tasks();
                    continue;
                }
                let (pending, inbox_empty, root_alive) = with_rt(|rt| {
                    (
                        rt.base.pending_count,
                        rt.inbox.is_empty(),
                        rt.fibers.get(root).is_some(),
                    )
                });
                if !inbox_empty {
                    continue;
                }
                if pending == 0 || !root_alive {
                    break;
                }
                with_rt(|rt| {
                    let Runtime {
                        fibers,
                        base,
                        backend,
                        ..
                    } = rt;
                    backend.poll(true, fibers, base);
                });
            }
        }
    }
}

fn drain_inbox() {
    loop {
        let entry = with_rt(|rt| rt.inbox.pop());
        match entry {
            Some(e) => with_rt(|rt| {
                schedule_raw(&mut rt.fibers, &mut rt.base, e.fiber, e.value, e.prioritize);
            }),
            None => break,
        }
    }
}

fn run_idle_tasks() {
    // The idle proc is taken out for the call so it may itself touch the
    // runtime.
    let proc = with_rt(|rt| rt.base.idle_proc.take());
    if let Some(mut proc) = proc {
        proc();
        with_rt(|rt| rt.base.idle_proc = Some(proc));
    }

    with_rt(|rt| {
        if rt.base.idle_period.is_zero() {
            return;
        }
        let now = Instant::now();
        if now.duration_since(rt.base.idle_last) < rt.base.idle_period {
            return;
        }
        rt.base.idle_last = now;
        rt.backend.idle_compact();
    });
}

/// Resume one runqueue entry and absorb the fiber's state transition when
/// control comes back.
fn resume_entry(entry: weft_core::RunqueueEntry) {
    let co = with_rt(|rt| {
        let cell = rt.fibers.get_mut(entry.fiber)?;
        cell.runnable = false;
        cell.state = FiberState::Running;
        rt.base.trace_with(|| TraceEvent::Unblock {
            fiber: entry.fiber,
            value: entry.value.clone(),
        });
        rt.current = Some(entry.fiber);
        rt.last_ran = Some(entry.fiber);
        cell.co.take()
    });
    let Some(mut co) = co else {
        // Stale entry for a dead fiber.
        with_rt(|rt| rt.current = None);
        return;
    };

    let outcome = co.resume(entry.value);

    with_rt(|rt| {
        rt.current = None;
        match outcome {
            CoroutineResult::Yield(()) => {
                let cell = rt
                    .fibers
                    .get_mut(entry.fiber)
                    .expect("suspended fiber vanished");
                cell.co = Some(co);
                if cell.state == FiberState::Running {
                    cell.state = if cell.runnable {
                        FiberState::Runnable
                    } else {
                        FiberState::Waiting
                    };
                }
            }
            CoroutineResult::Return(()) => {
                drop(co);
                fiber::finalize(rt, entry.fiber);
            }
        }
    });
}

/// A `Send + Clone` handle to one thread's runtime, able to schedule its
/// fibers from other threads. This is the only legal cross-thread
/// operation.
#[derive(Clone)]
pub struct Remote {
    inbox: Arc<Inbox>,
}

impl Remote {
    /// Stage `fiber` with `value` on the owning thread and wake it if it
    /// is blocked in its backend poll.
    pub fn schedule(&self, fiber: FiberId, value: Resume) -> Result<()> {
        self.inbox.schedule(fiber, value, false)
    }

    /// Same, but at the head of the runqueue.
    pub fn schedule_with_priority(&self, fiber: FiberId, value: Resume) -> Result<()> {
        self.inbox.schedule(fiber, value, true)
    }

    /// Force the owning thread's blocked poll to return.
    pub fn wakeup(&self) -> Result<()> {
        self.inbox.wakeup()
    }
}

/// Handle to the current thread's runtime for use from other threads.
pub fn remote() -> Result<Remote> {
    try_with_rt(|rt| Remote {
        inbox: rt.inbox.clone(),
    })
}

/// Snapshot the scheduler counters; the cumulative ones reset on read.
pub fn stats() -> Result<Stats> {
    try_with_rt(|rt| rt.stats())
}

/// Reinitialize the backend after `fork(2)` so the child shares no ring,
/// epoll set or eventfd with its parent. In-flight ops are not preserved.
pub fn post_fork() -> Result<()> {
    try_with_rt(|rt| {
        rt.base.reset();
        rt.backend.post_fork()
    })?
}
