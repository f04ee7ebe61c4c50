//! Fibers: spawning, joining, parking, messaging.
//!
//! Fiber records live in a per-thread generational arena. The coroutine
//! itself is taken out of its slot while running and put back when it
//! suspends, so the arena is never borrowed across a stack switch.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use corosensei::stack::DefaultStack;
use corosensei::Coroutine;

use weft_core::{Error, FiberId, FiberState, Resume, Result, TraceEvent};

use crate::event::Event;
use crate::queue::Queue;
use crate::runtime::try_with_rt;
use crate::scheduler::{self, schedule_raw};

/// A type-erased mailbox message.
pub type Envelope = Box<dyn Any>;

pub(crate) type FiberCo = Coroutine<Resume, (), ()>;

pub(crate) struct FiberCell {
    /// Taken while the fiber is running.
    pub co: Option<FiberCo>,
    pub state: FiberState,
    /// Set while an entry for this fiber sits on a runqueue.
    pub runnable: bool,
    /// Parked fibers are staged on the parked runqueue and never run.
    pub parked: bool,
    pub mailbox: Option<Queue<Envelope>>,
    pub auto_watcher: Option<Event<()>>,
    /// At most one fiber waiting in `JoinHandle::join`.
    pub join_waiter: Option<FiberId>,
}

impl FiberCell {
    fn new(co: FiberCo) -> Self {
        Self {
            co: Some(co),
            state: FiberState::Waiting,
            runnable: false,
            parked: false,
            mailbox: None,
            auto_watcher: None,
            join_waiter: None,
        }
    }
}

/// Slot-reusing arena with generation tags. A stale `FiberId` (its fiber
/// terminated and the slot was reused) fails the generation check and
/// every lookup returns `None`, which callers treat as "dead fiber".
pub(crate) struct FiberArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

struct Slot {
    generation: u32,
    cell: Option<FiberCell>,
}

impl FiberArena {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn insert(&mut self, cell: FiberCell) -> FiberId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.cell = Some(cell);
            FiberId::new(index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot {
                generation: 0,
                cell: Some(cell),
            });
            FiberId::new(index, 0)
        }
    }

    pub fn get(&self, id: FiberId) -> Option<&FiberCell> {
        let slot = self.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.cell.as_ref()
    }

    pub fn get_mut(&mut self, id: FiberId) -> Option<&mut FiberCell> {
        let slot = self.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.cell.as_mut()
    }

    /// Drop the fiber's record and retire its id.
    pub fn remove(&mut self, id: FiberId) {
        if let Some(slot) = self.slots.get_mut(id.index() as usize) {
            if slot.generation == id.generation() && slot.cell.is_some() {
                slot.cell = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(id.index());
                self.live -= 1;
            }
        }
    }

    pub fn live(&self) -> usize {
        self.live
    }
}

/// Handle for the result of a spawned fiber. Dropping the handle detaches
/// the fiber; joining parks the caller until the fiber finishes.
pub struct JoinHandle<T> {
    id: FiberId,
    result: Rc<RefCell<Option<Result<T>>>>,
}

impl<T> JoinHandle<T> {
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// Take the result if the fiber already finished.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.result.borrow_mut().take()
    }

    /// Park until the fiber finishes and return its result.
    pub fn join(self) -> Result<T> {
        loop {
            if let Some(result) = self.result.borrow_mut().take() {
                return result;
            }
            let me = current_fiber()?;
            let registered = try_with_rt(|rt| match rt.fibers.get_mut(self.id) {
                Some(cell) => {
                    cell.join_waiter = Some(me);
                    true
                }
                None => false,
            })?;
            if !registered {
                // Fiber already gone; its result was stored before death.
                if let Some(result) = self.result.borrow_mut().take() {
                    return result;
                }
                return Err(Error::Terminated);
            }
            let resumed = crate::backend::wait_event(false)?;
            let _ = try_with_rt(|rt| {
                if let Some(cell) = rt.fibers.get_mut(self.id) {
                    if cell.join_waiter == Some(me) {
                        cell.join_waiter = None;
                    }
                }
            });
            resumed.into_result()?;
        }
    }

    /// Inject `error` into the fiber at its next (or current) suspension
    /// point. The fiber's pending op, if any, is cancelled.
    pub fn interrupt(&self, error: Error) -> Result<()> {
        interrupt(self.id, error)
    }
}

/// Spawn a fiber running `f`. The fiber is scheduled immediately and runs
/// at the next switchpoint.
pub fn spawn<T, F>(f: F) -> Result<JoinHandle<T>>
where
    T: 'static,
    F: FnOnce() -> Result<T> + 'static,
{
    let stack_size = try_with_rt(|rt| rt.stack_size)?;
    let result: Rc<RefCell<Option<Result<T>>>> = Rc::new(RefCell::new(None));
    let result_in = result.clone();

    let stack = DefaultStack::new(stack_size).map_err(Error::from)?;
    let co = Coroutine::with_stack(stack, move |yielder, first: Resume| {
        scheduler::set_yielder(yielder as *const _);
        let out = match first.into_result() {
            // Interrupted before it ever ran.
            Err(e) => Err(e),
            Ok(_) => panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or(Err(Error::Panicked)),
        };
        *result_in.borrow_mut() = Some(out);
        finish_current();
        scheduler::set_yielder(std::ptr::null());
    });

    let id = try_with_rt(|rt| {
        let id = rt.fibers.insert(FiberCell::new(co));
        rt.base.trace_with(|| TraceEvent::Spin { fiber: id });
        schedule_raw(&mut rt.fibers, &mut rt.base, id, Resume::Unit, false);
        id
    })?;

    Ok(JoinHandle { id, result })
}

/// Runs on the fiber's own stack just before it returns: wake the joiner,
/// if one is parked.
fn finish_current() {
    let waiter = try_with_rt(|rt| {
        let me = rt.current?;
        rt.fibers.get_mut(me).and_then(|cell| cell.join_waiter.take())
    });
    if let Ok(Some(waiter)) = waiter {
        let _ = scheduler::schedule(waiter, Resume::Unit);
    }
}

/// Id of the fiber currently executing on this thread.
pub fn current_fiber() -> Result<FiberId> {
    try_with_rt(|rt| rt.current)?.ok_or(Error::OutsideFiber)
}

/// Report a fiber's state: running, runnable, waiting or dead.
pub fn state(id: FiberId) -> FiberState {
    try_with_rt(|rt| match rt.fibers.get(id) {
        None => FiberState::Dead,
        Some(cell) => {
            if rt.current == Some(id) {
                FiberState::Running
            } else if cell.runnable {
                FiberState::Runnable
            } else {
                cell.state
            }
        }
    })
    .unwrap_or(FiberState::Dead)
}

/// Inject `error` into `id` at its next suspension point, with priority.
pub fn interrupt(id: FiberId, error: Error) -> Result<()> {
    scheduler::schedule_with_priority(id, Resume::Err(error))
}

/// Hand control to `target` with `value` and park until rescheduled.
/// An error resume re-raises in the calling fiber.
pub fn transfer(target: FiberId, value: Resume) -> Result<Resume> {
    scheduler::transfer_raw(target, value)
}

/// Hide `id` from the dispatcher: its runqueue entry (and any future
/// schedules) go to the parked runqueue until [`unpark`].
pub fn park(id: FiberId) -> Result<()> {
    try_with_rt(|rt| {
        if let Some(cell) = rt.fibers.get_mut(id) {
            cell.parked = true;
            let base = &mut rt.base;
            base.run_queue.migrate(&mut base.parked, id);
        }
    })
}

/// Undo [`park`]: migrate the fiber back so the dispatcher can run it.
pub fn unpark(id: FiberId) -> Result<()> {
    try_with_rt(|rt| {
        if let Some(cell) = rt.fibers.get_mut(id) {
            cell.parked = false;
            let base = &mut rt.base;
            base.parked.migrate(&mut base.run_queue, id);
        }
    })
}

fn mailbox_of(id: FiberId) -> Result<Queue<Envelope>> {
    try_with_rt(|rt| {
        rt.fibers
            .get_mut(id)
            .map(|cell| cell.mailbox.get_or_insert_with(Queue::new).clone())
            .ok_or(Error::Terminated)
    })?
}

/// Deliver `msg` to `id`'s mailbox, creating the mailbox on first use.
pub fn mailbox_send<M: Any>(id: FiberId, msg: M) -> Result<()> {
    mailbox_of(id)?.push(Box::new(msg));
    Ok(())
}

/// Receive the next message from the current fiber's mailbox, parking
/// until one arrives. Fails if the message is not an `M`.
pub fn mailbox_receive<M: Any>() -> Result<M> {
    let envelope = mailbox_of(current_fiber()?)?.shift()?;
    envelope
        .downcast::<M>()
        .map(|b| *b)
        .map_err(|_| Error::Arg("mailbox message has a different type"))
}

/// Drain the current fiber's mailbox without waiting.
pub fn mailbox_receive_all() -> Result<Vec<Envelope>> {
    Ok(mailbox_of(current_fiber()?)?.shift_all())
}

/// The fiber's lazily-created one-shot event, reused for common
/// wait-once patterns.
pub fn auto_watcher() -> Result<Event<()>> {
    let me = current_fiber()?;
    try_with_rt(|rt| {
        rt.fibers
            .get_mut(me)
            .map(|cell| cell.auto_watcher.get_or_insert_with(Event::new).clone())
            .ok_or(Error::Terminated)
    })?
}

/// Finalize a terminated fiber: trace, purge runqueue entries, retire the
/// slot. Runs on the dispatcher stack after the coroutine returned.
pub(crate) fn finalize(rt: &mut crate::runtime::Runtime, id: FiberId) {
    rt.base.trace_with(|| TraceEvent::Terminate { fiber: id });
    rt.base.run_queue.delete(id);
    rt.base.parked.delete(id);
    if let Some(cell) = rt.fibers.get_mut(id) {
        cell.state = FiberState::Dead;
    }
    rt.fibers.remove(id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_generation_invalidates_stale_ids() {
        let mut arena = FiberArena::new();
        let co = Coroutine::new(|_yielder, _first: Resume| {});
        let id = arena.insert(FiberCell::new(co));
        assert!(arena.get(id).is_some());
        arena.remove(id);
        assert!(arena.get(id).is_none());

        let co2 = Coroutine::new(|_yielder, _first: Resume| {});
        let id2 = arena.insert(FiberCell::new(co2));
        assert_eq!(id2.index(), id.index());
        assert_ne!(id2.generation(), id.generation());
        assert!(arena.get(id).is_none());
        assert!(arena.get(id2).is_some());
    }

    #[test]
    fn test_arena_live_count() {
        let mut arena = FiberArena::new();
        let a = arena.insert(FiberCell::new(Coroutine::new(|_y, _f: Resume| {})));
        let b = arena.insert(FiberCell::new(Coroutine::new(|_y, _f: Resume| {})));
        assert_eq!(arena.live(), 2);
        arena.remove(a);
        assert_eq!(arena.live(), 1);
        arena.remove(b);
        arena.remove(b); // double remove is a no-op
        assert_eq!(arena.live(), 0);
    }
}
