//! Scheduler and I/O backends for the Weft fiber runtime.
//!
//! One runtime per OS thread: a dispatch loop running on the thread's own
//! stack multiplexes stackful fibers, and a backend turns blocking
//! operations into suspension points. Two backends are provided on Linux:
//! a completion-based one built on io_uring and a readiness-based one
//! built on epoll.
//!
//! The runtime is strictly single-threaded; the only operation another
//! thread may perform is scheduling a fiber through a [`Remote`] handle,
//! which synchronizes through an eventfd wakeup.

pub mod backend;
pub mod config;
pub mod event;
pub mod fiber;
pub mod notifier;
pub mod pipe;
pub mod queue;
pub mod runtime;
pub mod scheduler;

pub use config::{BackendSelect, Config};
pub use event::Event;
pub use fiber::{
    current_fiber, interrupt, mailbox_receive, mailbox_receive_all, mailbox_send, park, spawn,
    state, transfer, unpark, JoinHandle,
};
pub use pipe::Pipe;
pub use queue::Queue;
pub use runtime::{post_fork, remote, run, run_default, stats, Remote};
pub use scheduler::snooze;

pub use weft_core::{Error, FiberId, FiberState, Resume, Result, Stats, TraceEvent};
