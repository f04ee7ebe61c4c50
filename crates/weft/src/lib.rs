//! Weft - a cooperative fiber runtime.
//!
//! One OS thread hosts many lightweight, stack-bearing fibers that
//! suspend on I/O and timers and resume when the kernel reports
//! completion (io_uring) or readiness (epoll). Scheduling is strictly
//! cooperative: a fiber runs until it performs a blocking operation,
//! snoozes, or parks on an event or queue.
//!
//! ```no_run
//! use weft::prelude::*;
//!
//! fn main() -> weft::Result<()> {
//!     weft::run_default(|| {
//!         let worker = weft::spawn(|| {
//!             weft::snooze()?;
//!             Ok(7)
//!         })?;
//!         let value = worker.join()?;
//!         assert_eq!(value, 7);
//!         Ok(())
//!     })
//! }
//! ```
//!
//! Blocking operations live in [`io`]; they take raw file descriptors
//! and look synchronous from the calling fiber's point of view. The
//! backend is chosen per thread: io_uring when available, epoll
//! otherwise (override with `WEFT_BACKEND=epoll` or via [`Config`]).

pub use weft_core::{Error, FiberId, FiberState, Resume, Result, Stats, TraceEvent};

pub use weft_runtime::runtime::{post_fork, remote, run, run_default, stats, Remote};
pub use weft_runtime::{
    current_fiber, interrupt, mailbox_receive, mailbox_receive_all, mailbox_send, park, snooze,
    spawn, state, transfer, unpark, BackendSelect, Config, Event, JoinHandle, Pipe, Queue,
};

pub use weft_runtime::backend::{
    kind, move_on_after, sleep, timeout, timer_loop, wait_event, wakeup, BackendKind,
};

pub use weft_runtime::fiber::{auto_watcher, Envelope};
pub use weft_runtime::scheduler::{schedule, schedule_with_priority, unschedule};

/// Blocking-style I/O operations on raw file descriptors.
pub mod io {
    pub use weft_runtime::backend::{
        accept, accept_loop, chain, close, connect, double_splice, poll, read, read_loop, recv,
        recv_loop, recvmsg, send, sendmsg, sendv, splice, splice_chunks, tee, trace, wait_io,
        waitpid, write, writev, ChainOp, ChunkText,
    };
}

/// The common imports for fiber code.
pub mod prelude {
    pub use crate::io;
    pub use crate::{
        current_fiber, sleep, snooze, spawn, timeout, Config, Error, Event, Queue, Result,
    };
}
