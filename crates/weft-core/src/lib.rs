//! Core types and containers for the Weft fiber runtime.
//!
//! This crate is platform-agnostic: it holds the containers the scheduler
//! is built from (ring buffer, runqueue), the fiber identity and state
//! types, the resume-value representation, the error taxonomy, and the
//! trace/stats records. The actual scheduler and the I/O backends live in
//! `weft-runtime`.

pub mod error;
pub mod id;
pub mod resume;
pub mod ring_buffer;
pub mod runqueue;
pub mod state;
pub mod stats;
pub mod trace;

pub use error::{Error, Result};
pub use id::FiberId;
pub use resume::Resume;
pub use ring_buffer::RingBuffer;
pub use runqueue::{Runqueue, RunqueueEntry};
pub use state::FiberState;
pub use stats::Stats;
pub use trace::TraceEvent;
