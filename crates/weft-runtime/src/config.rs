//! Runtime configuration.

use std::time::Duration;

use weft_core::trace::TraceFn;
use weft_core::{Error, Result};

/// Which backend to construct for the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSelect {
    /// io_uring when available, otherwise epoll. The `WEFT_BACKEND`
    /// environment variable (`io_uring` / `epoll`) overrides the probe.
    Auto,
    IoUring,
    Epoll,
}

/// Configuration for a per-thread runtime.
pub struct Config {
    /// Backend selection policy.
    pub backend: BackendSelect,

    /// Stack size for each fiber, in bytes.
    pub stack_size: usize,

    /// Submission-queue depth for the completion backend. This is also
    /// the initial prepared-SQE limit; it halves on ENOMEM down to 64.
    pub ring_entries: u32,

    /// Run the periodic idle task at most once per this period while the
    /// runqueue empties. Zero disables it.
    pub idle_period: Duration,

    /// Invoked on each empty-runqueue pass, before the blocking poll.
    pub idle_proc: Option<Box<dyn FnMut()>>,

    /// Receives scheduler trace records.
    pub trace_proc: Option<TraceFn>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendSelect::Auto,
            stack_size: 128 * 1024,
            ring_entries: 1024,
            idle_period: Duration::ZERO,
            idle_proc: None,
            trace_proc: None,
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: BackendSelect) -> Self {
        self.backend = backend;
        self
    }

    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn ring_entries(mut self, entries: u32) -> Self {
        self.ring_entries = entries;
        self
    }

    pub fn idle_period(mut self, period: Duration) -> Self {
        self.idle_period = period;
        self
    }

    pub fn idle_proc(mut self, proc: impl FnMut() + 'static) -> Self {
        self.idle_proc = Some(Box::new(proc));
        self
    }

    pub fn trace_proc(mut self, proc: impl FnMut(&weft_core::TraceEvent) + 'static) -> Self {
        self.trace_proc = Some(Box::new(proc));
        self
    }

    /// Check the configuration for values the runtime cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.stack_size < 16 * 1024 {
            return Err(Error::Arg("stack_size must be at least 16 KiB"));
        }
        if !self.ring_entries.is_power_of_two() {
            return Err(Error::Arg("ring_entries must be a power of two"));
        }
        if self.ring_entries < 64 || self.ring_entries > 32768 {
            return Err(Error::Arg("ring_entries must be in 64..=32768"));
        }
        Ok(())
    }

    /// Resolve `Auto` against the environment override.
    pub(crate) fn resolved_backend(&self) -> BackendSelect {
        if self.backend != BackendSelect::Auto {
            return self.backend;
        }
        match std::env::var("WEFT_BACKEND").as_deref() {
            Ok("epoll") => BackendSelect::Epoll,
            Ok("io_uring") | Ok("uring") => BackendSelect::IoUring,
            _ => BackendSelect::Auto,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_tiny_stack() {
        let cfg = Config::default().stack_size(1024);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_odd_ring_entries() {
        let cfg = Config::default().ring_entries(1000);
        assert!(cfg.validate().is_err());
    }
}
