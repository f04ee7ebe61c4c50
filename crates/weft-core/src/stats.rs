//! Scheduler statistics.

/// Snapshot of the per-thread scheduler counters.
///
/// `op_count`, `switch_count` and `poll_count` accumulate between reads
/// and reset when a snapshot is taken; the queue figures are
/// point-in-time readings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Current runqueue capacity.
    pub runqueue_size: usize,
    /// Current runqueue length.
    pub runqueue_length: usize,
    /// High-water mark of the runqueue since the last snapshot.
    pub runqueue_max_length: usize,
    /// Backend ops submitted since the last snapshot.
    pub op_count: u64,
    /// Fiber switches since the last snapshot.
    pub switch_count: u64,
    /// Backend polls since the last snapshot.
    pub poll_count: u64,
    /// Fibers currently suspended in a backend op.
    pub pending_ops: usize,
}
