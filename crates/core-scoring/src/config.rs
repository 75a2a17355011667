//! Tunable scheduling parameters.
//!
//! This is plain in-process parameterization, not configuration *loading*:
//! there is no file format or discovery path here, matching spec §1's
//! Non-goal of file-based configuration. Callers who want file-backed
//! config can parse one themselves and build a `SchedulerConfig` from it.

use std::time::Duration;

/// Lower bound of the adaptive batch size range (§4.4).
pub const MIN_BATCH_SIZE: usize = 64;
/// Upper bound of the adaptive batch size range (§4.4).
pub const MAX_BATCH_SIZE: usize = 2048;
/// Default batch size when the deadline is not tight.
pub const DEFAULT_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Batch size used by the blocking scheduler absent deadline pressure.
    /// Clamped to `[MIN_BATCH_SIZE, MAX_BATCH_SIZE]` on construction.
    pub batch_size: usize,
    /// Upper bound on a single readiness poll in the non-blocking scheduler.
    /// Bounds worst-case overshoot of the deadline (§4.5, §8 invariant 2).
    pub poll_slice: Duration,
    /// Max bytes the non-blocking scheduler will accumulate in `send_buf`
    /// before yielding control back to the poll loop. Default: one typical
    /// pipe buffer (64 KiB), per §4.5 step 2.
    pub slab_size: usize,
    /// Capacity of the background stderr ring buffer (§4.1, §5).
    pub stderr_ring_capacity: usize,
    /// How long `EngineHandle::close` waits for the child to exit on its own
    /// before force-terminating it.
    pub close_grace_period: Duration,
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        self
    }

    #[must_use]
    pub fn with_poll_slice(mut self, poll_slice: Duration) -> Self {
        self.poll_slice = poll_slice;
        self
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            poll_slice: Duration::from_millis(1),
            slab_size: 64 * 1024,
            stderr_ring_capacity: 64 * 1024,
            close_grace_period: Duration::from_millis(200),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_clamps_to_documented_range() {
        let cfg = SchedulerConfig::new().with_batch_size(10);
        assert_eq!(cfg.batch_size, MIN_BATCH_SIZE);
        let cfg = SchedulerConfig::new().with_batch_size(1_000_000);
        assert_eq!(cfg.batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn defaults_match_spec() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.batch_size, 500);
        assert_eq!(cfg.poll_slice, Duration::from_millis(1));
    }
}
