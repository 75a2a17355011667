//! Per-call metrics sinks (§6.3).
//!
//! `Metrics` is a plain counter accumulator scoped to one `predict`/`train`
//! call; unlike `core_render::scheduler::RenderDeltaMetrics` it does not use
//! atomics because a single call never shares it across threads. Collection
//! is opt-in: callers pass `Some(&mut Metrics)` only when they want it.

use std::time::Instant;

/// Integer counters accumulated over one call (§6.3).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Metrics {
    pub batches_written: u64,
    pub lines_written: u64,
    pub lines_read: u64,
    pub poll_calls: u64,
    pub residual_lines_drained: u64,
    pub elapsed_ns: u64,
    /// Items skipped because the formatter failed for them (§4.3 skip-and-count policy).
    pub format_errors: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Timeline event kinds for [`DetailedMetrics`] (§6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    FormatBegin,
    FormatEnd,
    WriteBegin,
    WriteEnd,
    ReadBegin,
    ReadEnd,
    PollReturn,
    DeadlineReached,
}

/// One entry in a [`DetailedMetrics`] timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineEvent {
    pub monotonic_ts_ns: u64,
    pub kind: EventKind,
    pub value: f64,
}

/// Append-only timeline of scheduler events, off by default (§6.3).
#[derive(Debug, Default, Clone)]
pub struct DetailedMetrics {
    events: Vec<TimelineEvent>,
    origin: Option<Instant>,
}

impl DetailedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TimelineEvent] {
        &self.events
    }

    /// Records one event, stamping it with nanoseconds elapsed since the
    /// first recorded event on this accumulator.
    pub(crate) fn record(&mut self, kind: EventKind, value: f64) {
        let origin = *self.origin.get_or_insert_with(Instant::now);
        self.events.push(TimelineEvent {
            monotonic_ts_ns: origin.elapsed().as_nanos() as u64,
            kind,
            value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detailed_metrics_records_in_order() {
        let mut dm = DetailedMetrics::new();
        dm.record(EventKind::WriteBegin, 0.0);
        dm.record(EventKind::WriteEnd, 3.0);
        let events = dm.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::WriteBegin);
        assert_eq!(events[1].kind, EventKind::WriteEnd);
        assert!(events[1].monotonic_ts_ns >= events[0].monotonic_ts_ns);
    }

    #[test]
    fn metrics_default_is_zeroed() {
        let m = Metrics::new();
        assert_eq!(m.batches_written, 0);
        assert_eq!(m.lines_read, 0);
    }
}
