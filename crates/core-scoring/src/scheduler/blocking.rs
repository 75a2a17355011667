//! Blocking scheduler (§4.4) — buffered, write-one-batch-ahead loop.
//! Highest throughput: the kernel handles flow control. A single write that
//! fills the stdin pipe buffer can block the thread for up to the time the
//! engine needs to drain it, which is the rare tail-latency cost this
//! scheduler accepts in exchange for simplicity and throughput.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Instant;

use tracing::{debug, trace};

use crate::batch::BatchBuilder;
use crate::config::SchedulerConfig;
use crate::engine::EngineHandle;
use crate::error::{DriverError, DriverResult};
use crate::formatter::Formatter;
use crate::metrics::{DetailedMetrics, EventKind, Metrics};
use crate::scheduler::{parse_score_line, ScoreBatch};

/// Reads one newline-terminated line from `stdout`, using `recv_buf` as a
/// cross-call carry-over buffer so bytes read past the line boundary in one
/// syscall are not lost when this function returns (§3: batches/lines never
/// get silently dropped across call boundaries).
fn read_one_line(
    stdout: &mut std::process::ChildStdout,
    recv_buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    loop {
        if let Some(pos) = recv_buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = recv_buf.drain(..=pos).collect();
            line.pop(); // drop the newline
            return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
        }
        let mut chunk = [0u8; 4096];
        let n = stdout.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        recv_buf.extend_from_slice(&chunk[..n]);
    }
}

/// Drains `*residual` previously-owed score lines before any new work is
/// submitted (§4.5 residual-drain protocol, applied uniformly regardless of
/// scheduler — see DESIGN.md). Bounded by `deadline`; a partially-drained
/// residual is legal and simply carried forward.
fn drain_residual(
    stdout: &mut std::process::ChildStdout,
    recv_buf: &mut Vec<u8>,
    residual: &mut usize,
    deadline: Instant,
    metrics: Option<&mut Metrics>,
) -> DriverResult<()> {
    let mut metrics = metrics;
    while *residual > 0 && Instant::now() < deadline {
        match read_one_line(stdout, recv_buf)? {
            Some(line) => {
                if parse_score_line(&line).is_none() {
                    return Err(DriverError::EngineGone);
                }
                *residual -= 1;
                if let Some(m) = metrics.as_deref_mut() {
                    m.residual_lines_drained += 1;
                    m.lines_read += 1;
                }
            }
            None => return Err(DriverError::EngineGone),
        }
    }
    Ok(())
}

/// Runs the write-one-batch-ahead algorithm of §4.4 for `items`, returning
/// as many scores as fit before `deadline`.
#[allow(clippy::too_many_arguments)]
pub fn run<C, I, F: Formatter<C, I>>(
    engine: &mut EngineHandle,
    formatter: &F,
    ctx: &C,
    items: &[I],
    deadline: Instant,
    config: &SchedulerConfig,
    recv_buf: &mut Vec<u8>,
    residual: &mut usize,
    mut metrics: Option<&mut Metrics>,
    mut detailed: Option<&mut DetailedMetrics>,
) -> DriverResult<ScoreBatch> {
    if engine.poisoned() || !engine.is_alive() {
        return Err(DriverError::EngineGone);
    }

    let stdout = engine.stdout_mut().ok_or(DriverError::EngineGone)?;
    drain_residual(stdout, recv_buf, residual, deadline, metrics.as_deref_mut())?;

    let total_items = items.len();
    let mut builder = BatchBuilder::new(formatter, ctx, items).map_err(|source| {
        // `common()` failure is not item-specific; usize::MAX marks it as such.
        DriverError::FormatError {
            item_index: usize::MAX,
            source,
        }
    })?;

    let mut scores = Vec::with_capacity(total_items);
    let mut in_flight: VecDeque<usize> = VecDeque::new();

    let write_batch = |engine: &mut EngineHandle,
                       builder: &mut BatchBuilder<'_, C, I>,
                       metrics: &mut Option<&mut Metrics>,
                       detailed: &mut Option<&mut DetailedMetrics>|
     -> DriverResult<usize> {
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::FormatBegin, 0.0);
        }
        let (buf, consumed) = builder.next_batch(formatter, ctx, config.batch_size, metrics.as_deref_mut());
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::FormatEnd, consumed as f64);
        }
        if consumed == 0 {
            return Ok(0);
        }
        let stdin = engine.stdin_mut().ok_or(DriverError::EngineGone)?;
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::WriteBegin, buf.len() as f64);
        }
        stdin.write_all(&buf).map_err(|_| DriverError::EngineGone)?;
        stdin.flush().map_err(|_| DriverError::EngineGone)?;
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::WriteEnd, consumed as f64);
        }
        if let Some(m) = metrics.as_deref_mut() {
            m.batches_written += 1;
            m.lines_written += consumed as u64;
        }
        Ok(consumed)
    };

    // Step 3: build and write batch B0.
    if Instant::now() < deadline {
        let consumed = write_batch(engine, &mut builder, &mut metrics, &mut detailed)?;
        if consumed > 0 {
            in_flight.push_back(consumed);
        }
    }

    // Step 4: alternate writing the next batch ahead of reading the current one.
    while !in_flight.is_empty() && Instant::now() < deadline {
        if builder.remaining() > 0 {
            let consumed = write_batch(engine, &mut builder, &mut metrics, &mut detailed)?;
            if consumed > 0 {
                in_flight.push_back(consumed);
            }
        }

        let want = *in_flight.front().expect("in_flight non-empty");
        let stdout = engine.stdout_mut().ok_or(DriverError::EngineGone)?;
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::ReadBegin, want as f64);
        }
        for _ in 0..want {
            match read_one_line(stdout, recv_buf).map_err(|_| DriverError::EngineGone)? {
                Some(line) => {
                    let score = parse_score_line(&line).ok_or(DriverError::EngineGone)?;
                    scores.push(score);
                    if let Some(m) = metrics.as_deref_mut() {
                        m.lines_read += 1;
                    }
                }
                None => return Err(DriverError::EngineGone),
            }
        }
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::ReadEnd, want as f64);
        }
        in_flight.pop_front();
    }

    let truncated = scores.len() < total_items;
    if truncated {
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::DeadlineReached, scores.len() as f64);
        }
        debug!(target: "scoring.scheduler", scored = scores.len(), total_items, "blocking predict truncated by deadline");
    }
    // Anything this call wrote but did not read back becomes the next
    // call's residual.
    let pending: usize = in_flight.iter().sum();
    *residual += pending;
    trace!(target: "scoring.scheduler", pending_residual = pending, "blocking scheduler call complete");

    Ok(ScoreBatch::new(scores, truncated))
}
