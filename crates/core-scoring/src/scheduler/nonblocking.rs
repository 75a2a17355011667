//! Non-blocking scheduler (§4.5) — THE CENTERPIECE.
//!
//! Runs stdin/stdout non-blocking and schedules work via level-triggered
//! `poll()` with a timeout bounded by the remaining deadline, so no single
//! syscall can ever wait longer than `poll_slice` past it (§8 invariant 2).
//! Unix-only, matching §9's platform note.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use rustix::event::{poll, PollFd, PollFlags, Timespec};
use tracing::{debug, trace};

use crate::batch::BatchBuilder;
use crate::config::SchedulerConfig;
use crate::engine::EngineHandle;
use crate::error::{DriverError, DriverResult};
use crate::formatter::Formatter;
use crate::metrics::{DetailedMetrics, EventKind, Metrics};
use crate::scheduler::{parse_score_line, ScoreBatch};

/// Extracts complete newline-terminated lines from the front of `recv_buf`,
/// feeding each to `on_line`. Leaves a trailing partial line (if any) in
/// `recv_buf` for the next read.
fn drain_complete_lines(recv_buf: &mut Vec<u8>, mut on_line: impl FnMut(&str)) {
    loop {
        let Some(pos) = recv_buf.iter().position(|&b| b == b'\n') else {
            break;
        };
        let line: Vec<u8> = recv_buf.drain(..=pos).collect();
        let line = &line[..line.len() - 1];
        on_line(&String::from_utf8_lossy(line));
    }
}

/// One non-blocking read attempt: reads everything currently available into
/// `recv_buf`. Returns `Ok(true)` if EOF was observed (stdout closed).
fn read_available(stdout: &mut std::process::ChildStdout, recv_buf: &mut Vec<u8>) -> DriverResult<bool> {
    let mut chunk = [0u8; 16 * 1024];
    loop {
        match stdout.read(&mut chunk) {
            Ok(0) => return Ok(true),
            Ok(n) => recv_buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(_) => return Err(DriverError::EngineGone),
        }
    }
}

/// One non-blocking write attempt: writes as much of `send_buf` as the
/// kernel accepts right now. Returns the number of bytes written.
fn write_available(stdin: &mut std::process::ChildStdin, send_buf: &[u8]) -> DriverResult<usize> {
    match stdin.write(send_buf) {
        Ok(n) => Ok(n),
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
        Err(e) if e.kind() == ErrorKind::BrokenPipe => Err(DriverError::EngineGone),
        Err(_) => Err(DriverError::EngineGone),
    }
}

/// Converts a bounded wait duration into the nanosecond-precision timeout
/// `rustix::event::poll` expects. `poll_slice`-bounded durations are always
/// well within `i64::MAX` seconds, so the truncating casts are lossless here.
fn duration_to_timespec(d: Duration) -> Timespec {
    Timespec {
        tv_sec: d.as_secs() as _,
        tv_nsec: d.subsec_nanos() as _,
    }
}

fn poll_wait(
    stdin: &std::process::ChildStdin,
    stdout: &std::process::ChildStdout,
    want_write: bool,
    timeout: &Timespec,
) -> DriverResult<(bool, bool)> {
    let mut fds = Vec::with_capacity(2);
    fds.push(PollFd::new(stdout, PollFlags::IN));
    if want_write {
        fds.push(PollFd::new(stdin, PollFlags::OUT));
    }
    poll(&mut fds, Some(timeout)).map_err(|_| DriverError::EngineGone)?;
    let readable = fds[0].revents().contains(PollFlags::IN);
    let writable = want_write && fds.len() > 1 && fds[1].revents().contains(PollFlags::OUT);
    Ok((readable, writable))
}

/// Remaining budget until `deadline`, capped at `poll_slice` and converted to
/// the `Timespec` `poll_wait` needs — the single conversion point so no
/// syscall site has to juggle `Duration` vs. the rustix timeout type.
fn remaining(deadline: Instant, poll_slice: Duration) -> Option<Timespec> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    Some(duration_to_timespec((deadline - now).min(poll_slice)))
}

/// Drains `*residual` previously-owed score lines before any new work is
/// submitted (§4.5 residual-drain protocol). If the deadline expires before
/// the residual is fully drained, normal work for this call's own items is
/// skipped entirely — this is the documented source of a call legitimately
/// yielding zero scores (§4.5, §8 scenario S4).
fn drain_residual(
    engine: &mut EngineHandle,
    recv_buf: &mut Vec<u8>,
    residual: &mut usize,
    deadline: Instant,
    poll_slice: Duration,
    mut metrics: Option<&mut Metrics>,
) -> DriverResult<()> {
    while *residual > 0 {
        let Some(timeout) = remaining(deadline, poll_slice) else {
            break;
        };
        let (stdin, stdout) = engine.stdio_mut().ok_or(DriverError::EngineGone)?;
        let (readable, _) = poll_wait(stdin, stdout, false, &timeout)?;
        if let Some(m) = metrics.as_deref_mut() {
            m.poll_calls += 1;
        }
        if !readable {
            continue;
        }
        let eof = read_available(stdout, recv_buf)?;
        let mut drained_now = 0usize;
        drain_complete_lines(recv_buf, |line| {
            if *residual > drained_now && parse_score_line(line).is_some() {
                drained_now += 1;
            }
        });
        *residual = residual.saturating_sub(drained_now);
        if let Some(m) = metrics.as_deref_mut() {
            m.residual_lines_drained += drained_now as u64;
            m.lines_read += drained_now as u64;
        }
        if eof && *residual > 0 {
            return Err(DriverError::EngineGone);
        }
    }
    Ok(())
}

/// Runs the tick loop of §4.5 for `items`, returning as many scores as fit
/// before `deadline`.
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

    drain_residual(
        engine,
        recv_buf,
        residual,
        deadline,
        config.poll_slice,
        metrics.as_deref_mut(),
    )?;

    let total_items = items.len();
    if Instant::now() >= deadline {
        debug!(target: "scoring.scheduler", "deadline reached during residual drain; no new items attempted");
        return Ok(ScoreBatch::new(Vec::new(), total_items > 0));
    }

    let mut builder = BatchBuilder::new(formatter, ctx, items).map_err(|source| {
        DriverError::FormatError {
            item_index: usize::MAX,
            source,
        }
    })?;

    let mut send_buf: Vec<u8> = Vec::new();
    let mut items_formatted = 0usize;
    let mut items_written = 0usize;
    let mut items_read = 0usize;
    let mut scores: Vec<Option<f64>> = vec![None; total_items];

    loop {
        if Instant::now() >= deadline {
            if let Some(d) = detailed.as_deref_mut() {
                d.record(EventKind::DeadlineReached, items_read as f64);
            }
            break;
        }
        if items_read == total_items {
            break;
        }

        if send_buf.is_empty() && items_formatted < total_items {
            if let Some(d) = detailed.as_deref_mut() {
                d.record(EventKind::FormatBegin, 0.0);
            }
            let (buf, consumed) = builder.next_batch_bounded_bytes(
                formatter,
                ctx,
                config.slab_size,
                metrics.as_deref_mut(),
            );
            items_formatted += consumed;
            send_buf = buf;
            if let Some(d) = detailed.as_deref_mut() {
                d.record(EventKind::FormatEnd, consumed as f64);
            }
        }

        let want_write = !send_buf.is_empty();
        let Some(timeout) = remaining(deadline, config.poll_slice) else {
            break;
        };

        let (stdin, stdout) = engine.stdio_mut().ok_or(DriverError::EngineGone)?;
        let (readable, writable) = poll_wait(stdin, stdout, want_write, &timeout)?;
        if let Some(m) = metrics.as_deref_mut() {
            m.poll_calls += 1;
        }
        if let Some(d) = detailed.as_deref_mut() {
            d.record(EventKind::PollReturn, 0.0);
        }

        if readable {
            if let Some(d) = detailed.as_deref_mut() {
                d.record(EventKind::ReadBegin, 0.0);
            }
            let eof = read_available(stdout, recv_buf)?;
            let mut just_read = 0usize;
            drain_complete_lines(recv_buf, |line| {
                if items_read + just_read < items_written {
                    if let Some(score) = parse_score_line(line) {
                        scores[items_read + just_read] = Some(score);
                        just_read += 1;
                    }
                }
            });
            items_read += just_read;
            if let Some(m) = metrics.as_deref_mut() {
                m.lines_read += just_read as u64;
            }
            if let Some(d) = detailed.as_deref_mut() {
                d.record(EventKind::ReadEnd, just_read as f64);
            }
            if eof && items_read < items_written {
                engine.poison();
                return Err(DriverError::EngineGone);
            }
        }

        if writable && !send_buf.is_empty() {
            if let Some(d) = detailed.as_deref_mut() {
                d.record(EventKind::WriteBegin, send_buf.len() as f64);
            }
            let stdin = engine.stdin_mut().ok_or(DriverError::EngineGone)?;
            let n = write_available(stdin, &send_buf)?;
            let lines_completed = send_buf[..n].iter().filter(|&&b| b == b'\n').count();
            send_buf.drain(..n);
            items_written += lines_completed;
            if let Some(m) = metrics.as_deref_mut() {
                m.lines_written += lines_completed as u64;
                if lines_completed > 0 {
                    m.batches_written += 1;
                }
            }
            if let Some(d) = detailed.as_deref_mut() {
                d.record(EventKind::WriteEnd, lines_completed as f64);
            }
        }
    }

    debug_assert!(items_read <= items_written);
    debug_assert!(items_written <= items_formatted);
    debug_assert!(items_formatted <= total_items);

    let unread = items_written.saturating_sub(items_read);
    *residual += unread;
    if unread > 0 {
        trace!(target: "scoring.scheduler", unread, "carrying unread lines forward as residual");
    }

    let final_scores: Vec<f64> = scores.into_iter().take(items_read).flatten().collect();
    let truncated = final_scores.len() < total_items;
    Ok(ScoreBatch::new(final_scores, truncated))
}
