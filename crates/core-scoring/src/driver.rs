//! Driver (§6.1) — the public facade tying an [`EngineHandle`], a caller's
//! [`Formatter`], and a scheduler together, plus the cross-call bookkeeping
//! (`recv_buf`, residual count) the residual-drain protocol needs (§4.5,
//! §5 ordering guarantee).

use std::io::Write;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::audit::{parse_audit_line, AuditRecord};
use crate::config::SchedulerConfig;
use crate::engine::{EngineHandle, OpenOptions};
use crate::error::{DriverError, DriverResult};
use crate::formatter::Formatter;
use crate::metrics::{DetailedMetrics, Metrics};
use crate::scheduler::{blocking, ScoreBatch};

#[cfg(unix)]
use crate::engine::nonblocking as engine_nonblocking;
#[cfg(unix)]
use crate::scheduler::nonblocking as scheduler_nonblocking;

/// Which scheduling strategy a [`Driver`] uses for `predict` (§4.4 vs §4.5).
/// Fixed at construction — switching mid-lifetime is not supported, matching
/// how `audit_mode` is likewise fixed at construction (§9 Open Question).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    /// Buffered write-one-batch-ahead loop (§4.4). Highest throughput.
    Blocking,
    /// Readiness-polling loop (§4.5). Bounded tail latency. Unix-only.
    #[cfg(unix)]
    NonBlocking,
}

/// Ties an engine, a formatter, and a scheduler together behind the public
/// `predict`/`train`/`explain_vw_line` surface (§6.1).
///
/// Not `Sync`/safe for concurrent calls by design (§5): one `predict` call
/// borrows the engine and the cross-call buffers exclusively via `&mut self`.
pub struct Driver<C, I, F: Formatter<C, I>> {
    engine: EngineHandle,
    formatter: F,
    kind: SchedulerKind,
    config: SchedulerConfig,
    recv_buf: Vec<u8>,
    residual: usize,
    _marker: std::marker::PhantomData<(C, I)>,
}

impl<C, I, F: Formatter<C, I>> Driver<C, I, F> {
    /// Spawns the scoring engine and wraps it with `formatter` and `kind`.
    /// `write_only` forces `kind = Blocking` regardless of what was
    /// requested, since `train` is a blocking-only path (§6.1).
    pub fn spawn(
        command: &str,
        args: &[String],
        formatter: F,
        kind: SchedulerKind,
        write_only: bool,
        audit_mode: bool,
        config: SchedulerConfig,
    ) -> DriverResult<Self> {
        let options = OpenOptions::new()
            .write_only(write_only)
            .audit_mode(audit_mode);
        let engine = EngineHandle::spawn(
            command,
            args,
            options,
            config.stderr_ring_capacity,
            config.close_grace_period,
        )?;

        // `explain_vw_line` always does single-byte blocking reads regardless
        // of `kind` (§6.1), so an audit-mode handle must keep blocking stdio
        // even when `kind == NonBlocking` — the non-blocking path is never
        // reached for it, since `predict`/`train` reject audit-mode handles.
        #[cfg(unix)]
        if matches!(kind, SchedulerKind::NonBlocking) && !audit_mode {
            if let Some(stdin) = engine.stdin_ref() {
                engine_nonblocking::set_stdin_nonblocking(stdin, true)?;
            }
            if let Some(stdout) = engine.stdout_ref() {
                engine_nonblocking::set_stdout_nonblocking(stdout, true)?;
            }
        }

        Ok(Self {
            engine,
            formatter,
            kind,
            config,
            recv_buf: Vec::new(),
            residual: 0,
            _marker: std::marker::PhantomData,
        })
    }

    /// Number of score lines still owed to this driver from a previous
    /// deadline-truncated call (§4.5 residual-drain protocol; §8 invariant 5).
    pub fn engine_owes_us(&self) -> usize {
        self.residual
    }

    pub fn is_alive(&mut self) -> bool {
        self.engine.is_alive()
    }

    pub fn poisoned(&self) -> bool {
        self.engine.poisoned()
    }

    /// Produces as many scores for `items` as fit within `timeout` (§6.1).
    /// `timeout = 0` yields only what residual drain already had on hand.
    pub fn predict(
        &mut self,
        ctx: &C,
        items: &[I],
        timeout: Duration,
        mut metrics: Option<&mut Metrics>,
        mut detailed_metrics: Option<&mut DetailedMetrics>,
    ) -> DriverResult<ScoreBatch> {
        if self.engine.options().audit_mode {
            return Err(DriverError::AuditModeActive);
        }
        let start = Instant::now();
        let deadline = start + timeout;

        let result = match self.kind {
            SchedulerKind::Blocking => blocking::run(
                &mut self.engine,
                &self.formatter,
                ctx,
                items,
                deadline,
                &self.config,
                &mut self.recv_buf,
                &mut self.residual,
                metrics.as_deref_mut(),
                detailed_metrics.as_deref_mut(),
            ),
            #[cfg(unix)]
            SchedulerKind::NonBlocking => scheduler_nonblocking::run(
                &mut self.engine,
                &self.formatter,
                ctx,
                items,
                deadline,
                &self.config,
                &mut self.recv_buf,
                &mut self.residual,
                metrics.as_deref_mut(),
                detailed_metrics.as_deref_mut(),
            ),
        };

        if let Some(m) = metrics {
            m.elapsed_ns = start.elapsed().as_nanos() as u64;
        }
        if matches!(result, Err(DriverError::EngineGone)) {
            self.engine.poison();
        }
        result
    }

    /// Trains against the engine, blocking-path only (§6.1: "Out of core
    /// scope; named here only because the handle is shared"). `labels`, when
    /// present, are interleaved by the formatter's own `item` output — the
    /// driver does not define the label grammar. No scores are read back
    /// when the handle is `write_only`.
    pub fn train(&mut self, ctx: &C, items: &[I], timeout: Duration) -> DriverResult<()> {
        if self.engine.options().audit_mode {
            return Err(DriverError::AuditModeActive);
        }
        if !matches!(self.kind, SchedulerKind::Blocking) {
            return Err(DriverError::BadInput("train requires a blocking driver"));
        }
        let deadline = Instant::now() + timeout;
        let write_only = self.engine.options().write_only;
        if write_only {
            let mut builder = crate::batch::BatchBuilder::new(&self.formatter, ctx, items)
                .map_err(|source| DriverError::FormatError {
                    item_index: usize::MAX,
                    source,
                })?;
            while builder.remaining() > 0 && Instant::now() < deadline {
                let (buf, _) =
                    builder.next_batch(&self.formatter, ctx, self.config.batch_size, None);
                let stdin = self.engine.stdin_mut().ok_or(DriverError::EngineGone)?;
                stdin.write_all(&buf).map_err(|_| DriverError::EngineGone)?;
                stdin.flush().map_err(|_| DriverError::EngineGone)?;
            }
            Ok(())
        } else {
            // Training with a readable handle still reads back one score per
            // line; reuse the blocking scheduler and discard the scores.
            blocking::run(
                &mut self.engine,
                &self.formatter,
                ctx,
                items,
                deadline,
                &self.config,
                &mut self.recv_buf,
                &mut self.residual,
                None,
                None,
            )
            .map(|_| ())
        }
    }

    /// Writes one formatted line and reads back its audit-mode explanation
    /// (§6.1). Only valid on handles opened with `audit_mode`.
    pub fn explain_vw_line(&mut self, ctx: &C, item: &I) -> DriverResult<AuditRecord> {
        if !self.engine.options().audit_mode {
            return Err(DriverError::AuditModeInactive);
        }
        if !self.engine.is_alive() || self.engine.poisoned() {
            return Err(DriverError::EngineGone);
        }

        let common = self
            .formatter
            .common(ctx)
            .map_err(|source| DriverError::FormatError {
                item_index: usize::MAX,
                source,
            })?;
        let suffix = self
            .formatter
            .item(ctx, item)
            .map_err(|source| DriverError::FormatError {
                item_index: 0,
                source,
            })?;

        let stdin = self.engine.stdin_mut().ok_or(DriverError::EngineGone)?;
        stdin
            .write_all(format!("{common}{suffix}\n").as_bytes())
            .map_err(|_| DriverError::EngineGone)?;
        stdin.flush().map_err(|_| DriverError::EngineGone)?;

        let stdout = self.engine.stdout_mut().ok_or(DriverError::EngineGone)?;
        let line = read_one_audit_line(stdout).map_err(|_| DriverError::EngineGone)?;
        debug!(target: "scoring.audit", bytes = line.len(), "read audit line");
        parse_audit_line(&line)
    }

    pub fn close(&mut self) -> std::io::Result<()> {
        self.engine.close()
    }
}

fn read_one_audit_line(stdout: &mut std::process::ChildStdout) -> std::io::Result<String> {
    use std::io::Read;
    let mut byte = [0u8; 1];
    let mut line = Vec::new();
    loop {
        let n = stdout.read(&mut byte)?;
        if n == 0 {
            if line.is_empty() {
                return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "engine closed stdout"));
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&line).into_owned())
}
