//! Engine handle (§4.1) — spawns/terminates the scoring child and owns its
//! stdin/stdout/stderr descriptors and process lifetime.
//!
//! Spawn-and-drain shape grounded on
//! `examples/Alb-O-xeno/crates/broker/broker/src/launcher.rs`'s
//! `ProcessLauncher` (piped stdio, `stdin.take()`/`stdout.take()`, stderr
//! handled separately). RAII spawn/close-on-`Drop` grounded on
//! `core_terminal::CrosstermBackend`'s enter/leave-on-`Drop` pattern. The
//! background stderr drain thread is grounded on
//! `examples/Alb-O-xeno/crates/api/src/terminal_ipc.rs`'s `TerminalIpc`
//! (background thread + bounded channel, drained on poll).

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::{DriverError, DriverResult};

/// Construction-time mode flags (§4.1, §9).
///
/// `write_only` and `audit_mode` are mutually exclusive; `EngineHandle::open`
/// rejects a configuration that sets both (Open Question §9, resolved as a
/// hard construction-time error rather than a runtime one).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenOptions {
    pub write_only: bool,
    pub audit_mode: bool,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn write_only(mut self, enabled: bool) -> Self {
        self.write_only = enabled;
        self
    }

    #[must_use]
    pub fn audit_mode(mut self, enabled: bool) -> Self {
        self.audit_mode = enabled;
        self
    }
}

/// Bounded ring buffer draining the engine's stderr so it never blocks
/// writing diagnostics (§4.1, §5). Shared between the owning `EngineHandle`
/// and its background drain thread.
struct StderrRing {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl StderrRing {
    fn new(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        for &b in bytes {
            if self.buf.len() == self.capacity {
                self.buf.pop_front();
            }
            self.buf.push_back(b);
        }
    }

    fn snapshot(&self) -> Vec<u8> {
        self.buf.iter().copied().collect()
    }
}

/// Owns the scoring child process and its stdio. Borrowed by a scheduler for
/// the duration of one `predict`/`train`/`explain_vw_line` call.
pub struct EngineHandle {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    options: OpenOptions,
    poisoned: bool,
    stderr_ring: Arc<Mutex<StderrRing>>,
    stderr_thread: Option<JoinHandle<()>>,
    close_grace_period: Duration,
}

impl EngineHandle {
    /// Spawns the scoring child with three anonymous pipes and begins
    /// draining stderr in the background. Fails if `write_only` and
    /// `audit_mode` are both set, or if the child cannot be spawned.
    pub fn spawn(
        command: &str,
        args: &[String],
        options: OpenOptions,
        stderr_ring_capacity: usize,
        close_grace_period: Duration,
    ) -> DriverResult<Self> {
        if options.write_only && options.audit_mode {
            return Err(DriverError::BadInput(
                "write_only and audit_mode are mutually exclusive",
            ));
        }

        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_ring = Arc::new(Mutex::new(StderrRing::new(stderr_ring_capacity)));
        let stderr_thread = stderr.map(|mut pipe| {
            let ring = Arc::clone(&stderr_ring);
            thread::spawn(move || {
                let mut chunk = [0u8; 4096];
                loop {
                    match pipe.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Ok(mut ring) = ring.lock() {
                                ring.push(&chunk[..n]);
                            }
                        }
                        Err(err) => {
                            debug!(target: "scoring.engine", %err, "stderr drain thread stopping");
                            break;
                        }
                    }
                }
            })
        });

        Ok(Self {
            child,
            stdin,
            stdout,
            options,
            poisoned: false,
            stderr_ring,
            stderr_thread,
            close_grace_period,
        })
    }

    pub fn options(&self) -> OpenOptions {
        self.options
    }

    /// Checks process liveness without blocking. Does not poison the handle
    /// by itself — callers decide whether a dead child is fatal for their
    /// current operation.
    pub fn is_alive(&mut self) -> bool {
        if self.poisoned {
            return false;
        }
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => false,
        }
    }

    pub fn poisoned(&self) -> bool {
        self.poisoned
    }

    /// Marks the handle permanently unusable. Every later call against this
    /// handle must fail fast with `DriverError::EngineGone` (§7).
    pub fn poison(&mut self) {
        if !self.poisoned {
            warn!(target: "scoring.engine", "engine handle poisoned");
        }
        self.poisoned = true;
    }

    pub fn stdin_mut(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn stdout_mut(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    pub fn stdin_ref(&self) -> Option<&ChildStdin> {
        self.stdin.as_ref()
    }

    pub fn stdout_ref(&self) -> Option<&ChildStdout> {
        self.stdout.as_ref()
    }

    /// Borrows stdin and stdout simultaneously. Needed by the non-blocking
    /// scheduler, which polls and drives both descriptors in the same tick;
    /// splitting two `Option` fields this way needs no unsafe code.
    pub fn stdio_mut(&mut self) -> Option<(&mut ChildStdin, &mut ChildStdout)> {
        match (self.stdin.as_mut(), self.stdout.as_mut()) {
            (Some(stdin), Some(stdout)) => Some((stdin, stdout)),
            _ => None,
        }
    }

    /// Snapshot of the most recent bytes the engine wrote to stderr,
    /// bounded by `stderr_ring_capacity`, for diagnostics.
    pub fn stderr_tail(&self) -> Vec<u8> {
        self.stderr_ring
            .lock()
            .map(|ring| ring.snapshot())
            .unwrap_or_default()
    }

    /// Closes stdin (signals EOF to the engine), waits bounded time for
    /// exit, then force-terminates. Idempotent-ish: safe to call once;
    /// `Drop` performs the same sequence defensively if this was skipped.
    pub fn close(&mut self) -> std::io::Result<()> {
        drop(self.stdin.take());
        let deadline = Instant::now() + self.close_grace_period;
        loop {
            match self.child.try_wait()? {
                Some(_) => break,
                None if Instant::now() >= deadline => {
                    self.child.kill()?;
                    self.child.wait()?;
                    break;
                }
                None => thread::sleep(Duration::from_millis(5)),
            }
        }
        if let Some(handle) = self.stderr_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(unix)]
pub(crate) mod nonblocking {
    use super::{ChildStdin, ChildStdout};
    use rustix::fd::{AsFd, BorrowedFd};
    use rustix::io::Errno;
    use std::io;

    /// Places a pipe endpoint's fd into (or out of) non-blocking mode
    /// (§4.1: "both stdin and stdout are placed in non-blocking descriptor
    /// mode" when operating in non-blocking mode).
    pub fn set_nonblocking<F: AsFd>(fd: &F, enable: bool) -> io::Result<()> {
        let borrowed: BorrowedFd<'_> = fd.as_fd();
        let mut flags = rustix::fs::fcntl_getfl(borrowed).map_err(to_io_error)?;
        flags.set(rustix::fs::OFlags::NONBLOCK, enable);
        rustix::fs::fcntl_setfl(borrowed, flags).map_err(to_io_error)
    }

    pub fn set_stdin_nonblocking(stdin: &ChildStdin, enable: bool) -> io::Result<()> {
        set_nonblocking(stdin, enable)
    }

    pub fn set_stdout_nonblocking(stdout: &ChildStdout, enable: bool) -> io::Result<()> {
        set_nonblocking(stdout, enable)
    }

    fn to_io_error(errno: Errno) -> io::Error {
        io::Error::from_raw_os_error(errno.raw_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_write_only_and_audit_mode_together() {
        let opts = OpenOptions::new().write_only(true).audit_mode(true);
        let err = EngineHandle::spawn("cat", &[], opts, 1024, Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, DriverError::BadInput(_)));
    }

    #[test]
    fn spawns_and_closes_a_real_child() {
        let opts = OpenOptions::new();
        let mut handle =
            EngineHandle::spawn("cat", &[], opts, 1024, Duration::from_millis(200)).unwrap();
        assert!(handle.is_alive());
        handle.close().unwrap();
        assert!(!handle.is_alive());
    }

    #[test]
    fn poison_marks_handle_dead() {
        let opts = OpenOptions::new();
        let mut handle =
            EngineHandle::spawn("cat", &[], opts, 1024, Duration::from_millis(200)).unwrap();
        handle.poison();
        assert!(handle.poisoned());
        assert!(!handle.is_alive());
    }
}
