//! Error kinds for the scoring driver.
//!
//! `EngineGone` is terminal: once a driver observes it, every later call on
//! that driver fails fast with the same variant (see `Driver::poisoned`).
//! `FormatError` is non-fatal under the skip-and-count policy (§4.3) and
//! only ever escapes from `explain_vw_line`/`train`, where there is no next
//! item to fall through to.

use std::io;

/// Errors a [`crate::Driver`] or its components can report.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The scoring engine child process died or closed a pipe unexpectedly.
    /// Poisons the owning driver: all later calls fail with this variant.
    #[error("scoring engine is gone")]
    EngineGone,

    /// The caller-supplied formatter failed while building a line.
    #[error("formatter failed for item {item_index}: {source}")]
    FormatError {
        item_index: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A scoring call was attempted on a handle opened with `audit_mode`.
    #[error("driver is in audit mode; scoring calls are unavailable")]
    AuditModeActive,

    /// An audit call was attempted on a handle not opened with `audit_mode`.
    #[error("driver is not in audit mode")]
    AuditModeInactive,

    /// The engine's audit-mode output line did not match the expected grammar.
    #[error("malformed audit line at column {column}: {line:?}")]
    AuditParseError { line: String, column: usize },

    /// A caller-supplied argument was invalid (negative timeout, closed driver, ...).
    #[error("bad input: {0}")]
    BadInput(&'static str),

    /// Lower-level I/O failure not otherwise classified as `EngineGone`
    /// (e.g. failure to spawn the child at all).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type DriverResult<T> = Result<T, DriverError>;
