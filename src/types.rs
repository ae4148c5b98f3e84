//! Type-safe enums shared across the applier and verifier
//!
//! Exit-status classes of the convergence engine, the idempotence policy,
//! and the kinds of health checks.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumIter, EnumString};

/// Classified exit status of one convergence engine run.
///
/// Follows the engine's detailed exit codes: 0 no changes, 2 changes,
/// 4 failures, 6 changes and failures, 1 fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyExitCode {
    NoChanges,
    Changes,
    Failures,
    ChangesAndFailures,
    Fatal,
    /// Any other exit code
    Unrecognized(i32),
    /// Engine was terminated by a signal and produced no exit code
    Signaled,
}

impl ApplyExitCode {
    /// Exit code the engine uses for a fatal error
    pub const FATAL_SENTINEL: i32 = 1;

    /// Classify a raw process exit code.
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => Self::NoChanges,
            Some(2) => Self::Changes,
            Some(4) => Self::Failures,
            Some(6) => Self::ChangesAndFailures,
            Some(Self::FATAL_SENTINEL) => Self::Fatal,
            Some(other) => Self::Unrecognized(other),
            None => Self::Signaled,
        }
    }

    /// Raw exit code, if the engine produced one.
    pub fn code(self) -> Option<i32> {
        match self {
            Self::NoChanges => Some(0),
            Self::Changes => Some(2),
            Self::Failures => Some(4),
            Self::ChangesAndFailures => Some(6),
            Self::Fatal => Some(Self::FATAL_SENTINEL),
            Self::Unrecognized(code) => Some(code),
            Self::Signaled => None,
        }
    }

    /// A run without an exit code never completed, so it counts as fatal too.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Fatal | Self::Signaled)
    }

    /// True when the run reported nothing left to change.
    pub fn is_idempotent(self) -> bool {
        matches!(self, Self::NoChanges)
    }

    /// True when some resources failed to converge.
    pub fn has_failures(self) -> bool {
        matches!(self, Self::Failures | Self::ChangesAndFailures)
    }
}

impl fmt::Display for ApplyExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChanges => write!(f, "no changes (0)"),
            Self::Changes => write!(f, "changes applied (2)"),
            Self::Failures => write!(f, "failures (4)"),
            Self::ChangesAndFailures => write!(f, "changes and failures (6)"),
            Self::Fatal => write!(f, "fatal error (1)"),
            Self::Unrecognized(code) => write!(f, "unrecognized exit code ({})", code),
            Self::Signaled => write!(f, "terminated by signal"),
        }
    }
}

/// What the second application must report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IdempotencePolicy {
    /// Second run must report no changes (exit 0)
    #[default]
    Strict,
    /// Second run only needs to be non-fatal
    Lenient,
}

/// Kind of health check performed by the verifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CheckKind {
    /// TCP connect to a declared port
    TcpPort,
    /// Line-protocol write to the time-series database
    MetricWrite,
    /// Query for the written measurement
    MetricQuery,
    /// Data-source lookup on the dashboard application
    DatasourceLookup,
}
