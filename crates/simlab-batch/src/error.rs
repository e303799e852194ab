use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Severity assigned to a scenario failure by the classifier at the
/// executor boundary. The batch continues across all of these; only
/// `High` surfaces a visible warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }
}

/// Error raised by a single run. Everything except `Fatal` is caught
/// at the run boundary and recorded; `Fatal` propagates and halts the
/// batch.
#[derive(Debug, Error)]
pub enum RunError {
    /// Upstream rate-limit signal, detected structurally at the
    /// executor boundary (never by message sniffing). Handled by
    /// backoff; not a run failure if a later retry succeeds.
    #[error("rate_limited: upstream rate limit hit")]
    RateLimited { retry_after: Option<Duration> },

    /// A scenario-level failure during one run.
    #[error("scenario_failed ({}): {message}", .severity.as_str())]
    Scenario { severity: Severity, message: String },

    /// Unrecoverable batch-level error. The only class allowed past
    /// the per-run boundary.
    #[error("fatal_batch_error: {0}")]
    Fatal(String),

    #[error("io_error: {0}")]
    Io(#[from] std::io::Error),
}

impl RunError {
    pub fn fatal(message: impl Into<String>) -> Self {
        RunError::Fatal(message.into())
    }

    pub fn scenario(severity: Severity, message: impl Into<String>) -> Self {
        RunError::Scenario {
            severity,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RunError::Fatal(_))
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RunError::RateLimited { .. })
    }

    /// Severity used when recording this error as a run failure.
    /// I/O errors at the run boundary count as medium.
    pub fn severity(&self) -> Severity {
        match self {
            RunError::Scenario { severity, .. } => *severity,
            RunError::Io(_) => Severity::Medium,
            RunError::RateLimited { .. } => Severity::Low,
            RunError::Fatal(_) => Severity::High,
        }
    }
}
