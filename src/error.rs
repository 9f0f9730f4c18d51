//! Error types for window selection and prompt packing.

use thiserror::Error;

/// Why a window could not be produced.
///
/// Every variant aborts the whole selection; no partial window is returned.
#[derive(Debug, Error)]
pub enum WindowError {
    /// Budget was zero or negative. Caller bug, never retried.
    #[error("token budget must be positive, got {0}")]
    InvalidBudget(i64),

    /// The token counter failed; its error is carried unchanged.
    #[error("token counter failed: {0}")]
    OracleFailure(#[source] anyhow::Error),

    /// The caller cancelled the operation before it finished.
    #[error("window selection cancelled")]
    Cancelled,
}

impl WindowError {
    /// Short machine-readable name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidBudget(_) => "invalid_budget",
            Self::OracleFailure(_) => "oracle_failure",
            Self::Cancelled => "cancelled",
        }
    }
}
