//! Control channel errors, split so callers can pick an exit class.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControlError {
    /// The server is unreachable or stopped answering; worth retrying.
    #[error("control service unavailable: {0}")]
    Unavailable(String),

    /// The server answered with an error for this request.
    #[error("{0}")]
    Rejected(String),

    /// Wire-format trouble.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl ControlError {
    /// Whether a retry later could help.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
