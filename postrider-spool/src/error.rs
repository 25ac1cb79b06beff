//! Spool errors.

use thiserror::Error;

use crate::QueueId;

#[derive(Debug, Error)]
pub enum SpoolError {
    /// Transient I/O failure; the file stays where it is and the operation
    /// is retried on a later scan.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Structural damage; the file belongs in the corrupt queue.
    #[error("corrupt queue file: {reason}")]
    Corrupt { reason: String },

    /// Someone else holds the lock.
    #[error("queue file is locked by another process")]
    Locked,

    /// No such queue file.
    #[error("queue file not found: {0}")]
    NotFound(QueueId),

    /// A record patch would not fit in the space of the old record.
    #[error("record patch too large: {new} > {old} bytes")]
    PatchTooLarge { old: usize, new: usize },
}

impl SpoolError {
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }

    /// Whether the failure is worth retrying later.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Locked)
    }
}
