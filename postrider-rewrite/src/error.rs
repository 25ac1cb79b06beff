//! Rewriter and resolver errors.

use postrider_maps::MapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The address cannot be parsed at all.
    #[error("malformed address: {0:?}")]
    Malformed(String),

    /// A table backend failed transiently; the caller retries the whole
    /// operation later rather than acting on a guessed answer.
    #[error("temporary table failure, try again: {0}")]
    TryAgain(#[from] MapError),
}

impl ResolveError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TryAgain(_))
    }
}
