//! Map stack errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapError {
    /// The backend is temporarily unable to answer; the caller must retry
    /// the whole higher-level operation later.
    #[error("transient lookup failure in {map}: {reason}")]
    Transient { map: String, reason: String },

    /// A map specification failed to parse.
    #[error("bad map specification {spec:?}: {reason}")]
    Syntax { spec: String, reason: String },

    /// The map does not implement the requested operation.
    #[error("map {0} does not support this operation")]
    Unsupported(String),
}

impl MapError {
    pub fn transient(map: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Transient {
            map: map.into(),
            reason: reason.into(),
        }
    }

    pub fn syntax(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Syntax {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying later could succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}
