//! Error types shared across the postrider crates.

use thiserror::Error;

/// Errors produced by the attribute codec.
#[derive(Debug, Error)]
pub enum AttrError {
    /// The peer closed the stream mid-request.
    #[error("unexpected end of attribute stream")]
    UnexpectedEof,

    /// A line did not contain a `name:value` separator.
    #[error("malformed attribute line: {0:?}")]
    MalformedLine(String),

    /// An attribute value failed to parse as the requested type.
    #[error("attribute {name} is not a valid {expected}: {value:?}")]
    BadValue {
        name: String,
        expected: &'static str,
        value: String,
    },

    /// A required attribute was absent from the request.
    #[error("missing attribute: {0}")]
    Missing(&'static str),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by the trigger layer.
#[derive(Debug, Error)]
pub enum TriggerError {
    /// Nobody is listening on the trigger endpoint.
    #[error("trigger endpoint unavailable: {0}")]
    Unavailable(std::io::Error),

    /// The send did not complete within the deadline.
    #[error("trigger send timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from parsing configuration fragments (known ports, sendopts names).
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
