//! Delivery status notification types (RFC 3463 status codes, RFC 3464
//! action codes).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// An RFC 3463 enhanced status code, e.g. `4.4.1` or `5.1.1`.
///
/// Only the class digit is interpreted by the queue manager; the subject and
/// detail fields are carried through to notifications verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DsnStatus(String);

impl DsnStatus {
    /// Parse and validate a `class.subject.detail` status string.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut fields = text.split('.');
        let class = fields.next().unwrap_or("");
        let ok = matches!(class, "2" | "4" | "5")
            && fields.clone().count() == 2
            && fields.all(|f| !f.is_empty() && f.len() <= 3 && f.bytes().all(|b| b.is_ascii_digit()));
        if ok {
            Ok(Self(text.to_string()))
        } else {
            Err(ParseError::new(format!("malformed DSN status: {text:?}")))
        }
    }

    /// Status class: 2 (success), 4 (transient), or 5 (permanent).
    #[must_use]
    pub fn class(&self) -> u8 {
        self.0.as_bytes()[0] - b'0'
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.class() == 4
    }

    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.class() == 5
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DsnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// RFC 3464 action field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DsnAction {
    Delivered,
    Delayed,
    Failed,
    Relayed,
    Expanded,
}

impl DsnAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Delayed => "delayed",
            Self::Failed => "failed",
            Self::Relayed => "relayed",
            Self::Expanded => "expanded",
        }
    }

    pub fn parse(text: &str) -> Result<Self, ParseError> {
        match text {
            "delivered" => Ok(Self::Delivered),
            "delayed" => Ok(Self::Delayed),
            "failed" => Ok(Self::Failed),
            "relayed" => Ok(Self::Relayed),
            "expanded" => Ok(Self::Expanded),
            other => Err(ParseError::new(format!("unknown DSN action: {other:?}"))),
        }
    }
}

impl fmt::Display for DsnAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A per-recipient delivery status record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dsn {
    pub status: DsnStatus,
    pub action: DsnAction,
    /// Free-text reason shown in notifications and logs.
    pub reason: String,
    /// Diagnostic code type, usually `smtp`.
    pub diag_type: Option<String>,
    /// Diagnostic text, usually the remote server reply.
    pub diag_text: Option<String>,
    /// Name of the MTA that produced this status.
    pub mta: Option<String>,
}

impl Dsn {
    pub fn new(status: DsnStatus, action: DsnAction, reason: impl Into<String>) -> Self {
        Self {
            status,
            action,
            reason: reason.into(),
            diag_type: None,
            diag_text: None,
            mta: None,
        }
    }

    /// A transient 4.x.x status with the delayed action.
    pub fn deferred(status: &str, reason: impl Into<String>) -> Self {
        Self::new(
            DsnStatus::parse(status).unwrap_or_else(|_| DsnStatus("4.0.0".to_string())),
            DsnAction::Delayed,
            reason,
        )
    }

    /// A permanent 5.x.x status with the failed action.
    pub fn bounced(status: &str, reason: impl Into<String>) -> Self {
        Self::new(
            DsnStatus::parse(status).unwrap_or_else(|_| DsnStatus("5.0.0".to_string())),
            DsnAction::Failed,
            reason,
        )
    }

    /// A 2.0.0 delivered status.
    pub fn delivered(reason: impl Into<String>) -> Self {
        Self::new(DsnStatus("2.0.0".to_string()), DsnAction::Delivered, reason)
    }

    #[must_use]
    pub fn with_diagnostic(mut self, diag_type: &str, diag_text: &str) -> Self {
        self.diag_type = Some(diag_type.to_string());
        self.diag_text = Some(diag_text.to_string());
        self
    }

    #[must_use]
    pub fn with_mta(mut self, mta: &str) -> Self {
        self.mta = Some(mta.to_string());
        self
    }
}

impl fmt::Display for Dsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.status, self.action, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_statuses_parse() {
        for text in ["2.0.0", "4.4.1", "5.1.1", "5.999.0"] {
            assert!(DsnStatus::parse(text).is_ok(), "{text} should parse");
        }
    }

    #[test]
    fn invalid_statuses_are_rejected() {
        for text in ["", "3.0.0", "5.0", "5.0.0.0", "5.x.0", "5..1"] {
            assert!(DsnStatus::parse(text).is_err(), "{text} should not parse");
        }
    }

    #[test]
    fn class_queries() {
        assert!(DsnStatus::parse("4.2.2").unwrap().is_transient());
        assert!(DsnStatus::parse("5.1.1").unwrap().is_permanent());
        assert!(!DsnStatus::parse("2.0.0").unwrap().is_transient());
    }

    #[test]
    fn helper_constructors_pick_actions() {
        assert_eq!(Dsn::deferred("4.4.1", "timeout").action, DsnAction::Delayed);
        assert_eq!(Dsn::bounced("5.1.1", "no such user").action, DsnAction::Failed);
        assert_eq!(Dsn::delivered("ok").status.class(), 2);
    }
}
