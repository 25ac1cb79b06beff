//! Content inspection hook (milter-style).
//!
//! An inspector sees each header and body line during the MESSAGE state and
//! may accept, reject, quarantine, discard, or substitute a header. A
//! replaced header is applied before any further rewriting of that header.

/// Verdict for one inspected item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InspectAction {
    Accept,
    /// Bounce the message with this status and reason.
    Reject { status: String, reason: String },
    /// Park the message in the hold queue.
    Quarantine,
    /// Drop the message without notification.
    Discard,
    /// Use this value instead of the submitted one.
    ReplaceHeader { value: String },
}

/// Hook point invoked from the cleanup MESSAGE state.
pub trait Inspector: Send + Sync + std::fmt::Debug {
    /// Inspect one header; `name` excludes the colon.
    fn header(&self, _name: &str, _value: &str) -> InspectAction {
        InspectAction::Accept
    }

    /// Inspect one body line.
    fn body_line(&self, _line: &[u8]) -> InspectAction {
        InspectAction::Accept
    }

    /// Final verdict once the whole message has been seen.
    fn end_of_message(&self) -> InspectAction {
        InspectAction::Accept
    }
}

/// Inspector that accepts everything; the default.
#[derive(Debug, Default)]
pub struct AcceptAll;

impl Inspector for AcceptAll {}
