//! Envelope recipient as carried between cleanup, the queue manager, and
//! delivery agents.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// RFC 3461 NOTIFY parameter flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotifyFlags(u8);

const NOTIFY_NAMES: &[(NotifyFlags, &str)] = &[
    (NotifyFlags::NEVER, "never"),
    (NotifyFlags::SUCCESS, "success"),
    (NotifyFlags::FAILURE, "failure"),
    (NotifyFlags::DELAY, "delay"),
];

impl NotifyFlags {
    /// Unset: apply the default policy (notify on failure and delay).
    pub const NONE: Self = Self(0);
    pub const NEVER: Self = Self(1);
    pub const SUCCESS: Self = Self(1 << 1);
    pub const FAILURE: Self = Self(1 << 2);
    pub const DELAY: Self = Self(1 << 3);

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b1111)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether a failure notification is wanted for this recipient.
    #[must_use]
    pub const fn wants_failure(self) -> bool {
        self.is_empty() || (self.0 & Self::FAILURE.0 != 0)
    }

    /// Whether a delay warning is wanted for this recipient.
    #[must_use]
    pub const fn wants_delay(self) -> bool {
        self.is_empty() || (self.0 & Self::DELAY.0 != 0)
    }

    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut flags = Self::NONE;
        for word in text.split(',').map(str::trim).filter(|w| !w.is_empty()) {
            let flag = NOTIFY_NAMES
                .iter()
                .find(|(_, name)| word.eq_ignore_ascii_case(name))
                .map(|(flag, _)| *flag)
                .ok_or_else(|| ParseError::new(format!("unknown NOTIFY keyword: {word}")))?;
            flags = Self(flags.0 | flag.0);
        }
        Ok(flags)
    }
}

impl fmt::Display for NotifyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (flag, name) in NOTIFY_NAMES {
            if self.contains(*flag) {
                if !first {
                    f.write_str(",")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One envelope recipient.
///
/// `offset` is the byte position of this recipient's record in the queue
/// file; the queue manager overwrites that record with a DONE marker once
/// the recipient reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub offset: u64,
    /// Address as originally submitted, before rewriting and expansion.
    pub orig_addr: String,
    /// Canonical address after rewriting.
    pub addr: String,
    pub notify: NotifyFlags,
}

impl Recipient {
    pub fn new(offset: u64, orig_addr: impl Into<String>, addr: impl Into<String>) -> Self {
        Self {
            offset,
            orig_addr: orig_addr.into(),
            addr: addr.into(),
            notify: NotifyFlags::NONE,
        }
    }

    #[must_use]
    pub const fn with_notify(mut self, notify: NotifyFlags) -> Self {
        self.notify = notify;
        self
    }

    /// Domain part of the canonical address, when present.
    #[must_use]
    pub fn domain(&self) -> Option<&str> {
        self.addr.rsplit_once('@').map(|(_, domain)| domain)
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn notify_round_trip() {
        let flags = NotifyFlags::parse("failure, delay").unwrap();
        assert_eq!(flags.to_string(), "failure,delay");
        assert!(flags.wants_failure());
        assert!(flags.wants_delay());
        assert!(!flags.contains(NotifyFlags::SUCCESS));
    }

    #[test]
    fn unset_notify_defaults_to_failure_and_delay() {
        let flags = NotifyFlags::NONE;
        assert!(flags.wants_failure());
        assert!(flags.wants_delay());
    }

    #[test]
    fn never_suppresses_nothing_else() {
        let flags = NotifyFlags::parse("never").unwrap();
        assert!(!flags.wants_failure());
        assert!(!flags.wants_delay());
    }

    #[test]
    fn recipient_domain_extraction() {
        let rcpt = Recipient::new(0, "user+tag@example.com", "user@example.com");
        assert_eq!(rcpt.domain(), Some("example.com"));

        let local = Recipient::new(0, "user", "user");
        assert_eq!(local.domain(), None);
    }
}
