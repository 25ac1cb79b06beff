//! Per-message delivery option flags (SMTPUTF8, REQUIRETLS).
//!
//! The flags are persisted in the queue file SIZE record and forwarded in
//! every delivery request, so the numeric values must stay stable.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ParseError;

/// Bitmask of per-message delivery options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendOpts(u32);

/// Flag name table, single source for formatting and parsing.
const NAMES: &[(SendOpts, &str)] = &[
    (SendOpts::SMTPUTF8_REQUESTED, "smtputf8_requested"),
    (SendOpts::SMTPUTF8_HEADER, "smtputf8_header"),
    (SendOpts::SMTPUTF8_SENDER, "smtputf8_sender"),
    (SendOpts::SMTPUTF8_RECIPIENT, "smtputf8_recipient"),
    (SendOpts::REQUIRETLS_HEADER, "requiretls_header"),
    (SendOpts::REQUIRETLS_ESMTP, "requiretls_esmtp"),
];

impl SendOpts {
    pub const NONE: Self = Self(0);
    /// The client asked for SMTPUTF8 on submission.
    pub const SMTPUTF8_REQUESTED: Self = Self(1);
    /// A message header needs SMTPUTF8.
    pub const SMTPUTF8_HEADER: Self = Self(1 << 1);
    /// The envelope sender needs SMTPUTF8.
    pub const SMTPUTF8_SENDER: Self = Self(1 << 2);
    /// An envelope recipient needs SMTPUTF8; set per delivery request only.
    pub const SMTPUTF8_RECIPIENT: Self = Self(1 << 3);
    /// A `TLS-Required: no` header was present.
    pub const REQUIRETLS_HEADER: Self = Self(1 << 4);
    /// The client sent `MAIL FROM ... REQUIRETLS`.
    pub const REQUIRETLS_ESMTP: Self = Self(1 << 5);

    pub const SMTPUTF8_ALL: Self = Self(0b1111);
    pub const REQUIRETLS_ALL: Self = Self(Self::REQUIRETLS_HEADER.0 | Self::REQUIRETLS_ESMTP.0);
    /// Flags derived from message content rather than requested by a client.
    pub const DERIVED: Self = Self(
        (Self::SMTPUTF8_ALL.0 & !Self::SMTPUTF8_REQUESTED.0) | Self::REQUIRETLS_HEADER.0,
    );
    pub const ALL: Self = Self(Self::SMTPUTF8_ALL.0 | Self::REQUIRETLS_ALL.0);

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Reconstruct from persisted bits, dropping any unknown ones.
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL.0)
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub const fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Parse a delimiter-separated list of flag names, as produced by
    /// [`fmt::Display`].
    pub fn parse(text: &str, delim: char) -> Result<Self, ParseError> {
        let mut opts = Self::NONE;
        for word in text.split(delim).map(str::trim).filter(|w| !w.is_empty()) {
            let flag = NAMES
                .iter()
                .find(|(_, name)| word.eq_ignore_ascii_case(name))
                .map(|(flag, _)| *flag)
                .ok_or_else(|| ParseError::new(format!("unknown sendopts flag: {word}")))?;
            opts.insert(flag);
        }
        Ok(opts)
    }
}

impl fmt::Display for SendOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(*flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

impl std::ops::BitOr for SendOpts {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for SendOpts {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
