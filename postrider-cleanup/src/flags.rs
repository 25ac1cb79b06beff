//! Cumulative cleanup error bits.

use std::fmt;

/// Everything that went wrong while processing one message.
///
/// Bits accumulate as records are processed; the disposition is derived
/// from the full mask once, at end of input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupFlags(u32);

const NAMES: &[(CleanupFlags, &str)] = &[
    (CleanupFlags::BAD, "bad-record"),
    (CleanupFlags::WRITE, "write-error"),
    (CleanupFlags::SIZE_LIMIT, "size-exceeded"),
    (CleanupFlags::HEADER_LIMIT, "header-overflow"),
    (CleanupFlags::CONTENT_REJECT, "content-rejected"),
    (CleanupFlags::HOLD, "hold-requested"),
    (CleanupFlags::DISCARD, "discard-requested"),
];

impl CleanupFlags {
    pub const NONE: Self = Self(0);
    /// Malformed or out-of-place record.
    pub const BAD: Self = Self(1);
    /// Queue file write failure.
    pub const WRITE: Self = Self(1 << 1);
    /// Message exceeds the configured size limit.
    pub const SIZE_LIMIT: Self = Self(1 << 2);
    /// Header block exceeds the configured limit.
    pub const HEADER_LIMIT: Self = Self(1 << 3);
    /// A content inspector rejected the message.
    pub const CONTENT_REJECT: Self = Self(1 << 4);
    /// An inspector asked for quarantine.
    pub const HOLD: Self = Self(1 << 5);
    /// An inspector asked for a silent discard.
    pub const DISCARD: Self = Self(1 << 6);

    /// Bits that turn the message into a bounce.
    pub const BOUNCE_CLASS: Self =
        Self(Self::BAD.0 | Self::SIZE_LIMIT.0 | Self::HEADER_LIMIT.0 | Self::CONTENT_REJECT.0);

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }
}

impl fmt::Display for CleanupFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("clean");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_and_display() {
        let mut flags = CleanupFlags::NONE;
        flags.insert(CleanupFlags::BAD);
        flags.insert(CleanupFlags::SIZE_LIMIT);
        assert_eq!(flags.to_string(), "bad-record|size-exceeded");
        assert!(flags.intersects(CleanupFlags::BOUNCE_CLASS));
        assert!(!flags.contains(CleanupFlags::WRITE));
    }

    #[test]
    fn hold_and_discard_are_not_bounce_class() {
        assert!(!CleanupFlags::HOLD.intersects(CleanupFlags::BOUNCE_CLASS));
        assert!(!CleanupFlags::DISCARD.intersects(CleanupFlags::BOUNCE_CLASS));
    }
}
