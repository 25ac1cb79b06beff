//! Queue file identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier naming one queue file across all queues.
///
/// A ULID: fixed-width, alphanumeric, lexicographically sortable by
/// creation time, and collision-resistant without coordination. The string
/// form appears in logs and bounce notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(ulid::Ulid);

impl QueueId {
    /// Generate a fresh identifier.
    #[must_use]
    pub fn generate() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Parse a queue id from a file name.
    ///
    /// Rejects anything that is not a bare ULID, which also rules out path
    /// separators and traversal patterns.
    #[must_use]
    pub fn from_file_name(name: &str) -> Option<Self> {
        ulid::Ulid::from_string(name).ok().map(Self)
    }

    /// Milliseconds since the Unix epoch encoded in the id.
    #[must_use]
    pub const fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for QueueId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for QueueId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ulid::Ulid::from_string(&s)
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}
