//! The fixed-width SIZE record.
//!
//! Written first as a placeholder and patched with the real totals when the
//! file is sealed. Fixed width keeps the patch exactly as long as the
//! placeholder, so every later record offset survives the rewrite.

use postrider_common::SendOpts;

use crate::SpoolError;

/// Width of one numeric field in the SIZE payload.
const FIELD_WIDTH: usize = 15;
/// Six space-separated fields.
pub const SIZE_PAYLOAD_LEN: usize = 6 * FIELD_WIDTH + 5;

/// Queue-manager options persisted with the message.
pub mod qmgr_opts {
    /// Defer all deliveries; the message entered the hold queue on request.
    pub const DEFER: u64 = 1;
    /// A bounce logfile exists for this message.
    pub const BOUNCE: u64 = 1 << 1;
}

/// Decoded SIZE record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeRecord {
    /// Length of the message content segment in bytes.
    pub message_segment_len: u64,
    /// Offset of the first content record.
    pub data_offset: u64,
    /// Number of recipient records in the file.
    pub recipient_count: u64,
    /// Queue manager option flags.
    pub qmgr_opts: u64,
    /// Content length in bytes.
    pub content_length: u64,
    /// Per-message delivery options.
    pub sendopts: SendOpts,
}

impl SizeRecord {
    /// Encode as the fixed-width payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let fields = [
            self.message_segment_len,
            self.data_offset,
            self.recipient_count,
            self.qmgr_opts,
            self.content_length,
            u64::from(self.sendopts.bits()),
        ];
        let text = fields
            .iter()
            .map(|v| format!("{v:>FIELD_WIDTH$}"))
            .collect::<Vec<_>>()
            .join(" ");
        debug_assert_eq!(text.len(), SIZE_PAYLOAD_LEN);
        text.into_bytes()
    }

    /// Decode a SIZE payload, enforcing size-field consistency.
    pub fn decode(payload: &[u8]) -> Result<Self, SpoolError> {
        let text = std::str::from_utf8(payload)
            .map_err(|_| SpoolError::corrupt("non-UTF-8 SIZE record"))?;
        let mut fields = text.split_whitespace().map(|f| {
            f.parse::<u64>()
                .map_err(|_| SpoolError::corrupt(format!("bad SIZE field {f:?}")))
        });
        let mut next = || {
            fields
                .next()
                .unwrap_or_else(|| Err(SpoolError::corrupt("short SIZE record")))
        };

        let record = Self {
            message_segment_len: next()?,
            data_offset: next()?,
            recipient_count: next()?,
            qmgr_opts: next()?,
            content_length: next()?,
            sendopts: SendOpts::from_bits_truncate(
                u32::try_from(next()?)
                    .map_err(|_| SpoolError::corrupt("sendopts field overflow"))?,
            ),
        };
        if record.content_length > record.message_segment_len {
            return Err(SpoolError::corrupt(format!(
                "inconsistent sizes: content {} > segment {}",
                record.content_length, record.message_segment_len
            )));
        }
        Ok(record)
    }

    /// The all-zero placeholder written when the file is opened.
    #[must_use]
    pub fn placeholder() -> Vec<u8> {
        Self::default().encode()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn encode_is_fixed_width() {
        let small = SizeRecord::default().encode();
        let large = SizeRecord {
            message_segment_len: 999_999_999_999_999,
            data_offset: 123_456_789_012,
            recipient_count: 1_000_000,
            qmgr_opts: qmgr_opts::DEFER | qmgr_opts::BOUNCE,
            content_length: 999_999_999_999_999,
            sendopts: SendOpts::ALL,
        }
        .encode();
        assert_eq!(small.len(), SIZE_PAYLOAD_LEN);
        assert_eq!(large.len(), SIZE_PAYLOAD_LEN);
    }

    #[test]
    fn round_trip() {
        let record = SizeRecord {
            message_segment_len: 4096,
            data_offset: 120,
            recipient_count: 3,
            qmgr_opts: qmgr_opts::BOUNCE,
            content_length: 4000,
            sendopts: SendOpts::SMTPUTF8_REQUESTED,
        };
        assert_eq!(SizeRecord::decode(&record.encode()).unwrap(), record);
    }

    #[test]
    fn inconsistent_sizes_are_corrupt() {
        let record = SizeRecord {
            message_segment_len: 10,
            content_length: 20,
            ..SizeRecord::default()
        };
        assert!(SizeRecord::decode(&record.encode()).is_err());
    }
}
