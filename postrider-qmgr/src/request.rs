//! Delivery request protocol.
//!
//! The queue manager hands a delivery agent one message and a recipient
//! batch; the agent answers with one status per recipient. Requests and
//! replies travel as attribute lists over a local stream; unknown
//! attributes are ignored so either side can grow.

use postrider_common::{
    Dsn, NotifyFlags, Recipient, SendOpts,
    attr::AttrList,
    error::AttrError,
};
use postrider_spool::QueueId;

/// What an agent reports for one recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientVerdict {
    /// Delivered; mark the recipient done.
    Ok,
    /// Soft failure; the recipient stays queued and backs off.
    Defer,
    /// Hard failure; bounce the recipient.
    Bounce,
}

impl RecipientVerdict {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Defer => "defer",
            Self::Bounce => "bounce",
        }
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "ok" => Some(Self::Ok),
            "defer" => Some(Self::Defer),
            "bounce" => Some(Self::Bounce),
            _ => None,
        }
    }
}

/// Per-recipient result in a delivery reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientStatus {
    /// Byte offset of the recipient record, echoed from the request.
    pub offset: u64,
    pub addr: String,
    pub verdict: RecipientVerdict,
    pub dsn: Dsn,
}

/// One delivery hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub queue: String,
    pub queue_id: QueueId,
    /// Offset of the first content record; agents read the body region
    /// from here and touch nothing else in the file.
    pub data_offset: u64,
    pub sender: String,
    pub sendopts: SendOpts,
    /// Agent-specific target for this batch.
    pub nexthop: String,
    pub recipients: Vec<Recipient>,
}

/// The agent's answer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReply {
    pub statuses: Vec<RecipientStatus>,
}

impl DeliveryRequest {
    #[must_use]
    pub fn to_attrs(&self) -> AttrList {
        let mut attrs = AttrList::new();
        attrs
            .set_str("queue", self.queue.clone())
            .set_str("queue_id", self.queue_id.to_string())
            .set_int("data_offset", i64::try_from(self.data_offset).unwrap_or(0))
            .set_str("sender", self.sender.clone())
            .set_int("sendopts", i64::from(self.sendopts.bits()))
            .set_str("nexthop", self.nexthop.clone());
        for rcpt in &self.recipients {
            attrs.set_hash(
                "rcpt",
                vec![
                    ("offset".to_string(), rcpt.offset.to_string()),
                    ("orig".to_string(), rcpt.orig_addr.clone()),
                    ("addr".to_string(), rcpt.addr.clone()),
                    ("notify".to_string(), rcpt.notify.bits().to_string()),
                ],
            );
        }
        attrs
    }

    pub fn from_attrs(attrs: &AttrList) -> Result<Self, AttrError> {
        let queue_id = attrs.get_str("queue_id")?;
        let queue_id = QueueId::from_file_name(queue_id).ok_or(AttrError::BadValue {
            name: "queue_id".to_string(),
            expected: "queue id",
            value: queue_id.to_string(),
        })?;

        let mut recipients = Vec::new();
        for hash in attrs.get_hashes("rcpt") {
            let field = |name: &str| {
                hash.iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str())
            };
            let addr = field("addr").unwrap_or_default().to_string();
            let offset = field("offset").and_then(|v| v.parse().ok()).unwrap_or(0);
            let notify = field("notify")
                .and_then(|v| v.parse::<u8>().ok())
                .map_or(NotifyFlags::NONE, NotifyFlags::from_bits_truncate);
            recipients.push(
                Recipient::new(offset, field("orig").unwrap_or(&addr), addr.clone())
                    .with_notify(notify),
            );
        }

        Ok(Self {
            queue: attrs.get_str("queue")?.to_string(),
            queue_id,
            data_offset: u64::try_from(attrs.get_int("data_offset")?).unwrap_or(0),
            sender: attrs.get_str("sender")?.to_string(),
            sendopts: SendOpts::from_bits_truncate(
                u32::try_from(attrs.get_int("sendopts")?).unwrap_or(0),
            ),
            nexthop: attrs.get_str("nexthop")?.to_string(),
            recipients,
        })
    }
}

impl DeliveryReply {
    #[must_use]
    pub fn to_attrs(&self) -> AttrList {
        let mut attrs = AttrList::new();
        for status in &self.statuses {
            let mut entries = vec![
                ("offset".to_string(), status.offset.to_string()),
                ("addr".to_string(), status.addr.clone()),
                ("verdict".to_string(), status.verdict.as_str().to_string()),
                ("status".to_string(), status.dsn.status.as_str().to_string()),
                ("action".to_string(), status.dsn.action.as_str().to_string()),
                ("reason".to_string(), status.dsn.reason.clone()),
            ];
            if let (Some(dtype), Some(dtext)) = (&status.dsn.diag_type, &status.dsn.diag_text) {
                entries.push(("diag_type".to_string(), dtype.clone()));
                entries.push(("diag_text".to_string(), dtext.clone()));
            }
            if let Some(mta) = &status.dsn.mta {
                entries.push(("mta".to_string(), mta.clone()));
            }
            attrs.set_hash("status", entries);
        }
        attrs
    }

    pub fn from_attrs(attrs: &AttrList) -> Result<Self, AttrError> {
        let mut statuses = Vec::new();
        for hash in attrs.get_hashes("status") {
            let field = |name: &str| {
                hash.iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str())
            };
            let verdict = field("verdict")
                .and_then(RecipientVerdict::parse)
                .ok_or(AttrError::Missing("verdict"))?;
            let status_text = field("status").unwrap_or("4.0.0");
            let action = field("action").unwrap_or(match verdict {
                RecipientVerdict::Ok => "delivered",
                RecipientVerdict::Defer => "delayed",
                RecipientVerdict::Bounce => "failed",
            });
            let mut dsn = Dsn::new(
                postrider_common::DsnStatus::parse(status_text).map_err(|_| {
                    AttrError::BadValue {
                        name: "status".to_string(),
                        expected: "DSN status",
                        value: status_text.to_string(),
                    }
                })?,
                postrider_common::DsnAction::parse(action).map_err(|_| AttrError::BadValue {
                    name: "action".to_string(),
                    expected: "DSN action",
                    value: action.to_string(),
                })?,
                field("reason").unwrap_or_default(),
            );
            if let (Some(dtype), Some(dtext)) = (field("diag_type"), field("diag_text")) {
                dsn = dsn.with_diagnostic(dtype, dtext);
            }
            if let Some(mta) = field("mta") {
                dsn = dsn.with_mta(mta);
            }
            statuses.push(RecipientStatus {
                offset: field("offset").and_then(|v| v.parse().ok()).unwrap_or(0),
                addr: field("addr").unwrap_or_default().to_string(),
                verdict,
                dsn,
            });
        }
        Ok(Self { statuses })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn request_round_trip() {
        let request = DeliveryRequest {
            queue: "active".to_string(),
            queue_id: QueueId::generate(),
            data_offset: 512,
            sender: "a@example.com".to_string(),
            sendopts: SendOpts::SMTPUTF8_REQUESTED,
            nexthop: "mx.example.net".to_string(),
            recipients: vec![
                Recipient::new(100, "b+x@example.net", "b@example.net"),
                Recipient::new(160, "c@example.net", "c@example.net")
                    .with_notify(NotifyFlags::NEVER),
            ],
        };
        let decoded =
            DeliveryRequest::from_attrs(&AttrList::decode(&request.to_attrs().encode()).unwrap())
                .unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn empty_nexthop_survives_the_wire() {
        let request = DeliveryRequest {
            queue: "active".to_string(),
            queue_id: QueueId::generate(),
            data_offset: 0,
            sender: String::new(),
            sendopts: SendOpts::NONE,
            nexthop: String::new(),
            recipients: vec![Recipient::new(10, "u", "u@local")],
        };
        let decoded =
            DeliveryRequest::from_attrs(&AttrList::decode(&request.to_attrs().encode()).unwrap())
                .unwrap();
        assert_eq!(decoded.nexthop, "");
        assert_eq!(decoded.sender, "");
    }

    #[test]
    fn reply_round_trip() {
        let reply = DeliveryReply {
            statuses: vec![
                RecipientStatus {
                    offset: 100,
                    addr: "b@example.net".to_string(),
                    verdict: RecipientVerdict::Ok,
                    dsn: Dsn::delivered("250 ok"),
                },
                RecipientStatus {
                    offset: 160,
                    addr: "c@example.net".to_string(),
                    verdict: RecipientVerdict::Bounce,
                    dsn: Dsn::bounced("5.1.1", "no such user")
                        .with_diagnostic("smtp", "550 5.1.1 unknown")
                        .with_mta("mx.example.net"),
                },
            ],
        };
        let decoded =
            DeliveryReply::from_attrs(&AttrList::decode(&reply.to_attrs().encode()).unwrap())
                .unwrap();
        assert_eq!(decoded, reply);
    }

    #[test]
    fn unknown_attributes_are_ignored() {
        let text = "queue:active\nqueue_id:01ARZ3NDEKTSV4RRFFQ69G5FAV\ndata_offset:0\n\
                    sender:s@x\nsendopts:0\nnexthop:mx\nfuture_field:whatever\n\n";
        let decoded = DeliveryRequest::from_attrs(&AttrList::decode(text).unwrap()).unwrap();
        assert_eq!(decoded.queue, "active");
        assert!(decoded.recipients.is_empty());
    }
}
