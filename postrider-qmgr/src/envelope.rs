//! Parsed envelope of an active queue file.

use std::io::{Read, Seek};

use postrider_common::{NotifyFlags, Recipient, SendOpts};
use postrider_spool::{QueueId, RecordKind, RecordReader, SizeRecord, SpoolError};

/// The queue manager's in-memory view of one active message.
///
/// Built by scanning the envelope and extracted segments; content records
/// are skipped over, not loaded.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub id: QueueId,
    pub sender: String,
    /// Seconds since the epoch; retries keep the original arrival time for
    /// fairness.
    pub arrival: i64,
    /// Delayed-mail warning deadline; zero once the warning has been sent.
    pub warn_deadline: Option<i64>,
    /// Offset of the WARN record, for patching after a warning.
    pub warn_offset: Option<u64>,
    pub sendopts: SendOpts,
    pub size: SizeRecord,
    /// Recipients still awaiting a terminal state, in file order.
    pub pending: Vec<Recipient>,
    /// Count of recipients already marked DONE.
    pub completed: usize,
}

impl MessageEnvelope {
    /// Read and validate a queue file.
    ///
    /// Violations of the file invariants (SIZE first, exactly one MESG and
    /// one XTRA in order, END last) are corruption, not retryable errors.
    pub fn read<R: Read + Seek>(id: QueueId, file: R) -> Result<Self, SpoolError> {
        let mut reader = RecordReader::new(file)?;

        let mut sender = None;
        let mut arrival = None;
        let mut warn_deadline = None;
        let mut warn_offset = None;
        let mut size = None;
        let mut pending = Vec::new();
        let mut completed = 0usize;
        let mut pending_orig: Option<String> = None;
        let mut pending_notify = NotifyFlags::NONE;
        let mut mesg_seen = 0u32;
        let mut xtra_seen = 0u32;
        let mut end_seen = false;
        let mut first = true;

        while let Some(record) = reader.next_record()? {
            if end_seen {
                return Err(SpoolError::corrupt("records after END"));
            }
            if first {
                if record.kind != RecordKind::Size {
                    return Err(SpoolError::corrupt("first record is not SIZE"));
                }
                size = Some(SizeRecord::decode(&record.payload)?);
                first = false;
                continue;
            }
            match record.kind {
                RecordKind::Size => return Err(SpoolError::corrupt("duplicate SIZE record")),
                RecordKind::From => {
                    if sender.is_some() {
                        return Err(SpoolError::corrupt("duplicate FROM record"));
                    }
                    sender = Some(record.text()?.to_string());
                }
                RecordKind::Time => {
                    arrival = record.text()?.trim().parse::<i64>().ok();
                }
                RecordKind::Warn => {
                    warn_deadline = record.text()?.trim().parse::<i64>().ok();
                    warn_offset = Some(record.offset);
                }
                RecordKind::OrigRecipient => {
                    pending_orig = Some(record.text()?.to_string());
                }
                RecordKind::Recipient => {
                    if sender.is_none() {
                        return Err(SpoolError::corrupt("recipient precedes sender"));
                    }
                    let addr = record.text()?.to_string();
                    let orig = pending_orig.take().unwrap_or_else(|| addr.clone());
                    pending.push(
                        Recipient::new(record.offset, orig, addr)
                            .with_notify(std::mem::take(&mut pending_notify)),
                    );
                }
                RecordKind::Done => {
                    pending_orig = None;
                    completed += 1;
                }
                RecordKind::Mesg => {
                    mesg_seen += 1;
                    if xtra_seen > 0 {
                        return Err(SpoolError::corrupt("MESG after XTRA"));
                    }
                }
                RecordKind::Xtra => {
                    if mesg_seen == 0 {
                        return Err(SpoolError::corrupt("XTRA before MESG"));
                    }
                    xtra_seen += 1;
                }
                RecordKind::End => end_seen = true,
                RecordKind::Norm
                | RecordKind::Attr
                | RecordKind::Rrto
                | RecordKind::Erto
                | RecordKind::Pad => {}
            }
        }

        if !end_seen {
            return Err(SpoolError::corrupt("missing END record"));
        }
        if mesg_seen != 1 || xtra_seen != 1 {
            return Err(SpoolError::corrupt(format!(
                "expected one MESG and one XTRA, found {mesg_seen} and {xtra_seen}"
            )));
        }
        let size = size.ok_or_else(|| SpoolError::corrupt("missing SIZE record"))?;
        let sender = sender.ok_or_else(|| SpoolError::corrupt("missing FROM record"))?;
        let arrival = arrival.ok_or_else(|| SpoolError::corrupt("missing TIME record"))?;

        Ok(Self {
            id,
            sender,
            arrival,
            warn_deadline: warn_deadline.filter(|w| *w > 0),
            warn_offset,
            sendopts: size.sendopts,
            size,
            pending,
            completed,
        })
    }

    /// Whether every recipient has reached a terminal state.
    #[must_use]
    pub fn all_complete(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use postrider_spool::RecordWriter;
    use pretty_assertions::assert_eq;

    use super::*;

    fn build(records: &[(RecordKind, Vec<u8>)]) -> Cursor<Vec<u8>> {
        let mut writer = RecordWriter::new(Cursor::new(Vec::new()));
        for (kind, payload) in records {
            writer.append(*kind, payload).unwrap();
        }
        writer.into_inner()
    }

    fn well_formed() -> Vec<(RecordKind, Vec<u8>)> {
        vec![
            (RecordKind::Size, SizeRecord::default().encode()),
            (RecordKind::From, b"a@example.com".to_vec()),
            (RecordKind::Time, b"1700000000".to_vec()),
            (RecordKind::OrigRecipient, b"b+tag@example.com".to_vec()),
            (RecordKind::Recipient, b"b@example.com".to_vec()),
            (RecordKind::Mesg, Vec::new()),
            (RecordKind::Norm, b"Subject: x".to_vec()),
            (RecordKind::Xtra, Vec::new()),
            (RecordKind::End, Vec::new()),
        ]
    }

    #[test]
    fn parses_a_well_formed_file() {
        let env = MessageEnvelope::read(QueueId::generate(), build(&well_formed())).unwrap();
        assert_eq!(env.sender, "a@example.com");
        assert_eq!(env.arrival, 1_700_000_000);
        assert_eq!(env.pending.len(), 1);
        assert_eq!(env.pending[0].addr, "b@example.com");
        assert_eq!(env.pending[0].orig_addr, "b+tag@example.com");
        assert!(!env.all_complete());
    }

    #[test]
    fn missing_end_is_corrupt() {
        let mut records = well_formed();
        records.pop();
        let err = MessageEnvelope::read(QueueId::generate(), build(&records)).unwrap_err();
        assert!(matches!(err, SpoolError::Corrupt { .. }));
    }

    #[test]
    fn size_must_come_first() {
        let mut records = well_formed();
        records.swap(0, 1);
        let err = MessageEnvelope::read(QueueId::generate(), build(&records)).unwrap_err();
        assert!(matches!(err, SpoolError::Corrupt { .. }));
    }

    #[test]
    fn duplicate_size_is_corrupt() {
        let mut records = well_formed();
        records.insert(3, (RecordKind::Size, SizeRecord::default().encode()));
        let err = MessageEnvelope::read(QueueId::generate(), build(&records)).unwrap_err();
        assert!(matches!(err, SpoolError::Corrupt { .. }));
    }

    #[test]
    fn done_recipients_are_not_pending() {
        let mut records = well_formed();
        records[4].0 = RecordKind::Done;
        let env = MessageEnvelope::read(QueueId::generate(), build(&records)).unwrap();
        assert!(env.all_complete());
        assert_eq!(env.completed, 1);
    }

    #[test]
    fn recipient_before_sender_is_corrupt() {
        let records = vec![
            (RecordKind::Size, SizeRecord::default().encode()),
            (RecordKind::Recipient, b"b@example.com".to_vec()),
            (RecordKind::From, b"a@example.com".to_vec()),
            (RecordKind::Time, b"1700000000".to_vec()),
            (RecordKind::Mesg, Vec::new()),
            (RecordKind::Xtra, Vec::new()),
            (RecordKind::End, Vec::new()),
        ];
        let err = MessageEnvelope::read(QueueId::generate(), build(&records)).unwrap_err();
        assert!(matches!(err, SpoolError::Corrupt { .. }));
    }
}
