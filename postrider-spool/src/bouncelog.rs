//! Per-message bounce and defer logfiles.
//!
//! Each message in trouble owns a logfile in the bounce or defer queue,
//! holding one attribute-encoded entry per recipient status. Appending a
//! status for a recipient that is already logged supersedes the older
//! entry; readers keep only the latest entry per recipient.

use std::io::Write;

use postrider_common::{
    Dsn, DsnAction, DsnStatus, NotifyFlags, Recipient,
    attr::AttrList,
};

use crate::{QueueDirs, QueueId, QueueName, SpoolError};

/// One logged per-recipient status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub recipient: Recipient,
    pub dsn: Dsn,
    /// Seconds since the epoch when the status was recorded.
    pub logged_at: i64,
}

impl LogEntry {
    fn to_attrs(&self) -> AttrList {
        let mut attrs = AttrList::new();
        attrs
            .set_str("recipient", self.recipient.addr.clone())
            .set_str("orig_recipient", self.recipient.orig_addr.clone())
            .set_int("offset", i64::try_from(self.recipient.offset).unwrap_or(0))
            .set_int("notify", i64::from(self.recipient.notify.bits()))
            .set_str("status", self.dsn.status.as_str())
            .set_str("action", self.dsn.action.as_str())
            .set_str("reason", self.dsn.reason.clone())
            .set_int("time", self.logged_at);
        if let (Some(dtype), Some(dtext)) = (&self.dsn.diag_type, &self.dsn.diag_text) {
            attrs.set_str("diag_type", dtype.clone());
            attrs.set_str("diag_text", dtext.clone());
        }
        if let Some(mta) = &self.dsn.mta {
            attrs.set_str("mta", mta.clone());
        }
        attrs
    }

    fn from_attrs(attrs: &AttrList) -> Result<Self, SpoolError> {
        let status = DsnStatus::parse(
            attrs
                .get_str("status")
                .map_err(|e| SpoolError::corrupt(e.to_string()))?,
        )
        .map_err(|e| SpoolError::corrupt(e.to_string()))?;
        let action = DsnAction::parse(
            attrs
                .get_str("action")
                .map_err(|e| SpoolError::corrupt(e.to_string()))?,
        )
        .map_err(|e| SpoolError::corrupt(e.to_string()))?;

        let mut dsn = Dsn::new(
            status,
            action,
            attrs.get_str("reason").unwrap_or_default().to_string(),
        );
        if let (Ok(dtype), Ok(dtext)) = (attrs.get_str("diag_type"), attrs.get_str("diag_text")) {
            dsn = dsn.with_diagnostic(dtype, dtext);
        }
        if let Ok(mta) = attrs.get_str("mta") {
            dsn = dsn.with_mta(mta);
        }

        let recipient = Recipient::new(
            attrs
                .get_int("offset")
                .ok()
                .and_then(|v| u64::try_from(v).ok())
                .unwrap_or(0),
            attrs.get_str("orig_recipient").unwrap_or_default(),
            attrs
                .get_str("recipient")
                .map_err(|e| SpoolError::corrupt(e.to_string()))?,
        )
        .with_notify(NotifyFlags::from_bits_truncate(
            attrs
                .get_int("notify")
                .ok()
                .and_then(|v| u8::try_from(v).ok())
                .unwrap_or(0),
        ));

        Ok(Self {
            recipient,
            dsn,
            logged_at: attrs.get_int("time").unwrap_or(0),
        })
    }
}

/// Operations on one message's logfile.
#[derive(Debug, Clone)]
pub struct BounceLog {
    dirs: QueueDirs,
    queue: QueueName,
    id: QueueId,
}

impl BounceLog {
    /// Handle on the bounce logfile of a message.
    #[must_use]
    pub fn bounce(dirs: QueueDirs, id: QueueId) -> Self {
        Self {
            dirs,
            queue: QueueName::Bounce,
            id,
        }
    }

    /// Handle on the defer logfile of a message.
    #[must_use]
    pub fn defer(dirs: QueueDirs, id: QueueId) -> Self {
        Self {
            dirs,
            queue: QueueName::Defer,
            id,
        }
    }

    /// Append one per-recipient status.
    ///
    /// With `sync` the entry is fsynced before this returns, so a
    /// subsequent queue move cannot outrun the log.
    pub fn append(&self, entry: &LogEntry, sync: bool) -> Result<(), SpoolError> {
        let path = self.dirs.ensure_parent(self.queue, self.id)?;
        let mut file = std::fs::File::options()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(entry.to_attrs().encode().as_bytes())?;
        if sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Read the log, keeping only the latest entry per recipient, in first
    /// appearance order.
    pub fn read(&self) -> Result<Vec<LogEntry>, SpoolError> {
        let path = self.dirs.path(self.queue, self.id);
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<LogEntry> = Vec::new();
        for chunk in text.split("\n\n").filter(|c| !c.trim().is_empty()) {
            let attrs =
                AttrList::decode(chunk).map_err(|e| SpoolError::corrupt(e.to_string()))?;
            let entry = LogEntry::from_attrs(&attrs)?;
            if let Some(existing) = entries
                .iter_mut()
                .find(|e| e.recipient.addr == entry.recipient.addr)
            {
                *existing = entry;
            } else {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    #[must_use]
    pub fn exists(&self) -> bool {
        self.dirs.path(self.queue, self.id).exists()
    }

    /// Remove the logfile once its message is finalized.
    pub fn remove(&self) -> Result<(), SpoolError> {
        match std::fs::remove_file(self.dirs.path(self.queue, self.id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
