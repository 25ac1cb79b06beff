//! The cleanup state machine.
//!
//! ```text
//! OPEN -> ENVELOPE -> MESSAGE -> EXTRACTED -> CLOSE
//!                        |
//!                     (errors accumulate; disposition decided at END)
//! ```
//!
//! Records stream in one at a time; each dispatches on its type within the
//! current state. Out-of-place records mark the message bad but the input
//! keeps draining, so a misbehaving client cannot wedge the pipeline.

use std::{
    fs::File,
    io::Seek,
    path::PathBuf,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use postrider_common::{
    Dsn, DupFilter, NotifyFlags, Params, Recipient, SendOpts,
};
use postrider_maps::SharedMap;
use postrider_rewrite::{CanonKind, Rewriter};
use postrider_spool::{
    BounceLog, LogEntry, QueueDirs, QueueId, QueueName, RecordKind, RecordWriter, SizeRecord,
    SpoolError,
    size::qmgr_opts,
};
use tracing::{debug, info, warn};

use crate::{
    CleanupError, CleanupFlags,
    inspect::{InspectAction, Inspector},
    notify,
};

/// Maps and hooks that parameterize one cleanup instance.
#[derive(Debug, Default)]
pub struct CleanupConfig {
    /// Virtual alias maps applied 1-to-n to every recipient.
    pub virtual_aliases: Vec<SharedMap>,
    /// Content inspector invoked during the MESSAGE state.
    pub inspector: Option<Arc<dyn Inspector>>,
}

/// Final fate of a cleaned-up message.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Sealed and moved to the incoming queue; trigger the queue manager.
    Enqueued(QueueId),
    /// Parked in the hold queue on inspector request.
    Held(QueueId),
    /// Dropped without a trace on inspector request.
    Discarded,
    /// All recipients bounced; a notification was enqueued unless the
    /// sender was the null or double-bounce address.
    Bounced { notification: Option<QueueId> },
    /// Structurally unusable; parked in the corrupt queue.
    Corrupt(QueueId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Envelope,
    Message,
    Extracted,
    Close,
}

/// Hard ceiling on alias expansion work per recipient.
const MAX_EXPANSIONS: usize = 1000;

/// One message flowing through cleanup.
#[derive(Debug)]
pub struct Cleanup {
    params: Arc<Params>,
    rewriter: Arc<Rewriter>,
    config: CleanupConfig,
    dirs: QueueDirs,

    id: QueueId,
    work_path: PathBuf,
    writer: RecordWriter<File>,
    state: State,
    flags: CleanupFlags,
    /// Inspector- or limit-supplied bounce status and reason.
    reject: Option<(String, String)>,

    sender: Option<String>,
    arrival: Option<i64>,
    warn_deadline: Option<i64>,
    sendopts: SendOpts,
    recipients: Vec<Recipient>,
    /// Recipients already bounced during cleanup (expansion loops).
    precompleted: usize,
    first_recipient: Option<String>,
    pending_orig: Option<String>,
    pending_notify: NotifyFlags,
    dup_filter: DupFilter,

    data_offset: u64,
    xtra_offset: u64,
    content_length: u64,
    in_headers: bool,
    header_bytes: usize,
    return_receipt: Option<String>,
    errors_to: Option<String>,
    /// Internally generated mail (notifications) is never size-limited;
    /// limiting it would make the bounce of an oversized message bounce.
    size_exempt: bool,

    finished: bool,
}

impl Cleanup {
    /// Open a fresh queue file in the working area and enter the envelope
    /// state. The SIZE placeholder goes first so it can be patched when the
    /// file is sealed.
    pub fn open(
        params: Arc<Params>,
        rewriter: Arc<Rewriter>,
        config: CleanupConfig,
        dirs: QueueDirs,
    ) -> Result<Self, CleanupError> {
        let id = QueueId::generate();
        let final_path = dirs.ensure_parent(QueueName::Incoming, id)?;
        let mut work_path = final_path.into_os_string();
        work_path.push(".tmp");
        let work_path = PathBuf::from(work_path);

        let file = File::options()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&work_path)
            .map_err(SpoolError::from)?;
        let mut writer = RecordWriter::new(file);
        writer.append(RecordKind::Size, &SizeRecord::placeholder())?;

        let dup_limit = params.duplicate_filter_limit;
        debug!(queue_id = %id, "cleanup open");
        Ok(Self {
            params,
            rewriter,
            config,
            dirs,
            id,
            work_path,
            writer,
            state: State::Envelope,
            flags: CleanupFlags::NONE,
            reject: None,
            sender: None,
            arrival: None,
            warn_deadline: None,
            sendopts: SendOpts::NONE,
            recipients: Vec::new(),
            precompleted: 0,
            first_recipient: None,
            pending_orig: None,
            pending_notify: NotifyFlags::NONE,
            dup_filter: DupFilter::new(dup_limit).with_fold_case(),
            data_offset: 0,
            xtra_offset: 0,
            content_length: 0,
            in_headers: true,
            header_bytes: 0,
            return_receipt: None,
            errors_to: None,
            size_exempt: false,
            finished: false,
        })
    }

    #[must_use]
    pub const fn queue_id(&self) -> QueueId {
        self.id
    }

    pub(crate) const fn exempt_from_size_limit(&mut self) {
        self.size_exempt = true;
    }

    #[must_use]
    pub const fn flags(&self) -> CleanupFlags {
        self.flags
    }

    /// Feed one record into the state machine.
    pub fn process(&mut self, kind: RecordKind, payload: &[u8]) -> Result<(), CleanupError> {
        match self.state {
            State::Envelope => self.envelope(kind, payload),
            State::Message => self.message(kind, payload),
            State::Extracted => self.extracted(kind, payload),
            State::Close => Err(CleanupError::Protocol(format!(
                "{:?} record after END",
                kind
            ))),
        }
    }

    fn bad_record(&mut self, kind: RecordKind, where_: &str) {
        warn!(queue_id = %self.id, kind = ?kind, "unexpected record in {where_}");
        self.flags.insert(CleanupFlags::BAD);
    }

    fn envelope(&mut self, kind: RecordKind, payload: &[u8]) -> Result<(), CleanupError> {
        if kind == RecordKind::Mesg {
            if self.sender.is_none() || self.arrival.is_none() {
                warn!(queue_id = %self.id, "missing sender or time envelope record");
                self.flags.insert(CleanupFlags::BAD);
                // Drain the rest of the input anyway.
            }
            if self.warn_deadline.is_none() && self.params.delay_warn_time_secs > 0 {
                let arrival = self.arrival.unwrap_or_else(now_secs);
                self.warn_deadline =
                    Some(arrival + i64::try_from(self.params.delay_warn_time_secs).unwrap_or(0));
            }
            if let Some(deadline) = self.warn_deadline {
                self.writer
                    .append(RecordKind::Warn, deadline.to_string().as_bytes())?;
            }
            self.writer.append(RecordKind::Mesg, b"")?;
            self.data_offset = self.writer.get_mut().stream_position().map_err(SpoolError::from)?;
            self.state = State::Message;
            return Ok(());
        }
        if !kind.is_envelope() {
            self.bad_record(kind, "envelope");
            return Ok(());
        }
        match kind {
            RecordKind::Time => {
                let text = String::from_utf8_lossy(payload);
                match text.trim().parse::<i64>() {
                    Ok(time) => {
                        self.arrival = Some(time);
                        self.writer.append(RecordKind::Time, payload)?;
                    }
                    Err(_) => self.flags.insert(CleanupFlags::BAD),
                }
            }
            RecordKind::From => {
                if self.sender.is_some() {
                    warn!(queue_id = %self.id, "duplicate sender envelope record");
                    self.flags.insert(CleanupFlags::BAD);
                    return Ok(());
                }
                let raw = String::from_utf8_lossy(payload);
                // The null sender stays null; replacing it would turn
                // bounces into loops.
                let clean = if raw.is_empty() {
                    String::new()
                } else {
                    match self.rewriter.canonicalize(&raw, CanonKind::Sender, false) {
                        Ok(rewritten) => rewritten.addr,
                        Err(e) if e.is_transient() => return Err(e.into()),
                        Err(e) => {
                            warn!(queue_id = %self.id, sender = %raw, error = %e, "bad sender address");
                            self.flags.insert(CleanupFlags::BAD);
                            return Ok(());
                        }
                    }
                };
                if !clean.is_ascii() {
                    self.sendopts.insert(SendOpts::SMTPUTF8_SENDER);
                }
                self.writer.append(RecordKind::From, clean.as_bytes())?;
                self.sender = Some(clean);
            }
            RecordKind::Recipient => {
                if self.sender.is_none() {
                    warn!(queue_id = %self.id, "envelope recipient precedes sender");
                    self.flags.insert(CleanupFlags::BAD);
                    return Ok(());
                }
                self.add_recipient(payload)?;
            }
            RecordKind::OrigRecipient => self.set_pending_orig(payload),
            RecordKind::Warn => {
                let text = String::from_utf8_lossy(payload);
                match text.trim().parse::<i64>() {
                    Ok(deadline) if deadline >= 0 => self.warn_deadline = Some(deadline),
                    _ => self.flags.insert(CleanupFlags::BAD),
                }
            }
            RecordKind::Attr => self.envelope_attr(payload)?,
            _ => self.bad_record(kind, "envelope"),
        }
        Ok(())
    }

    fn envelope_attr(&mut self, payload: &[u8]) -> Result<(), CleanupError> {
        let text = String::from_utf8_lossy(payload);
        if let Some((name, value)) = text.split_once('=') {
            match name {
                "sendopts" => match SendOpts::parse(value, '|') {
                    Ok(opts) => self.sendopts.insert(opts),
                    Err(_) => self.flags.insert(CleanupFlags::BAD),
                },
                "notify" => match NotifyFlags::parse(value) {
                    Ok(flags) => self.pending_notify = flags,
                    Err(_) => self.flags.insert(CleanupFlags::BAD),
                },
                _ => {}
            }
            self.writer.append(RecordKind::Attr, payload)?;
        } else {
            self.flags.insert(CleanupFlags::BAD);
        }
        Ok(())
    }

    fn set_pending_orig(&mut self, payload: &[u8]) {
        if self.pending_orig.is_some() {
            // A second original-recipient with no recipient in between is a
            // record-level error, not something to silently overwrite.
            warn!(queue_id = %self.id, "dangling original recipient record");
            self.flags.insert(CleanupFlags::BAD);
            return;
        }
        self.pending_orig = Some(String::from_utf8_lossy(payload).into_owned());
    }

    /// Canonicalize, expand aliases, and emit one submitted recipient.
    fn add_recipient(&mut self, payload: &[u8]) -> Result<(), CleanupError> {
        let raw = String::from_utf8_lossy(payload);
        let submitted = if raw.is_empty() {
            self.params.empty_address_recipient.clone()
        } else {
            raw.into_owned()
        };
        let orig = self.pending_orig.take().unwrap_or_else(|| submitted.clone());
        let notify = std::mem::take(&mut self.pending_notify);

        let clean = match self.rewriter.canonicalize(&submitted, CanonKind::Recipient, false) {
            Ok(rewritten) => rewritten.addr,
            Err(e) if e.is_transient() => return Err(e.into()),
            Err(e) => {
                // Unparseable address: flag the message, keep draining.
                warn!(queue_id = %self.id, recipient = %submitted, error = %e, "bad recipient address");
                self.flags.insert(CleanupFlags::BAD);
                return Ok(());
            }
        };

        let (expanded, looped) = self.expand_aliases(&clean)?;
        for addr in expanded {
            self.emit_recipient(&orig, &addr, notify, None)?;
        }
        for addr in looped {
            let dsn = Dsn::bounced("5.4.6", "mail forwarding loop detected");
            self.emit_recipient(&orig, &addr, notify, Some(dsn))?;
        }
        Ok(())
    }

    /// Expand one address through the virtual alias maps.
    ///
    /// Returns the terminal addresses and any addresses cut off by the loop
    /// detector. The per-message duplicate filter spans all expansions, so
    /// the same mailbox is reached at most once per message.
    fn expand_aliases(&mut self, addr: &str) -> Result<(Vec<String>, Vec<String>), CleanupError> {
        let mut terminal = Vec::new();
        let mut looped = Vec::new();
        let mut queue = vec![addr.to_string()];
        let mut budget = MAX_EXPANSIONS;

        while let Some(current) = queue.pop() {
            if budget == 0 {
                warn!(queue_id = %self.id, addr = %current, "alias expansion budget exhausted");
                looped.push(current);
                continue;
            }
            budget -= 1;

            let mut hit = None;
            for map in &self.config.virtual_aliases {
                if let Some(value) = map.lookup(&current)? {
                    hit = Some(value);
                    break;
                }
                // Fall back to the bare local part for local addresses.
                if let Some((local, domain)) = current.rsplit_once('@') {
                    if self.params.is_local_domain(domain) {
                        if let Some(value) = map.lookup(local)? {
                            hit = Some(value);
                            break;
                        }
                    }
                }
            }

            match hit {
                Some(targets) => {
                    if !self.dup_filter.check_and_insert(&current) {
                        // Already expanded on this message: a forwarding loop.
                        looped.push(current);
                        continue;
                    }
                    for target in targets.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                        let clean = self
                            .rewriter
                            .canonicalize(target, CanonKind::Recipient, false)?
                            .addr;
                        queue.push(clean);
                    }
                }
                None => {
                    if self.dup_filter.check_and_insert(&current) {
                        terminal.push(current);
                    }
                    // A duplicate terminal address is dropped silently; the
                    // first occurrence already owns the delivery.
                }
            }
        }
        Ok((terminal, looped))
    }

    /// Write the ORCP/RCPT record pair; a pre-resolved bounce marks the
    /// recipient done immediately and logs its DSN.
    fn emit_recipient(
        &mut self,
        orig: &str,
        addr: &str,
        notify: NotifyFlags,
        bounce: Option<Dsn>,
    ) -> Result<(), CleanupError> {
        self.writer.append(RecordKind::OrigRecipient, orig.as_bytes())?;
        let offset = self.writer.append(RecordKind::Recipient, addr.as_bytes())?;
        let recipient = Recipient::new(offset, orig, addr).with_notify(notify);

        if let Some(dsn) = bounce {
            info!(queue_id = %self.id, recipient = %addr, status = %dsn.status, "recipient bounced during cleanup");
            BounceLog::bounce(self.dirs.clone(), self.id).append(
                &LogEntry {
                    recipient: recipient.clone(),
                    dsn,
                    logged_at: now_secs(),
                },
                self.params.sync_updates,
            )?;
            self.writer.overwrite_kind(offset, RecordKind::Done)?;
            self.precompleted += 1;
        }
        if self.first_recipient.is_none() {
            self.first_recipient = Some(addr.to_string());
        }
        self.recipients.push(recipient);
        Ok(())
    }

    fn message(&mut self, kind: RecordKind, payload: &[u8]) -> Result<(), CleanupError> {
        match kind {
            RecordKind::Xtra => {
                self.xtra_offset = self.writer.append(RecordKind::Xtra, b"")?;
                self.apply_inspection(self.inspector_end());
                self.state = State::Extracted;
                Ok(())
            }
            RecordKind::Norm => {
                let emit = self.content_line(payload)?;
                self.content_length += payload.len() as u64 + 1;
                if !self.size_exempt && self.content_length > self.params.message_size_limit {
                    self.flags.insert(CleanupFlags::SIZE_LIMIT);
                }
                self.writer.append(RecordKind::Norm, &emit)?;
                Ok(())
            }
            _ => {
                self.bad_record(kind, "message content");
                Ok(())
            }
        }
    }

    /// Header/body handling for one content line. Returns the bytes to
    /// store, which differ from the input when an inspector substitutes a
    /// header.
    fn content_line(&mut self, payload: &[u8]) -> Result<Vec<u8>, CleanupError> {
        if !self.in_headers {
            if let Some(inspector) = self.config.inspector.clone() {
                self.apply_inspection(inspector.body_line(payload));
            }
            return Ok(payload.to_vec());
        }
        if payload.is_empty() {
            self.in_headers = false;
            return Ok(payload.to_vec());
        }

        self.header_bytes += payload.len() + 1;
        if self.header_bytes > self.params.header_size_limit {
            self.flags.insert(CleanupFlags::HEADER_LIMIT);
        }
        if payload.iter().any(|b| !b.is_ascii()) {
            self.sendopts.insert(SendOpts::SMTPUTF8_HEADER);
        }

        // Continuation lines belong to the previous header; no inspection.
        if payload[0].is_ascii_whitespace() {
            return Ok(payload.to_vec());
        }

        let Ok((header, _)) = mailparse::parse_header(payload) else {
            return Ok(payload.to_vec());
        };
        let name = header.get_key();
        let mut value = header.get_value();

        if let Some(inspector) = self.config.inspector.clone() {
            match inspector.header(&name, &value) {
                InspectAction::ReplaceHeader { value: replacement } => {
                    value = replacement;
                }
                action => self.apply_inspection(action),
            }
        }

        // Header-derived state, after any substitution.
        if name.eq_ignore_ascii_case("return-receipt-to") {
            self.return_receipt = Some(value.trim().to_string());
        } else if name.eq_ignore_ascii_case("errors-to") {
            self.errors_to = Some(value.trim().to_string());
        } else if name.eq_ignore_ascii_case("tls-required")
            && value.trim().eq_ignore_ascii_case("no")
        {
            self.sendopts.insert(SendOpts::REQUIRETLS_HEADER);
        }

        Ok(format!("{name}: {value}").into_bytes())
    }

    fn inspector_end(&self) -> InspectAction {
        self.config
            .inspector
            .as_ref()
            .map_or(InspectAction::Accept, |i| i.end_of_message())
    }

    fn apply_inspection(&mut self, action: InspectAction) {
        match action {
            InspectAction::Accept | InspectAction::ReplaceHeader { .. } => {}
            InspectAction::Reject { status, reason } => {
                self.flags.insert(CleanupFlags::CONTENT_REJECT);
                if self.reject.is_none() {
                    self.reject = Some((status, reason));
                }
            }
            InspectAction::Quarantine => self.flags.insert(CleanupFlags::HOLD),
            InspectAction::Discard => self.flags.insert(CleanupFlags::DISCARD),
        }
    }

    fn extracted(&mut self, kind: RecordKind, payload: &[u8]) -> Result<(), CleanupError> {
        match kind {
            RecordKind::Recipient => self.add_recipient(payload),
            RecordKind::OrigRecipient => {
                self.set_pending_orig(payload);
                Ok(())
            }
            // Headers are authoritative for these; client copies are noise.
            RecordKind::Rrto | RecordKind::Erto => Ok(()),
            RecordKind::Attr => {
                self.writer.append(RecordKind::Attr, payload)?;
                Ok(())
            }
            RecordKind::End => self.close(),
            _ => {
                self.bad_record(kind, "extracted segment");
                Ok(())
            }
        }
    }

    /// Terminate the extracted segment and seal the record stream.
    fn close(&mut self) -> Result<(), CleanupError> {
        let receipt = self.return_receipt.clone().unwrap_or_default();
        self.writer.append(RecordKind::Rrto, receipt.as_bytes())?;
        let errors_to = self
            .errors_to
            .clone()
            .or_else(|| self.sender.clone())
            .unwrap_or_default();
        self.writer.append(RecordKind::Erto, errors_to.as_bytes())?;

        // The always-BCC recipient is appended at the end, exactly once;
        // the duplicate filter already saw every explicit recipient. A
        // header-overflow message keeps its incomplete recipient list as is.
        if !self.flags.contains(CleanupFlags::HEADER_LIMIT) {
            if let Some(bcc) = self.params.always_bcc.clone() {
                let clean = self
                    .rewriter
                    .canonicalize(&bcc, CanonKind::Recipient, false)?
                    .addr;
                if self.dup_filter.check_and_insert(&clean) {
                    self.emit_recipient(&bcc, &clean, NotifyFlags::NEVER, None)?;
                }
            }
        }

        self.writer.append(RecordKind::End, b"")?;
        self.state = State::Close;
        Ok(())
    }

    /// Compute the disposition from the accumulated error bits and act on
    /// it. Consumes the message.
    pub fn finish(mut self) -> Result<Disposition, CleanupError> {
        if self.state != State::Close {
            // Input ended mid-stream; the file cannot be trusted.
            warn!(queue_id = %self.id, state = ?self.state, "input truncated before END");
            self.writer.flush()?;
            let corrupt_path = self.dirs.ensure_parent(QueueName::Corrupt, self.id)?;
            std::fs::rename(&self.work_path, &corrupt_path).map_err(SpoolError::from)?;
            self.finished = true;
            return Ok(Disposition::Corrupt(self.id));
        }

        if self.flags.contains(CleanupFlags::DISCARD) {
            info!(queue_id = %self.id, "message discarded on inspector request");
            std::fs::remove_file(&self.work_path).map_err(SpoolError::from)?;
            self.finished = true;
            return Ok(Disposition::Discarded);
        }

        if self.flags.intersects(CleanupFlags::BOUNCE_CLASS) {
            return self.bounce_all();
        }

        // Clean (or held): patch the real totals into the SIZE record and
        // move the file where it belongs.
        let mut opts = 0;
        if self.precompleted > 0 {
            opts |= qmgr_opts::BOUNCE;
        }
        let hold = self.flags.contains(CleanupFlags::HOLD);
        if hold {
            opts |= qmgr_opts::DEFER;
        }
        let size = SizeRecord {
            message_segment_len: self.xtra_offset.saturating_sub(self.data_offset),
            data_offset: self.data_offset,
            recipient_count: self.recipients.len() as u64,
            qmgr_opts: opts,
            content_length: self.content_length,
            sendopts: self.sendopts,
        };
        self.writer.patch(0, RecordKind::Size, &size.encode())?;
        self.writer.flush()?;

        let queue = if hold { QueueName::Hold } else { QueueName::Incoming };
        let final_path = self.dirs.ensure_parent(queue, self.id)?;
        std::fs::rename(&self.work_path, &final_path).map_err(SpoolError::from)?;
        self.finished = true;

        info!(
            queue_id = %self.id,
            sender = self.sender.as_deref().unwrap_or("<>"),
            recipients = self.recipients.len(),
            size = size.content_length,
            queue = %queue,
            "message enqueued"
        );
        Ok(if hold {
            Disposition::Held(self.id)
        } else {
            Disposition::Enqueued(self.id)
        })
    }

    /// Bounce every recipient: log DSNs, synthesize the notification, and
    /// drop the queue file before it ever reaches the incoming queue.
    fn bounce_all(mut self) -> Result<Disposition, CleanupError> {
        let (status, reason) = self.reject.clone().unwrap_or_else(|| self.default_reject());
        let log = BounceLog::bounce(self.dirs.clone(), self.id);
        for recipient in &self.recipients {
            log.append(
                &LogEntry {
                    recipient: recipient.clone(),
                    dsn: Dsn::bounced(&status, &reason),
                    logged_at: now_secs(),
                },
                self.params.sync_updates,
            )?;
        }
        info!(
            queue_id = %self.id,
            status = %status,
            reason = %reason,
            recipients = self.recipients.len(),
            "message bounced during cleanup"
        );

        let notification = notify::bounce_notification(
            &self.params,
            &self.rewriter,
            &self.dirs,
            self.id,
            self.sender.as_deref().unwrap_or(""),
            self.arrival.unwrap_or_else(now_secs),
            &log.read()?,
        )?;

        log.remove()?;
        std::fs::remove_file(&self.work_path).map_err(SpoolError::from)?;
        self.finished = true;
        Ok(Disposition::Bounced { notification })
    }

    fn default_reject(&self) -> (String, String) {
        if self.flags.contains(CleanupFlags::SIZE_LIMIT) {
            (
                "5.3.4".to_string(),
                format!(
                    "message size exceeds the limit of {} bytes",
                    self.params.message_size_limit
                ),
            )
        } else if self.flags.contains(CleanupFlags::HEADER_LIMIT) {
            (
                "5.3.4".to_string(),
                format!(
                    "header block exceeds the limit of {} bytes",
                    self.params.header_size_limit
                ),
            )
        } else {
            (
                "5.5.2".to_string(),
                "malformed envelope or message records".to_string(),
            )
        }
    }
}

impl Drop for Cleanup {
    fn drop(&mut self) {
        if !self.finished {
            let _ = std::fs::remove_file(&self.work_path);
        }
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
