//! Bounce and delay notification synthesis (RFC 3464).
//!
//! A notification is a fresh message injected through its own cleanup
//! instance: null sender, the original sender as the one recipient, and a
//! `multipart/report` body with a human-readable part, a
//! `message/delivery-status` part, and the logged per-recipient statuses.
//! When the original sender is empty (the failed message was itself a
//! bounce), the notification goes to the double-bounce mailbox instead; a
//! double-bounce that fails in turn is dropped, which terminates the
//! chain.

use std::{fmt::Write as _, sync::Arc};

use postrider_common::Params;
use postrider_rewrite::Rewriter;
use postrider_spool::{LogEntry, QueueDirs, QueueId, RecordKind};
use tracing::{info, warn};

use crate::{Cleanup, CleanupConfig, CleanupError, Disposition};

/// Synthesize a failure notification for `entries` and enqueue it.
///
/// Returns `None` without sending only when there is nothing to report or
/// when the failed message was a double-bounce notification itself.
pub fn bounce_notification(
    params: &Arc<Params>,
    rewriter: &Arc<Rewriter>,
    dirs: &QueueDirs,
    original_id: QueueId,
    original_sender: &str,
    arrival: i64,
    entries: &[LogEntry],
) -> Result<Option<QueueId>, CleanupError> {
    send_notification(
        params,
        rewriter,
        dirs,
        original_id,
        original_sender,
        arrival,
        entries,
        "Undelivered Mail Returned to Sender",
        "I'm sorry to have to inform you that your message could not\n\
         be delivered to one or more recipients.",
    )
}

/// Synthesize a delayed-mail warning; same shape, delayed action.
pub fn delay_notification(
    params: &Arc<Params>,
    rewriter: &Arc<Rewriter>,
    dirs: &QueueDirs,
    original_id: QueueId,
    original_sender: &str,
    arrival: i64,
    entries: &[LogEntry],
) -> Result<Option<QueueId>, CleanupError> {
    send_notification(
        params,
        rewriter,
        dirs,
        original_id,
        original_sender,
        arrival,
        entries,
        "Delayed Mail (still being retried)",
        "Your message could not be delivered for some time.\n\
         It will be retried until it is too old.",
    )
}

#[allow(clippy::too_many_arguments)]
fn send_notification(
    params: &Arc<Params>,
    rewriter: &Arc<Rewriter>,
    dirs: &QueueDirs,
    original_id: QueueId,
    original_sender: &str,
    arrival: i64,
    entries: &[LogEntry],
    subject: &str,
    preamble: &str,
) -> Result<Option<QueueId>, CleanupError> {
    if entries.is_empty() {
        return Ok(None);
    }
    // A failed double-bounce notification stops here; reporting the
    // report's own failure would chain forever.
    if entries
        .iter()
        .all(|e| is_double_bounce_address(params, &e.recipient.addr))
    {
        warn!(queue_id = %original_id, "double-bounce notification undeliverable, dropped");
        return Ok(None);
    }

    // An empty or double-bounce sender cannot be notified directly; the
    // report goes to the double-bounce mailbox instead.
    let recipient = if original_sender.is_empty()
        || is_double_bounce_address(params, original_sender)
    {
        format!("{}@{}", params.double_bounce_sender, params.myhostname)
    } else {
        original_sender.to_string()
    };

    let body = build_report(params, original_id, &recipient, entries, subject, preamble);

    let mut cleanup = Cleanup::open(
        Arc::clone(params),
        Arc::clone(rewriter),
        CleanupConfig::default(),
        dirs.clone(),
    )?;
    cleanup.exempt_from_size_limit();
    // Null sender: a notification that bounces must not bounce again.
    cleanup.process(RecordKind::From, b"")?;
    cleanup.process(RecordKind::Time, arrival.to_string().as_bytes())?;
    cleanup.process(RecordKind::Recipient, recipient.as_bytes())?;
    cleanup.process(RecordKind::Mesg, b"")?;
    for line in body.lines() {
        cleanup.process(RecordKind::Norm, line.as_bytes())?;
    }
    cleanup.process(RecordKind::Xtra, b"")?;
    cleanup.process(RecordKind::End, b"")?;

    match cleanup.finish()? {
        Disposition::Enqueued(id) => {
            info!(queue_id = %original_id, notification = %id, "notification enqueued");
            Ok(Some(id))
        }
        other => {
            warn!(queue_id = %original_id, disposition = ?other, "notification not enqueued");
            Ok(None)
        }
    }
}

/// Whether `addr`'s local part names the double-bounce mailbox.
fn is_double_bounce_address(params: &Params, addr: &str) -> bool {
    addr.split('@')
        .next()
        .is_some_and(|local| local.eq_ignore_ascii_case(&params.double_bounce_sender))
}

fn build_report(
    params: &Params,
    original_id: QueueId,
    recipient: &str,
    entries: &[LogEntry],
    subject: &str,
    preamble: &str,
) -> String {
    let boundary = format!("{}.{}", original_id, params.myhostname);
    let mut body = String::new();

    let _ = write!(
        body,
        "From: Mail Delivery System <{daemon}@{host}>\n\
         To: <{sender}>\n\
         Subject: {subject}\n\
         Auto-Submitted: auto-replied\n\
         MIME-Version: 1.0\n\
         Content-Type: multipart/report; report-type=delivery-status;\n\
         \tboundary=\"{boundary}\"\n\
         \n\
         This is a MIME-encapsulated message.\n\
         \n\
         --{boundary}\n\
         Content-Description: Notification\n\
         Content-Type: text/plain; charset=us-ascii\n\
         \n\
         This is the mail system at host {host}.\n\
         \n\
         {preamble}\n\
         \n",
        daemon = params.empty_address_recipient,
        host = params.myhostname,
        sender = recipient,
    );

    for entry in entries {
        let _ = writeln!(
            body,
            "<{}>: {} ({})",
            entry.recipient.addr, entry.dsn.reason, entry.dsn.status
        );
    }

    // Machine-readable delivery status part.
    let _ = write!(
        body,
        "\n--{boundary}\n\
         Content-Description: Delivery report\n\
         Content-Type: message/delivery-status\n\
         \n\
         Reporting-MTA: dns; {host}\n\
         X-Queue-ID: {original_id}\n\
         \n",
        host = params.myhostname,
    );
    for entry in entries {
        let _ = writeln!(body, "Final-Recipient: rfc822; {}", entry.recipient.addr);
        if entry.recipient.orig_addr != entry.recipient.addr {
            let _ = writeln!(
                body,
                "Original-Recipient: rfc822; {}",
                entry.recipient.orig_addr
            );
        }
        let _ = writeln!(body, "Action: {}", entry.dsn.action);
        let _ = writeln!(body, "Status: {}", entry.dsn.status);
        if let (Some(dtype), Some(dtext)) = (&entry.dsn.diag_type, &entry.dsn.diag_text) {
            let _ = writeln!(body, "Diagnostic-Code: {dtype}; {dtext}");
        }
        if let Some(mta) = &entry.dsn.mta {
            let _ = writeln!(body, "Remote-MTA: dns; {mta}");
        }
        let _ = writeln!(body);
    }
    let _ = writeln!(body, "--{boundary}--");
    body
}

#[cfg(test)]
mod tests {
    use postrider_common::{Dsn, Recipient};

    use super::*;

    fn entry(addr: &str) -> LogEntry {
        LogEntry {
            recipient: Recipient::new(0, addr, addr),
            dsn: Dsn::bounced("5.1.1", "unknown user"),
            logged_at: 0,
        }
    }

    #[test]
    fn report_carries_dsn_fields() {
        let params = Params::default();
        let report = build_report(
            &params,
            QueueId::generate(),
            "sender@example.com",
            &[entry("a@example.net")],
            "Undelivered Mail Returned to Sender",
            "preamble",
        );
        assert!(report.contains("multipart/report"));
        assert!(report.contains("message/delivery-status"));
        assert!(report.contains("Final-Recipient: rfc822; a@example.net"));
        assert!(report.contains("Action: failed"));
        assert!(report.contains("Status: 5.1.1"));
        assert!(report.contains("Reporting-MTA: dns; localhost"));
    }

    #[test]
    fn original_recipient_is_reported_when_rewritten() {
        let params = Params::default();
        let mut e = entry("b@example.net");
        e.recipient.orig_addr = "b+tag@example.net".to_string();
        let report = build_report(
            &params,
            QueueId::generate(),
            "s@example.com",
            &[e],
            "subject",
            "preamble",
        );
        assert!(report.contains("Original-Recipient: rfc822; b+tag@example.net"));
    }

    fn setup() -> (tempfile::TempDir, Arc<Params>, Arc<Rewriter>, QueueDirs) {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = QueueDirs::new(tmp.path());
        dirs.init().unwrap();
        let params = Arc::new(Params::default());
        let rewriter = Arc::new(Rewriter::new(&params));
        (tmp, params, rewriter, dirs)
    }

    #[test]
    fn empty_sender_routes_to_the_double_bounce_mailbox() {
        let (_tmp, params, rewriter, dirs) = setup();
        let id = bounce_notification(
            &params,
            &rewriter,
            &dirs,
            QueueId::generate(),
            "",
            1_700_000_000,
            &[entry("a@example.net")],
        )
        .unwrap()
        .expect("notification should be enqueued");

        let file = std::fs::File::open(
            dirs.path(postrider_spool::QueueName::Incoming, id),
        )
        .unwrap();
        let mut reader = postrider_spool::RecordReader::new(file).unwrap();
        let mut recipients = Vec::new();
        while let Some(record) = reader.next_record().unwrap() {
            if record.kind == RecordKind::Recipient {
                recipients.push(String::from_utf8_lossy(&record.payload).into_owned());
            }
        }
        assert_eq!(recipients, vec!["double-bounce@localhost"]);
    }

    #[test]
    fn failed_double_bounce_is_dropped() {
        let (_tmp, params, rewriter, dirs) = setup();
        let result = bounce_notification(
            &params,
            &rewriter,
            &dirs,
            QueueId::generate(),
            "",
            1_700_000_000,
            &[entry("double-bounce@localhost")],
        )
        .unwrap();
        assert!(result.is_none());
        assert!(dirs
            .scan(postrider_spool::QueueName::Incoming, None)
            .unwrap()
            .is_empty());
    }
}
