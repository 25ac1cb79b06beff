//! End-to-end tests for the cleanup pipeline.

use std::sync::Arc;

use postrider_cleanup::{
    Cleanup, CleanupConfig, Disposition, InspectAction, Inspector,
};
use postrider_common::Params;
use postrider_maps::{InlineMap, SharedMap};
use postrider_rewrite::Rewriter;
use postrider_spool::{
    BounceLog, QueueDirs, QueueId, QueueName, Record, RecordKind, RecordReader, SizeRecord,
};

fn params() -> Arc<Params> {
    let mut params = Params::default();
    params.myhostname = "mail.example.com".to_string();
    params.mydestination = vec!["example.com".to_string()];
    Arc::new(params)
}

fn setup(params: &Arc<Params>) -> (tempfile::TempDir, QueueDirs, Arc<Rewriter>) {
    let tmp = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::new(tmp.path());
    dirs.init().unwrap();
    let rewriter = Arc::new(Rewriter::new(params));
    (tmp, dirs, rewriter)
}

fn feed_basic(cleanup: &mut Cleanup, body: &[&str]) {
    cleanup.process(RecordKind::From, b"a@example.com").unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    cleanup
        .process(RecordKind::Recipient, b"b@example.com")
        .unwrap();
    cleanup.process(RecordKind::Mesg, b"").unwrap();
    for line in body {
        cleanup.process(RecordKind::Norm, line.as_bytes()).unwrap();
    }
    cleanup.process(RecordKind::Xtra, b"").unwrap();
    cleanup.process(RecordKind::End, b"").unwrap();
}

fn read_records(dirs: &QueueDirs, queue: QueueName, id: QueueId) -> Vec<Record> {
    let file = std::fs::File::open(dirs.path(queue, id)).unwrap();
    let mut reader = RecordReader::new(file).unwrap();
    let mut records = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        records.push(record);
    }
    records
}

#[test]
fn basic_message_lands_sealed_in_incoming() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let mut cleanup = Cleanup::open(
        Arc::clone(&params),
        rewriter,
        CleanupConfig::default(),
        dirs.clone(),
    )
    .unwrap();
    feed_basic(&mut cleanup, &["Subject: hi", "", "body"]);
    let disposition = cleanup.finish().unwrap();

    let Disposition::Enqueued(id) = disposition else {
        panic!("expected Enqueued, got {disposition:?}");
    };
    assert_eq!(dirs.scan(QueueName::Incoming, None).unwrap(), vec![id]);

    let records = read_records(&dirs, QueueName::Incoming, id);
    assert_eq!(records.first().unwrap().kind, RecordKind::Size);
    assert_eq!(records.last().unwrap().kind, RecordKind::End);
    assert_eq!(
        records
            .iter()
            .filter(|r| matches!(r.kind, RecordKind::Mesg | RecordKind::Xtra))
            .count(),
        2
    );

    let size = SizeRecord::decode(&records[0].payload).unwrap();
    assert_eq!(size.recipient_count, 1);
    assert!(size.content_length > 0);
    assert!(size.content_length <= size.message_segment_len);

    // The sender precedes every recipient in the envelope segment.
    let from_pos = records.iter().position(|r| r.kind == RecordKind::From).unwrap();
    let rcpt_pos = records
        .iter()
        .position(|r| r.kind == RecordKind::Recipient)
        .unwrap();
    assert!(from_pos < rcpt_pos);
}

#[test]
fn recipient_before_sender_marks_the_message_bad() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let mut cleanup = Cleanup::open(
        Arc::clone(&params),
        rewriter,
        CleanupConfig::default(),
        dirs.clone(),
    )
    .unwrap();
    cleanup
        .process(RecordKind::Recipient, b"early@example.com")
        .unwrap();
    cleanup.process(RecordKind::From, b"a@example.com").unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    cleanup
        .process(RecordKind::Recipient, b"b@example.com")
        .unwrap();
    cleanup.process(RecordKind::Mesg, b"").unwrap();
    cleanup.process(RecordKind::Xtra, b"").unwrap();
    cleanup.process(RecordKind::End, b"").unwrap();

    // Bad-record class: the whole message bounces; the sender gets one
    // notification and the original never reaches incoming.
    let disposition = cleanup.finish().unwrap();
    let Disposition::Bounced { notification } = disposition else {
        panic!("expected Bounced, got {disposition:?}");
    };
    let notification = notification.unwrap();
    assert_eq!(
        dirs.scan(QueueName::Incoming, None).unwrap(),
        vec![notification]
    );
}

#[test]
fn oversized_message_goes_straight_to_bounce() {
    let mut raw = Params::default();
    raw.myhostname = "mail.example.com".to_string();
    raw.message_size_limit = 32;
    let params = Arc::new(raw);
    let (_tmp, dirs, rewriter) = setup(&params);

    let mut cleanup = Cleanup::open(
        Arc::clone(&params),
        rewriter,
        CleanupConfig::default(),
        dirs.clone(),
    )
    .unwrap();
    feed_basic(
        &mut cleanup,
        &["Subject: big", "", "0123456789012345678901234567890123456789"],
    );
    let disposition = cleanup.finish().unwrap();

    let Disposition::Bounced { notification } = disposition else {
        panic!("expected Bounced, got {disposition:?}");
    };
    // Only the notification is in incoming; the oversized original is gone.
    let incoming = dirs.scan(QueueName::Incoming, None).unwrap();
    assert_eq!(incoming, vec![notification.unwrap()]);

    let records = read_records(&dirs, QueueName::Incoming, incoming[0]);
    let body: Vec<String> = records
        .iter()
        .filter(|r| r.kind == RecordKind::Norm)
        .map(|r| String::from_utf8_lossy(&r.payload).into_owned())
        .collect();
    assert!(body.iter().any(|l| l.contains("Status: 5.3.4")));
    // The notification itself has the null sender.
    let from = records
        .iter()
        .find(|r| r.kind == RecordKind::From)
        .unwrap();
    assert!(from.payload.is_empty());
}

#[test]
fn alias_loop_is_cut_and_bounced_once() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let alias: SharedMap = Arc::new(InlineMap::parse("{x@example.com=x@example.com}").unwrap());
    let config = CleanupConfig {
        virtual_aliases: vec![alias],
        inspector: None,
    };

    let mut cleanup =
        Cleanup::open(Arc::clone(&params), rewriter, config, dirs.clone()).unwrap();
    cleanup.process(RecordKind::From, b"a@example.com").unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    cleanup
        .process(RecordKind::Recipient, b"x@example.com")
        .unwrap();
    cleanup.process(RecordKind::Mesg, b"").unwrap();
    cleanup.process(RecordKind::Norm, b"").unwrap();
    cleanup.process(RecordKind::Xtra, b"").unwrap();
    cleanup.process(RecordKind::End, b"").unwrap();

    let id = cleanup.queue_id();
    let disposition = cleanup.finish().unwrap();
    assert!(matches!(disposition, Disposition::Enqueued(_)));

    // The looped recipient was pre-completed: its record is DONE and the
    // bounce log carries the loop DSN.
    let records = read_records(&dirs, QueueName::Incoming, id);
    assert!(records.iter().any(|r| r.kind == RecordKind::Done));
    assert!(!records.iter().any(|r| r.kind == RecordKind::Recipient));

    let entries = BounceLog::bounce(dirs, id).read().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].dsn.status.as_str(), "5.4.6");
}

#[test]
fn alias_fanout_deduplicates_recipients() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    // Both lists contain carol; she gets the message once.
    let alias: SharedMap = Arc::new(
        InlineMap::parse(
            "{team@example.com={alice@example.com, carol@example.com}, \
              ops@example.com={bob@example.com, carol@example.com}}",
        )
        .unwrap(),
    );
    let config = CleanupConfig {
        virtual_aliases: vec![alias],
        inspector: None,
    };

    let mut cleanup =
        Cleanup::open(Arc::clone(&params), rewriter, config, dirs.clone()).unwrap();
    cleanup.process(RecordKind::From, b"a@example.com").unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    cleanup
        .process(RecordKind::Recipient, b"team@example.com")
        .unwrap();
    cleanup
        .process(RecordKind::Recipient, b"ops@example.com")
        .unwrap();
    cleanup.process(RecordKind::Mesg, b"").unwrap();
    cleanup.process(RecordKind::Xtra, b"").unwrap();
    cleanup.process(RecordKind::End, b"").unwrap();

    let id = cleanup.queue_id();
    cleanup.finish().unwrap();

    let records = read_records(&dirs, QueueName::Incoming, id);
    let mut rcpts: Vec<String> = records
        .iter()
        .filter(|r| r.kind == RecordKind::Recipient)
        .map(|r| String::from_utf8_lossy(&r.payload).into_owned())
        .collect();
    rcpts.sort();
    assert_eq!(
        rcpts,
        vec!["alice@example.com", "bob@example.com", "carol@example.com"]
    );
}

#[test]
fn zero_recipients_with_always_bcc_yields_exactly_one() {
    let mut raw = Params::default();
    raw.myhostname = "mail.example.com".to_string();
    raw.always_bcc = Some("archive@example.com".to_string());
    let params = Arc::new(raw);
    let (_tmp, dirs, rewriter) = setup(&params);

    let mut cleanup = Cleanup::open(
        Arc::clone(&params),
        rewriter,
        CleanupConfig::default(),
        dirs.clone(),
    )
    .unwrap();
    cleanup.process(RecordKind::From, b"a@example.com").unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    cleanup.process(RecordKind::Mesg, b"").unwrap();
    cleanup.process(RecordKind::Xtra, b"").unwrap();
    cleanup.process(RecordKind::End, b"").unwrap();

    let id = cleanup.queue_id();
    cleanup.finish().unwrap();

    let records = read_records(&dirs, QueueName::Incoming, id);
    let rcpts: Vec<_> = records
        .iter()
        .filter(|r| r.kind == RecordKind::Recipient)
        .collect();
    assert_eq!(rcpts.len(), 1);
    assert_eq!(rcpts[0].payload, b"archive@example.com");

    let size = SizeRecord::decode(&records[0].payload).unwrap();
    assert_eq!(size.recipient_count, 1);
}

#[derive(Debug)]
struct Quarantine;

impl Inspector for Quarantine {
    fn end_of_message(&self) -> InspectAction {
        InspectAction::Quarantine
    }
}

#[test]
fn inspector_quarantine_parks_the_message_in_hold() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let config = CleanupConfig {
        virtual_aliases: Vec::new(),
        inspector: Some(Arc::new(Quarantine)),
    };
    let mut cleanup =
        Cleanup::open(Arc::clone(&params), rewriter, config, dirs.clone()).unwrap();
    feed_basic(&mut cleanup, &["Subject: odd", "", "body"]);

    let disposition = cleanup.finish().unwrap();
    let Disposition::Held(id) = disposition else {
        panic!("expected Held, got {disposition:?}");
    };
    assert_eq!(dirs.scan(QueueName::Hold, None).unwrap(), vec![id]);
    assert!(dirs.scan(QueueName::Incoming, None).unwrap().is_empty());
}

#[derive(Debug)]
struct DropItAll;

impl Inspector for DropItAll {
    fn body_line(&self, _line: &[u8]) -> InspectAction {
        InspectAction::Discard
    }
}

#[test]
fn inspector_discard_leaves_no_trace() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let config = CleanupConfig {
        virtual_aliases: Vec::new(),
        inspector: Some(Arc::new(DropItAll)),
    };
    let mut cleanup =
        Cleanup::open(Arc::clone(&params), rewriter, config, dirs.clone()).unwrap();
    feed_basic(&mut cleanup, &["Subject: spam", "", "body"]);

    assert_eq!(cleanup.finish().unwrap(), Disposition::Discarded);
    for queue in QueueName::ALL {
        assert!(dirs.scan(queue, None).unwrap().is_empty(), "{queue} not empty");
    }
}

#[derive(Debug)]
struct SubjectRewriter;

impl Inspector for SubjectRewriter {
    fn header(&self, name: &str, _value: &str) -> InspectAction {
        if name.eq_ignore_ascii_case("subject") {
            InspectAction::ReplaceHeader {
                value: "[scanned] original".to_string(),
            }
        } else {
            InspectAction::Accept
        }
    }
}

#[test]
fn inspector_header_replacement_is_stored() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let config = CleanupConfig {
        virtual_aliases: Vec::new(),
        inspector: Some(Arc::new(SubjectRewriter)),
    };
    let mut cleanup =
        Cleanup::open(Arc::clone(&params), rewriter, config, dirs.clone()).unwrap();
    feed_basic(&mut cleanup, &["Subject: original", "", "body"]);

    let id = cleanup.queue_id();
    cleanup.finish().unwrap();

    let records = read_records(&dirs, QueueName::Incoming, id);
    assert!(records.iter().any(|r| r.payload == b"Subject: [scanned] original"));
}

#[test]
fn truncated_input_parks_the_file_in_corrupt() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let mut cleanup = Cleanup::open(
        Arc::clone(&params),
        rewriter,
        CleanupConfig::default(),
        dirs.clone(),
    )
    .unwrap();
    cleanup.process(RecordKind::From, b"a@example.com").unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    // The stream stops here: no MESG, no END.

    let disposition = cleanup.finish().unwrap();
    let Disposition::Corrupt(id) = disposition else {
        panic!("expected Corrupt, got {disposition:?}");
    };
    assert_eq!(dirs.scan(QueueName::Corrupt, None).unwrap(), vec![id]);
    assert!(dirs.scan(QueueName::Incoming, None).unwrap().is_empty());
}

#[test]
fn unknown_record_in_envelope_drains_and_bounces() {
    let params = params();
    let (_tmp, dirs, rewriter) = setup(&params);

    let mut cleanup = Cleanup::open(
        Arc::clone(&params),
        rewriter,
        CleanupConfig::default(),
        dirs.clone(),
    )
    .unwrap();
    cleanup.process(RecordKind::From, b"a@example.com").unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    // Content record in the envelope segment: flagged bad, input drains on.
    cleanup.process(RecordKind::Norm, b"out of place").unwrap();
    cleanup
        .process(RecordKind::Recipient, b"b@example.com")
        .unwrap();
    cleanup.process(RecordKind::Mesg, b"").unwrap();
    cleanup.process(RecordKind::Xtra, b"").unwrap();
    cleanup.process(RecordKind::End, b"").unwrap();

    let disposition = cleanup.finish().unwrap();
    assert!(matches!(disposition, Disposition::Bounced { .. }));
}
