//! End-to-end delivery scenarios: enqueue through cleanup, schedule with
//! the queue manager, deliver through a scripted agent.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::SystemTime;

use async_trait::async_trait;
use postrider_cleanup::{Cleanup, CleanupConfig, Disposition};
use postrider_common::{Dsn, Params, Runtime, ports::KnownTcpPorts};
use postrider_qmgr::{
    AgentConnector, AgentError, DeliveryAgent, DeliveryReply, DeliveryRequest, QueueManager,
    RecipientStatus, RecipientVerdict,
};
use postrider_rewrite::{Resolver, Rewriter, TransportTable};
use postrider_spool::{QueueDirs, QueueId, QueueName, RecordKind, RecordReader};

type Script = dyn Fn(usize, &DeliveryRequest) -> Vec<RecipientVerdict> + Send + Sync;

/// Connector whose agents answer according to a per-call script and record
/// every request they see.
struct ScriptedConnector {
    calls: AtomicUsize,
    script: Box<Script>,
    seen: Mutex<Vec<DeliveryRequest>>,
}

impl std::fmt::Debug for ScriptedConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedConnector")
            .field("calls", &self.calls)
            .finish_non_exhaustive()
    }
}

impl ScriptedConnector {
    fn new(
        script: impl Fn(usize, &DeliveryRequest) -> Vec<RecipientVerdict> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<DeliveryRequest> {
        self.seen.lock().unwrap().clone()
    }
}

struct ScriptedAgent {
    connector: Arc<ScriptedConnector>,
    transport: String,
}

#[async_trait]
impl DeliveryAgent for ScriptedAgent {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReply, AgentError> {
        let call = self.connector.calls.fetch_add(1, Ordering::SeqCst);
        let verdicts = (self.connector.script)(call, &request);
        let statuses = request
            .recipients
            .iter()
            .zip(verdicts)
            .map(|(rcpt, verdict)| RecipientStatus {
                offset: rcpt.offset,
                addr: rcpt.addr.clone(),
                verdict,
                dsn: match verdict {
                    RecipientVerdict::Ok => Dsn::delivered("250 ok"),
                    RecipientVerdict::Defer => {
                        Dsn::deferred("4.4.1", "connection timed out").with_mta(&self.transport)
                    }
                    RecipientVerdict::Bounce => {
                        Dsn::bounced("5.1.1", "no such user").with_diagnostic("smtp", "550 5.1.1")
                    }
                },
            })
            .collect();
        self.connector.seen.lock().unwrap().push(request);
        Ok(DeliveryReply { statuses })
    }
}

/// The connector handed to the queue manager wraps the shared script
/// state, so every agent it produces reports into the same log.
#[derive(Debug)]
struct SharedConnector(Arc<ScriptedConnector>);

impl AgentConnector for SharedConnector {
    fn connect(&self, transport: &str) -> Arc<dyn DeliveryAgent> {
        Arc::new(ScriptedAgent {
            connector: Arc::clone(&self.0),
            transport: transport.to_string(),
        })
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    dirs: QueueDirs,
    runtime: Arc<Runtime>,
    rewriter: Arc<Rewriter>,
    manager: QueueManager,
    connector: Arc<ScriptedConnector>,
}

fn harness(mut params: Params, connector: Arc<ScriptedConnector>) -> Harness {
    params.myhostname = "mail.example.com".to_string();
    params
        .mydestination
        .push("example.com".to_string());
    params.minimal_backoff_secs = 300;
    params.maximal_backoff_secs = 4000;

    let tmp = tempfile::tempdir().unwrap();
    let dirs = QueueDirs::new(tmp.path());
    dirs.init().unwrap();

    let rewriter = Arc::new(Rewriter::new(&params));
    let resolver = Arc::new(Resolver::new(
        Arc::new(params.clone()),
        Rewriter::new(&params),
        TransportTable::new(None, true, KnownTcpPorts::new()),
    ));
    let runtime = Arc::new(Runtime::new(params));
    let manager = QueueManager::new(
        Arc::clone(&runtime),
        dirs.clone(),
        resolver,
        Arc::clone(&rewriter),
        Arc::new(SharedConnector(Arc::clone(&connector))),
    );
    Harness {
        _tmp: tmp,
        dirs,
        runtime,
        rewriter,
        manager,
        connector,
    }
}

fn enqueue(h: &Harness, sender: &str, recipients: &[&str]) -> QueueId {
    let mut cleanup = Cleanup::open(
        h.runtime.snapshot(),
        Arc::clone(&h.rewriter),
        CleanupConfig::default(),
        h.dirs.clone(),
    )
    .unwrap();
    cleanup.process(RecordKind::From, sender.as_bytes()).unwrap();
    cleanup.process(RecordKind::Time, b"1700000123").unwrap();
    for rcpt in recipients {
        cleanup
            .process(RecordKind::Recipient, rcpt.as_bytes())
            .unwrap();
    }
    cleanup.process(RecordKind::Mesg, b"").unwrap();
    cleanup.process(RecordKind::Norm, b"Subject: test").unwrap();
    cleanup.process(RecordKind::Norm, b"").unwrap();
    cleanup.process(RecordKind::Norm, b"abc").unwrap();
    cleanup.process(RecordKind::Xtra, b"").unwrap();
    cleanup.process(RecordKind::End, b"").unwrap();
    match cleanup.finish().unwrap() {
        Disposition::Enqueued(id) => id,
        other => panic!("expected Enqueued, got {other:?}"),
    }
}

fn all_queues_empty(dirs: &QueueDirs) -> bool {
    QueueName::ALL
        .iter()
        .all(|q| dirs.scan(*q, None).unwrap().is_empty())
}

#[tokio::test]
async fn basic_local_delivery_removes_the_file() {
    let connector = ScriptedConnector::new(|_, req| vec![RecipientVerdict::Ok; req.recipients.len()]);
    let h = harness(Params::default(), Arc::clone(&connector));

    enqueue(&h, "a@example.com", &["b@example.com"]);
    let worked = h.manager.scan_once().await.unwrap();
    assert_eq!(worked, 1);

    let requests = connector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].nexthop, "");
    assert_eq!(requests[0].recipients.len(), 1);
    assert_eq!(requests[0].recipients[0].addr, "b@example.com");

    // Everything delivered: the queue file is gone.
    assert!(all_queues_empty(&h.dirs));
}

#[tokio::test]
async fn remote_delivery_uses_the_relayhost() {
    let connector = ScriptedConnector::new(|_, req| vec![RecipientVerdict::Ok; req.recipients.len()]);
    let mut params = Params::default();
    params.relayhost = Some("smart.relay.example".to_string());
    let h = harness(params, Arc::clone(&connector));

    enqueue(&h, "a@example.com", &["u@remote.example.net"]);
    h.manager.scan_once().await.unwrap();

    let requests = connector.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].nexthop, "smart.relay.example");
    assert!(all_queues_empty(&h.dirs));
}

#[tokio::test]
async fn transient_failure_defers_with_backoff() {
    let connector = ScriptedConnector::new(|call, req| {
        if call == 0 {
            vec![RecipientVerdict::Defer; req.recipients.len()]
        } else {
            vec![RecipientVerdict::Ok; req.recipients.len()]
        }
    });
    let h = harness(Params::default(), Arc::clone(&connector));

    let id = enqueue(&h, "a@example.com", &["u@remote.example.net"]);
    h.manager.scan_once().await.unwrap();

    // Deferred, with the retry time pushed past the initial backoff.
    assert_eq!(h.dirs.scan(QueueName::Deferred, None).unwrap(), vec![id]);
    let mtime = std::fs::metadata(h.dirs.path(QueueName::Deferred, id))
        .unwrap()
        .modified()
        .unwrap();
    let delay = mtime
        .duration_since(SystemTime::now())
        .unwrap_or_default()
        .as_secs();
    assert!(delay > 200, "retry delay only {delay}s");

    // A scan before the retry time leaves it alone.
    h.manager.scan_once().await.unwrap();
    assert_eq!(h.dirs.scan(QueueName::Deferred, None).unwrap(), vec![id]);
    assert_eq!(connector.requests().len(), 1);

    // Flush rewinds the retry time and backoff; the next scan delivers.
    h.manager.flush(None).unwrap();
    h.manager.scan_once().await.unwrap();
    assert_eq!(connector.requests().len(), 2);
    assert!(all_queues_empty(&h.dirs));
}

#[tokio::test]
async fn mixed_bounce_and_success_produces_one_notification() {
    let connector = ScriptedConnector::new(|_, req| {
        req.recipients
            .iter()
            .map(|r| {
                if r.addr.starts_with("good") {
                    RecipientVerdict::Ok
                } else {
                    RecipientVerdict::Bounce
                }
            })
            .collect()
    });
    let h = harness(Params::default(), Arc::clone(&connector));

    let id = enqueue(
        &h,
        "sender@example.com",
        &["good@remote.example.net", "bad@remote.example.net"],
    );
    h.manager.scan_once().await.unwrap();

    // The original is gone; one bounce notification sits in incoming.
    let incoming = h.dirs.scan(QueueName::Incoming, None).unwrap();
    assert_eq!(incoming.len(), 1);
    assert_ne!(incoming[0], id);
    assert!(h.dirs.scan(QueueName::Active, None).unwrap().is_empty());
    assert!(h.dirs.scan(QueueName::Deferred, None).unwrap().is_empty());
    assert!(h.dirs.scan(QueueName::Bounce, None).unwrap().is_empty());

    let file = std::fs::File::open(h.dirs.path(QueueName::Incoming, incoming[0])).unwrap();
    let mut reader = RecordReader::new(file).unwrap();
    let mut body = String::new();
    let mut rcpts = Vec::new();
    let mut sender = None;
    while let Some(record) = reader.next_record().unwrap() {
        match record.kind {
            RecordKind::Norm => {
                body.push_str(&String::from_utf8_lossy(&record.payload));
                body.push('\n');
            }
            RecordKind::Recipient => rcpts.push(String::from_utf8_lossy(&record.payload).into_owned()),
            RecordKind::From => sender = Some(String::from_utf8_lossy(&record.payload).into_owned()),
            _ => {}
        }
    }
    // Notification: null sender, to the original sender, naming only the
    // failed recipient.
    assert_eq!(sender.as_deref(), Some(""));
    assert_eq!(rcpts, vec!["sender@example.com"]);
    assert!(body.contains("bad@remote.example.net"));
    assert!(body.contains("Status: 5.1.1"));
    assert!(!body.contains("Final-Recipient: rfc822; good@remote.example.net"));
}

#[tokio::test]
async fn bounce_of_null_sender_mail_goes_to_the_double_bounce_mailbox() {
    let connector =
        ScriptedConnector::new(|_, req| vec![RecipientVerdict::Bounce; req.recipients.len()]);
    let h = harness(Params::default(), Arc::clone(&connector));

    let id = enqueue(&h, "", &["u@remote.example.net"]);
    h.manager.scan_once().await.unwrap();

    // The bounced bounce is reported to the double-bounce mailbox, not
    // dropped; the original file is gone.
    let incoming = h.dirs.scan(QueueName::Incoming, None).unwrap();
    assert_eq!(incoming.len(), 1);
    assert_ne!(incoming[0], id);

    let file = std::fs::File::open(h.dirs.path(QueueName::Incoming, incoming[0])).unwrap();
    let mut reader = RecordReader::new(file).unwrap();
    let mut recipients = Vec::new();
    while let Some(record) = reader.next_record().unwrap() {
        if record.kind == RecordKind::Recipient {
            recipients.push(String::from_utf8_lossy(&record.payload).into_owned());
        }
    }
    assert_eq!(recipients, vec!["double-bounce@mail.example.com"]);
}

#[tokio::test]
async fn failed_double_bounce_notification_is_dropped() {
    let connector =
        ScriptedConnector::new(|_, req| vec![RecipientVerdict::Bounce; req.recipients.len()]);
    let h = harness(Params::default(), Arc::clone(&connector));

    // The double-bounce mailbox itself is undeliverable: after the first
    // scan its report is enqueued, after the second that report bounces
    // and the chain ends instead of producing another notification.
    enqueue(&h, "", &["u@remote.example.net"]);
    h.manager.scan_once().await.unwrap();
    h.manager.scan_once().await.unwrap();

    assert!(all_queues_empty(&h.dirs));
}

#[tokio::test]
async fn recipients_group_by_destination() {
    let connector = ScriptedConnector::new(|_, req| vec![RecipientVerdict::Ok; req.recipients.len()]);
    let h = harness(Params::default(), Arc::clone(&connector));

    enqueue(
        &h,
        "a@example.com",
        &[
            "one@remote.example.net",
            "two@remote.example.net",
            "other@elsewhere.example.org",
        ],
    );
    h.manager.scan_once().await.unwrap();

    let requests = connector.requests();
    assert_eq!(requests.len(), 2);
    let mut batch_sizes: Vec<usize> = requests.iter().map(|r| r.recipients.len()).collect();
    batch_sizes.sort_unstable();
    assert_eq!(batch_sizes, vec![1, 2]);

    // Order within a batch follows file order.
    let pair = requests.iter().find(|r| r.recipients.len() == 2).unwrap();
    assert_eq!(pair.recipients[0].addr, "one@remote.example.net");
    assert_eq!(pair.recipients[1].addr, "two@remote.example.net");
    assert!(all_queues_empty(&h.dirs));
}
