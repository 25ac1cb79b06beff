//! The scheduler: queue scans, recipient grouping, dispatch, and message
//! finalization.

use std::{
    collections::HashMap,
    fs::File,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use futures_util::future::join_all;
use postrider_cleanup::notify;
use postrider_common::{
    Dsn, Recipient, Runtime, Signal,
    flow::FlowProducer,
    trigger::{TRIGGER_FLUSH, TriggerListener},
};
use postrider_rewrite::{Resolver, Rewriter};
use postrider_spool::{
    BounceLog, LogEntry, LockStrategy, QueueDirs, QueueId, QueueName, RecordKind, RecordWriter,
    SpoolError,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    AgentConnector, AgentError, DeliveryAgent, DeliveryReply, DeliveryRequest, MessageEnvelope,
    QmgrError, RecipientVerdict,
    destination::{DestKey, DestinationTable},
    ops,
};

/// Sampler cadence for adaptive concurrency limits.
const SAMPLE_INTERVAL: Duration = Duration::from_secs(60);
/// Tokens produced toward cleanup producers per idle scan.
const IDLE_TOKENS: usize = 100;

/// The queue manager.
///
/// One instance owns the active queue of its spool; the run loop wakes on
/// triggers, on the periodic deferred-queue scan, and on the sampler tick.
pub struct QueueManager {
    runtime: Arc<Runtime>,
    dirs: QueueDirs,
    resolver: Arc<Resolver>,
    rewriter: Arc<Rewriter>,
    connector: Arc<dyn AgentConnector>,
    destinations: Arc<DestinationTable>,
    agents: DashMap<String, Arc<dyn DeliveryAgent>>,
    flow: Option<tokio::sync::Mutex<FlowProducer>>,
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("dirs", &self.dirs)
            .field("destinations", &self.destinations)
            .finish_non_exhaustive()
    }
}

impl QueueManager {
    #[must_use]
    pub fn new(
        runtime: Arc<Runtime>,
        dirs: QueueDirs,
        resolver: Arc<Resolver>,
        rewriter: Arc<Rewriter>,
        connector: Arc<dyn AgentConnector>,
    ) -> Self {
        let params = runtime.snapshot();
        let destinations = Arc::new(DestinationTable::new(
            params.initial_destination_concurrency,
            params.destination_concurrency_limit,
            params.destination_concurrency_average,
        ));
        Self {
            runtime,
            dirs,
            resolver,
            rewriter,
            connector,
            destinations,
            agents: DashMap::new(),
            flow: None,
        }
    }

    /// Attach the producer end of the flow-control token pipe.
    #[must_use]
    pub fn with_flow(mut self, producer: FlowProducer) -> Self {
        self.flow = Some(tokio::sync::Mutex::new(producer));
        self
    }

    #[must_use]
    pub fn destinations(&self) -> Arc<DestinationTable> {
        Arc::clone(&self.destinations)
    }

    /// Run until shutdown. Wakes on triggers, the periodic queue scan, and
    /// the concurrency sampler.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), QmgrError> {
        let params = self.runtime.snapshot();
        let trigger = TriggerListener::bind(&params.qmgr_trigger_path())
            .map_err(|e| QmgrError::Io(std::io::Error::other(e.to_string())))?;
        let mut scan_timer = tokio::time::interval(Duration::from_secs(params.queue_run_delay_secs));
        let mut sample_timer = tokio::time::interval(SAMPLE_INTERVAL);
        info!(spool = %self.dirs.root().display(), "queue manager started");

        loop {
            tokio::select! {
                payload = trigger.recv() => {
                    match payload {
                        Ok(payload) => {
                            if payload.first() == Some(&TRIGGER_FLUSH) {
                                let site = String::from_utf8_lossy(&payload[1..]).into_owned();
                                let site = (!site.is_empty()).then_some(site);
                                if let Err(e) = self.flush(site.as_deref()) {
                                    warn!(error = %e, "flush request failed");
                                }
                            }
                            // Every wake means "scan for any work", however
                            // many triggers were coalesced behind it.
                            if let Err(e) = self.scan_once().await {
                                error!(error = %e, "queue scan failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "trigger receive failed"),
                    }
                }
                _ = scan_timer.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!(error = %e, "queue scan failed");
                    }
                }
                _ = sample_timer.tick() => {
                    self.destinations.sample(SystemTime::now());
                }
                signal = shutdown.recv() => {
                    match signal {
                        Ok(Signal::Reload) => {
                            debug!("queue manager observed reload");
                        }
                        Ok(Signal::Shutdown) | Err(_) => {
                            info!("queue manager shutting down");
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Operator flush: make deferred mail eligible now and forget the
    /// destination backoff that would otherwise hold it back.
    pub fn flush(&self, site: Option<&str>) -> Result<usize, QmgrError> {
        let flushed = ops::flush_deferred(&self.dirs, site)?;
        self.destinations.clear_backoff();
        Ok(flushed)
    }

    /// One full scan round: promote eligible messages into the active
    /// queue, then work every active message. Returns how many messages
    /// were worked.
    pub async fn scan_once(&self) -> Result<usize, QmgrError> {
        let params = self.runtime.snapshot();
        let now = SystemTime::now();

        let mut active = self.dirs.scan(QueueName::Active, None)?;
        let mut room = params.active_limit.saturating_sub(active.len());

        // Deferred mail whose retry time has arrived goes first so old mail
        // is not starved by a busy incoming queue.
        for id in self.dirs.scan(QueueName::Deferred, Some(now))? {
            if room == 0 {
                break;
            }
            match self.dirs.rename(id, QueueName::Deferred, QueueName::Active) {
                Ok(_) => {
                    active.push(id);
                    room -= 1;
                }
                Err(SpoolError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        for id in self.dirs.scan(QueueName::Incoming, None)? {
            if room == 0 {
                break;
            }
            match self.dirs.rename(id, QueueName::Incoming, QueueName::Active) {
                Ok(_) => {
                    active.push(id);
                    room -= 1;
                }
                Err(SpoolError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        let worked = active.len();
        for id in active {
            if let Err(e) = self.process_message(id).await {
                error!(queue_id = %id, error = %e, "message processing failed");
            }
        }

        // Idle: refill the producer token pipe so receivers may admit new
        // mail. The periodic scan replaces tokens lost to leakage.
        if worked == 0 {
            if let Some(flow) = &self.flow {
                let _ = flow.lock().await.put(IDLE_TOKENS).await;
            }
        }
        Ok(worked)
    }

    /// Work one active message: resolve, group, dispatch, record results,
    /// and decide its fate.
    async fn process_message(&self, id: QueueId) -> Result<(), QmgrError> {
        let path = self.dirs.path(QueueName::Active, id);
        let file = match File::options().read(true).write(true).open(&path) {
            Ok(file) => file,
            // Lost a race with another move; nothing to do.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(SpoolError::from(e).into()),
        };
        let _guard = match LockStrategy::Kernel.acquire(&file, &path) {
            Ok(guard) => guard,
            Err(SpoolError::Locked) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let envelope = match MessageEnvelope::read(id, file.try_clone().map_err(SpoolError::from)?)
        {
            Ok(envelope) => envelope,
            Err(e @ SpoolError::Corrupt { .. }) => {
                warn!(queue_id = %id, error = %e, "queue file failed validation");
                self.dirs.rename(id, QueueName::Active, QueueName::Corrupt)?;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        self.deliver_message(&envelope, file).await
    }

    async fn deliver_message(
        &self,
        envelope: &MessageEnvelope,
        file: File,
    ) -> Result<(), QmgrError> {
        let params = self.runtime.snapshot();
        let id = envelope.id;
        let now = SystemTime::now();

        // Resolve every pending recipient into its destination group;
        // transient resolver trouble defers the recipient.
        let mut groups: HashMap<DestKey, Vec<Recipient>> = HashMap::new();
        let mut deferred: Vec<(Recipient, Dsn)> = Vec::new();
        for rcpt in &envelope.pending {
            match self.resolver.resolve(&rcpt.addr) {
                Ok(resolution) => {
                    let key = DestKey::new(resolution.transport, resolution.nexthop);
                    let mut routed = rcpt.clone();
                    routed.addr = resolution.recipient;
                    groups.entry(key).or_default().push(routed);
                }
                Err(e) if e.is_transient() => {
                    deferred.push((
                        rcpt.clone(),
                        Dsn::deferred("4.3.0", format!("address resolution deferred: {e}")),
                    ));
                }
                Err(e) => {
                    // Unresolvable address syntax is a hard failure.
                    deferred.push((rcpt.clone(), Dsn::bounced("5.1.3", e.to_string())));
                }
            }
        }

        let mut writer = RecordWriter::new(file);
        let mut completed: Vec<u64> = Vec::new();
        let mut bounced: Vec<(Recipient, Dsn)> = Vec::new();
        let mut soft_failed: Vec<(Recipient, Dsn)> = Vec::new();
        let mut next_retry: Option<SystemTime> = None;

        // Hard failures from resolution are final now.
        for (rcpt, dsn) in deferred.drain(..).collect::<Vec<_>>() {
            if dsn.status.is_permanent() {
                bounced.push((rcpt, dsn));
            } else {
                soft_failed.push((rcpt, dsn));
            }
        }

        // Dispatch each destination group, batched by the per-message
        // recipient limit; groups run concurrently, each within the
        // destination's concurrency allowance.
        let mut dispatches = Vec::new();
        let mut held_back: Vec<(Recipient, SystemTime)> = Vec::new();
        for (key, recipients) in groups {
            for batch in recipients.chunks(params.recipient_limit.max(1)) {
                if self.destinations.try_reserve(&key, now) {
                    dispatches.push(self.dispatch(envelope, key.clone(), batch.to_vec()));
                } else {
                    let eligible = self.destinations.next_eligible(&key);
                    for rcpt in batch {
                        held_back.push((rcpt.clone(), eligible));
                    }
                }
            }
        }
        let replies = join_all(dispatches).await;

        for outcome in replies {
            let DispatchOutcome {
                key,
                recipients,
                result,
            } = outcome;
            match result {
                Ok(reply) => {
                    let mut any_defer = false;
                    let mut any_ok = false;
                    let by_offset: HashMap<u64, &Recipient> =
                        recipients.iter().map(|r| (r.offset, r)).collect();
                    let mut mentioned: Vec<u64> = Vec::new();
                    for status in reply.statuses {
                        let Some(rcpt) = by_offset.get(&status.offset) else {
                            warn!(queue_id = %id, offset = status.offset, "status for unknown recipient");
                            continue;
                        };
                        mentioned.push(status.offset);
                        match status.verdict {
                            RecipientVerdict::Ok => {
                                any_ok = true;
                                completed.push(status.offset);
                                info!(
                                    queue_id = %id,
                                    recipient = %rcpt.addr,
                                    relay = %key,
                                    status = %status.dsn.status,
                                    "delivered"
                                );
                            }
                            RecipientVerdict::Defer => {
                                any_defer = true;
                                soft_failed.push(((*rcpt).clone(), status.dsn));
                            }
                            RecipientVerdict::Bounce => {
                                bounced.push(((*rcpt).clone(), status.dsn));
                            }
                        }
                    }
                    // Recipients the agent failed to mention stay queued as
                    // soft failures; silence is not a delivery.
                    for rcpt in &recipients {
                        if !mentioned.contains(&rcpt.offset) {
                            any_defer = true;
                            soft_failed.push((
                                rcpt.clone(),
                                Dsn::deferred("4.3.0", "delivery agent returned no status"),
                            ));
                        }
                    }
                    if any_defer {
                        let eligible = self.destinations.record_failure(
                            &key,
                            now,
                            params.minimal_backoff_secs,
                            params.maximal_backoff_secs,
                        );
                        next_retry = Some(next_retry.map_or(eligible, |t| t.min(eligible)));
                    } else if any_ok {
                        self.destinations.record_success(&key);
                    }
                }
                Err(e) => {
                    // The whole batch soft-fails; timeouts and unreachable
                    // agents are indistinguishable from a slow destination.
                    let dsn = match &e {
                        AgentError::Timeout(t) => Dsn::deferred(
                            "4.4.2",
                            format!("delivery agent timed out after {}s", t.as_secs()),
                        ),
                        other => Dsn::deferred("4.4.1", other.to_string()),
                    };
                    for rcpt in &recipients {
                        soft_failed.push((rcpt.clone(), dsn.clone()));
                    }
                    let eligible = self.destinations.record_failure(
                        &key,
                        now,
                        params.minimal_backoff_secs,
                        params.maximal_backoff_secs,
                    );
                    next_retry = Some(next_retry.map_or(eligible, |t| t.min(eligible)));
                }
            }

            // DONE markers land before the destination slot frees up.
            for offset in &completed {
                writer.overwrite_kind(*offset, RecordKind::Done)?;
            }
            if params.sync_updates {
                writer.get_mut().sync_data().map_err(SpoolError::from)?;
            }
            completed.clear();
            self.destinations.release(&key, SystemTime::now());
        }

        // Bounced recipients are final: log, then mark done.
        let bounce_log = BounceLog::bounce(self.dirs.clone(), id);
        for (rcpt, dsn) in &bounced {
            bounce_log.append(
                &LogEntry {
                    recipient: rcpt.clone(),
                    dsn: dsn.clone(),
                    logged_at: now_secs(),
                },
                params.sync_updates,
            )?;
            writer.overwrite_kind(rcpt.offset, RecordKind::Done)?;
            info!(queue_id = %id, recipient = %rcpt.addr, status = %dsn.status, "bounced");
        }

        // Deferred recipients keep their latest status in the defer log.
        let defer_log = BounceLog::defer(self.dirs.clone(), id);
        for (rcpt, dsn) in &soft_failed {
            defer_log.append(
                &LogEntry {
                    recipient: rcpt.clone(),
                    dsn: dsn.clone(),
                    logged_at: now_secs(),
                },
                params.sync_updates,
            )?;
            debug!(queue_id = %id, recipient = %rcpt.addr, status = %dsn.status, "deferred");
        }
        if params.sync_updates {
            writer.get_mut().sync_data().map_err(SpoolError::from)?;
        }
        drop(writer);

        let remaining = soft_failed.len() + held_back.len();
        if remaining == 0 {
            return self.finalize(envelope, &bounce_log, &defer_log);
        }

        // Some recipients remain: the message goes back to the deferred
        // queue with its retry time encoded in the mtime.
        self.maybe_warn_delay(envelope, &defer_log)?;

        let earliest = held_back
            .iter()
            .map(|(_, t)| *t)
            .chain(next_retry)
            .min()
            .filter(|t| *t > now)
            .unwrap_or_else(|| now + Duration::from_secs(params.minimal_backoff_secs));
        self.dirs.rename(id, QueueName::Active, QueueName::Deferred)?;
        self.dirs.set_mtime(QueueName::Deferred, id, earliest)?;
        info!(
            queue_id = %id,
            remaining,
            retry_at = earliest.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs(),
            "message deferred"
        );
        Ok(())
    }

    /// All recipients are terminal: send the bounce notification if any
    /// recipient failed, then remove the message and its logfiles.
    fn finalize(
        &self,
        envelope: &MessageEnvelope,
        bounce_log: &BounceLog,
        defer_log: &BounceLog,
    ) -> Result<(), QmgrError> {
        let params = self.runtime.snapshot();
        let entries = bounce_log.read()?;
        let notifiable: Vec<_> = entries
            .into_iter()
            .filter(|e| e.recipient.notify.wants_failure())
            .collect();
        if !notifiable.is_empty() {
            notify::bounce_notification(
                &params,
                &self.rewriter,
                &self.dirs,
                envelope.id,
                &envelope.sender,
                envelope.arrival,
                &notifiable,
            )?;
        }
        bounce_log.remove()?;
        defer_log.remove()?;
        self.dirs.remove(QueueName::Active, envelope.id)?;
        info!(queue_id = %envelope.id, "removed");
        Ok(())
    }

    /// Send the delayed-mail warning when the deadline has passed, then
    /// disarm it by patching the WARN record to zero.
    fn maybe_warn_delay(
        &self,
        envelope: &MessageEnvelope,
        defer_log: &BounceLog,
    ) -> Result<(), QmgrError> {
        let params = self.runtime.snapshot();
        let Some(deadline) = envelope.warn_deadline else {
            return Ok(());
        };
        if now_secs() < deadline || envelope.sender.is_empty() {
            return Ok(());
        }
        let entries: Vec<_> = defer_log
            .read()?
            .into_iter()
            .filter(|e| e.recipient.notify.wants_delay())
            .collect();
        if entries.is_empty() {
            return Ok(());
        }
        notify::delay_notification(
            &params,
            &self.rewriter,
            &self.dirs,
            envelope.id,
            &envelope.sender,
            envelope.arrival,
            &entries,
        )?;
        if let Some(offset) = envelope.warn_offset {
            let path = self.dirs.path(QueueName::Active, envelope.id);
            let file = File::options()
                .read(true)
                .write(true)
                .open(path)
                .map_err(SpoolError::from)?;
            let mut writer = RecordWriter::new(file);
            writer.patch(offset, RecordKind::Warn, b"0")?;
        }
        Ok(())
    }

    fn agent_for(&self, transport: &str) -> Arc<dyn DeliveryAgent> {
        self.agents
            .entry(transport.to_string())
            .or_insert_with(|| self.connector.connect(transport))
            .clone()
    }

    async fn dispatch(
        &self,
        envelope: &MessageEnvelope,
        key: DestKey,
        recipients: Vec<Recipient>,
    ) -> DispatchOutcome {
        let request = DeliveryRequest {
            queue: QueueName::Active.as_str().to_string(),
            queue_id: envelope.id,
            data_offset: envelope.size.data_offset,
            sender: envelope.sender.clone(),
            sendopts: delivery_sendopts(envelope, &recipients),
            nexthop: key.nexthop.clone(),
            recipients: recipients.clone(),
        };
        let agent = self.agent_for(&key.transport);
        debug!(
            queue_id = %envelope.id,
            destination = %key,
            recipients = recipients.len(),
            "dispatching delivery request"
        );
        let result = agent.deliver(request).await;
        DispatchOutcome {
            key,
            recipients,
            result,
        }
    }
}

struct DispatchOutcome {
    key: DestKey,
    recipients: Vec<Recipient>,
    result: Result<DeliveryReply, AgentError>,
}

/// Per-request sendopts: the persisted message flags plus the
/// recipient-derived SMTPUTF8 bit, which exists only on the wire.
fn delivery_sendopts(
    envelope: &MessageEnvelope,
    recipients: &[Recipient],
) -> postrider_common::SendOpts {
    let mut opts = envelope.sendopts;
    if recipients.iter().any(|r| !r.addr.is_ascii()) {
        opts.insert(postrider_common::SendOpts::SMTPUTF8_RECIPIENT);
    }
    opts
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
