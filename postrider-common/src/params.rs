//! Runtime parameters and the reloadable runtime context.
//!
//! Every component takes a [`Runtime`] handle and snapshots the current
//! [`Params`] at the start of an operation. A configuration reload swaps the
//! whole parameter set atomically; in-flight operations keep the snapshot
//! they started with.

use std::{path::PathBuf, sync::Arc};

use parking_lot::RwLock;
use serde::Deserialize;

fn default_myhostname() -> String {
    "localhost".to_string()
}

fn default_transport() -> String {
    "smtp".to_string()
}

fn default_local_transport() -> String {
    "local".to_string()
}

const fn default_true() -> bool {
    true
}

fn default_empty_address_recipient() -> String {
    "MAILER-DAEMON".to_string()
}

fn default_double_bounce_sender() -> String {
    "double-bounce".to_string()
}

fn default_queue_directory() -> PathBuf {
    PathBuf::from("/var/spool/postrider")
}

const fn default_message_size_limit() -> u64 {
    10_240_000
}

const fn default_header_size_limit() -> usize {
    102_400
}

const fn default_minimal_backoff_secs() -> u64 {
    300
}

const fn default_maximal_backoff_secs() -> u64 {
    4000
}

const fn default_queue_run_delay_secs() -> u64 {
    300
}

const fn default_active_limit() -> usize {
    20_000
}

const fn default_recipient_limit() -> usize {
    50
}

const fn default_initial_destination_concurrency() -> usize {
    5
}

const fn default_destination_concurrency_limit() -> usize {
    20
}

const fn default_duplicate_filter_limit() -> usize {
    1000
}

const fn default_delivery_timeout_secs() -> u64 {
    3600
}

fn default_known_tcp_ports() -> String {
    "lmtp=24, smtp=25".to_string()
}

/// The full parameter set, loaded from the RON configuration file.
///
/// Field names mirror the configuration keys one to one.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Hostname appended to unqualified local recipients.
    pub myhostname: String,

    /// Domains considered local in addition to `myhostname`.
    pub mydestination: Vec<String>,

    /// Optional smart host; when set, all non-local mail without a transport
    /// table match is forwarded here.
    pub relayhost: Option<String>,

    /// Transport for mail to non-local destinations.
    pub default_transport: String,

    /// Transport for fully-local recipients.
    pub local_transport: String,

    /// Rewrite `host!user` into `user@host`.
    pub swap_bangpath: bool,

    /// Rewrite the rightmost `%` into `@` when no `@` is present.
    pub percent_hack: bool,

    /// Address extension delimiter (`user+ext`), disabled when absent.
    pub recipient_delimiter: Option<char>,

    /// Parent domains stripped from addresses when masquerading.
    pub masquerade_domains: Vec<String>,

    /// Recipient silently added to every message, at most once.
    pub always_bcc: Option<String>,

    /// Replacement recipient for an empty local part.
    pub empty_address_recipient: String,

    /// Sender of bounce notifications that themselves cannot be returned.
    pub double_bounce_sender: String,

    /// Seconds after arrival before a delayed-mail warning is sent; zero
    /// disables warnings.
    pub delay_warn_time_secs: u64,

    /// Root of the queue directory tree.
    pub queue_directory: PathBuf,

    /// Reject messages larger than this during cleanup.
    pub message_size_limit: u64,

    /// Reject messages whose header block exceeds this size.
    pub header_size_limit: usize,

    /// Lower bound of the per-destination retry interval.
    pub minimal_backoff_secs: u64,

    /// Upper bound of the per-destination retry interval.
    pub maximal_backoff_secs: u64,

    /// Interval between deferred-queue scans.
    pub queue_run_delay_secs: u64,

    /// Upper bound on the number of messages in the active queue.
    pub active_limit: usize,

    /// Recipients handed to a delivery agent in one request.
    pub recipient_limit: usize,

    /// Concurrency toward a destination that has not failed recently.
    pub initial_destination_concurrency: usize,

    /// Peak concurrency toward a single destination.
    pub destination_concurrency_limit: usize,

    /// Long-term average concurrency toward a single destination; equal to
    /// the peak for a static limit.
    pub destination_concurrency_average: usize,

    /// Upper bound on the per-message duplicate filter.
    pub duplicate_filter_limit: usize,

    /// Fsync bounce/defer log updates before releasing a queue file.
    pub sync_updates: bool,

    /// Deadline for a single delivery request.
    pub delivery_timeout_secs: u64,

    /// Symbolic `name=port` associations used when resolving nexthop ports.
    pub known_tcp_ports: String,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            myhostname: default_myhostname(),
            mydestination: Vec::new(),
            relayhost: None,
            default_transport: default_transport(),
            local_transport: default_local_transport(),
            swap_bangpath: default_true(),
            percent_hack: default_true(),
            recipient_delimiter: None,
            masquerade_domains: Vec::new(),
            always_bcc: None,
            empty_address_recipient: default_empty_address_recipient(),
            double_bounce_sender: default_double_bounce_sender(),
            delay_warn_time_secs: 0,
            queue_directory: default_queue_directory(),
            message_size_limit: default_message_size_limit(),
            header_size_limit: default_header_size_limit(),
            minimal_backoff_secs: default_minimal_backoff_secs(),
            maximal_backoff_secs: default_maximal_backoff_secs(),
            queue_run_delay_secs: default_queue_run_delay_secs(),
            active_limit: default_active_limit(),
            recipient_limit: default_recipient_limit(),
            initial_destination_concurrency: default_initial_destination_concurrency(),
            destination_concurrency_limit: default_destination_concurrency_limit(),
            destination_concurrency_average: default_destination_concurrency_limit(),
            duplicate_filter_limit: default_duplicate_filter_limit(),
            sync_updates: false,
            delivery_timeout_secs: default_delivery_timeout_secs(),
            known_tcp_ports: default_known_tcp_ports(),
        }
    }
}

impl Params {
    /// Returns `true` when `domain` is served by this machine.
    ///
    /// Matching is case-insensitive, as DNS labels are.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        domain.eq_ignore_ascii_case(&self.myhostname)
            || self
                .mydestination
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }

    /// Path of a named queue directory under the spool root.
    pub fn queue_path(&self, queue: &str) -> PathBuf {
        self.queue_directory.join(queue)
    }

    /// Path of the public endpoint directory (trigger and control sockets).
    pub fn public_path(&self) -> PathBuf {
        self.queue_directory.join("public")
    }

    /// Endpoint the queue manager listens on for wakeup triggers.
    pub fn qmgr_trigger_path(&self) -> PathBuf {
        self.public_path().join("qmgr")
    }

    /// Endpoint the control service listens on.
    pub fn control_socket_path(&self) -> PathBuf {
        self.public_path().join("control")
    }
}

/// Reloadable runtime context shared by every component of a process.
#[derive(Debug)]
pub struct Runtime {
    params: RwLock<Arc<Params>>,
}

impl Runtime {
    #[must_use]
    pub fn new(params: Params) -> Self {
        Self {
            params: RwLock::new(Arc::new(params)),
        }
    }

    /// Snapshot the current parameters. The snapshot stays valid across a
    /// reload; callers re-snapshot per operation.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Params> {
        Arc::clone(&self.params.read())
    }

    /// Atomically replace the parameter set.
    pub fn reload(&self, params: Params) {
        *self.params.write() = Arc::new(params);
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Params::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_domain_matching_is_case_insensitive() {
        let params = Params {
            myhostname: "mail.example.com".to_string(),
            mydestination: vec!["example.com".to_string()],
            ..Params::default()
        };

        assert!(params.is_local_domain("MAIL.EXAMPLE.COM"));
        assert!(params.is_local_domain("Example.Com"));
        assert!(!params.is_local_domain("other.example.net"));
    }

    #[test]
    fn reload_replaces_snapshot_atomically() {
        let runtime = Runtime::default();
        let before = runtime.snapshot();

        let mut updated = Params::default();
        updated.myhostname = "after.example.com".to_string();
        runtime.reload(updated);

        assert_eq!(before.myhostname, "localhost");
        assert_eq!(runtime.snapshot().myhostname, "after.example.com");
    }
}
