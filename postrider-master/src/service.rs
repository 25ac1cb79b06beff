//! Service registry entries.

use std::path::PathBuf;

use serde::Deserialize;

use crate::MasterError;

/// Where a service listens; the descriptor is bound by the master and
/// inherited by the service's children.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub enum Endpoint {
    /// Unix stream socket at this path.
    Unix(PathBuf),
    /// TCP listener, `host:port`.
    Tcp(String),
}

/// Worker process model.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub enum ProcessKind {
    /// The master accepts on the endpoint and forks one worker per
    /// connection; the worker gets the accepted stream and exits when it
    /// is done.
    OneShot,
    /// Long-lived workers inherit the listener and accept for themselves.
    Pool,
}

const fn default_peak() -> usize {
    20
}

const fn default_workers() -> usize {
    1
}

const fn default_throttle_secs() -> u64 {
    60
}

/// One service definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Registry name; also the transport name delivery requests select.
    pub name: String,

    /// Argv of the worker; the first element is the executable.
    pub command: Vec<String>,

    /// Optional listener the workers inherit.
    #[serde(default)]
    pub endpoint: Option<Endpoint>,

    #[serde(default = "default_kind")]
    pub kind: ProcessKind,

    /// Workers kept alive for this service.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Peak process limit.
    #[serde(default = "default_peak")]
    pub peak_processes: usize,

    /// Long-term average process limit; equal to the peak for a static
    /// limit.
    #[serde(default = "default_peak")]
    pub average_processes: usize,

    /// Delay before respawning after an abnormal exit.
    #[serde(default = "default_throttle_secs")]
    pub respawn_throttle_secs: u64,

    /// Drop privileges to this uid after fork.
    #[serde(default)]
    pub uid: Option<u32>,

    /// Drop privileges to this gid after fork.
    #[serde(default)]
    pub gid: Option<u32>,

    /// Working directory for the worker.
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

const fn default_kind() -> ProcessKind {
    ProcessKind::Pool
}

impl ServiceConfig {
    /// Validate the definition; a peak below the average is a
    /// configuration botch, caught here rather than at sampling time.
    pub fn validate(&self) -> Result<(), MasterError> {
        if self.command.is_empty() {
            return Err(MasterError::config(&self.name, "empty command"));
        }
        if self.peak_processes == 0 || self.average_processes == 0 {
            return Err(MasterError::config(&self.name, "zero process limit"));
        }
        if self.peak_processes < self.average_processes {
            return Err(MasterError::config(
                &self.name,
                format!(
                    "process limit botch: peak {} < average {}",
                    self.peak_processes, self.average_processes
                ),
            ));
        }
        if self.workers > self.peak_processes {
            return Err(MasterError::config(
                &self.name,
                "workers exceed the peak process limit",
            ));
        }
        if self.kind == ProcessKind::OneShot && self.endpoint.is_none() {
            return Err(MasterError::config(
                &self.name,
                "one-shot service needs an endpoint to accept on",
            ));
        }
        Ok(())
    }
}
