//! The supervisor proper: spawn, reap, throttle, and command handling.

use std::{
    collections::HashMap,
    os::fd::{AsFd, OwnedFd},
    time::{Duration, Instant},
};

use postrider_common::Signal;
use tokio::{
    process::Child,
    sync::{broadcast, mpsc},
    time::interval,
};
use tracing::{debug, error, info, warn};

use crate::{
    MasterError,
    sample::{SAMPLE_SECS, SampleState, sample_service},
    service::{Endpoint, ProcessKind, ServiceConfig},
    spawn::{Inherited, spawn_worker},
};

/// Commands accepted over the supervisor's command channel.
#[derive(Debug)]
pub enum MasterCommand {
    /// Replace the service registry; removed services drain, new ones
    /// start, changed ones are re-spawned with the new definition.
    Reload(Vec<ServiceConfig>),
    /// Start a stopped service.
    Start(String),
    /// Stop a service and terminate its workers.
    Stop(String),
    /// Stop dispatching and exit; graceful lets workers drain first.
    Shutdown { graceful: bool },
}

/// How long a graceful shutdown waits for workers to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(30);
/// A worker dying sooner than this is considered to be failing at startup.
const FRAGILE_UPTIME: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct WorkerExit {
    service: String,
    pid: u32,
    clean: bool,
    uptime: Duration,
}

struct Service {
    config: ServiceConfig,
    /// Listener that pool workers inherit; one-shot services keep theirs
    /// inside the accept task instead.
    listener: Option<OwnedFd>,
    /// Master-side accept loop of a one-shot service.
    accept_task: Option<tokio::task::JoinHandle<()>>,
    /// Live worker pids; the wait tasks own the `Child` handles.
    workers: HashMap<u32, ()>,
    sample: SampleState,
    throttle_until: Option<Instant>,
    stopped: bool,
}

/// Bind a service endpoint, replacing a stale unix socket file.
fn bind_endpoint(endpoint: &Endpoint) -> Result<OwnedFd, MasterError> {
    match endpoint {
        Endpoint::Unix(path) => {
            if path.exists() {
                std::fs::remove_file(path)?;
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(std::os::unix::net::UnixListener::bind(path)?.into())
        }
        Endpoint::Tcp(addr) => Ok(std::net::TcpListener::bind(addr)?.into()),
    }
}

impl Service {
    fn new(config: ServiceConfig) -> Result<Self, MasterError> {
        config.validate()?;
        // Only pool workers inherit a shared listener; for one-shot
        // services the accept task binds when it starts.
        let listener = match (&config.kind, &config.endpoint) {
            (ProcessKind::Pool, Some(endpoint)) => Some(bind_endpoint(endpoint)?),
            _ => None,
        };
        let sample = SampleState {
            total_proc_avg: 0.0,
            max_proc: config.peak_processes,
        };
        Ok(Self {
            config,
            listener,
            accept_task: None,
            workers: HashMap::new(),
            sample,
            throttle_until: None,
            stopped: false,
        })
    }

    fn throttled(&self, now: Instant) -> bool {
        self.throttle_until.is_some_and(|until| until > now)
    }

    /// Workers this service should be running right now. One-shot services
    /// keep no pool; their workers exist per accepted connection.
    fn target(&self) -> usize {
        if self.stopped || self.config.kind == ProcessKind::OneShot {
            0
        } else {
            self.config.workers.min(self.sample.max_proc)
        }
    }

    fn stop_accepting(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop_accepting();
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.config.name)
            .field("workers", &self.workers.len())
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

/// The supervisor.
#[derive(Debug)]
pub struct Master {
    services: HashMap<String, Service>,
    /// Flow-control pipe: consuming end for producers, producing end for
    /// the queue manager; every worker inherits both.
    flow: (OwnedFd, OwnedFd),
    exit_tx: mpsc::UnboundedSender<WorkerExit>,
    exit_rx: mpsc::UnboundedReceiver<WorkerExit>,
    /// Connections accepted by the master on behalf of one-shot services.
    accept_tx: mpsc::UnboundedSender<(String, OwnedFd)>,
    accept_rx: mpsc::UnboundedReceiver<(String, OwnedFd)>,
}

impl Master {
    pub fn new(configs: Vec<ServiceConfig>) -> Result<Self, MasterError> {
        let mut services = HashMap::new();
        for config in configs {
            let name = config.name.clone();
            if services.insert(name.clone(), Service::new(config)?).is_some() {
                return Err(MasterError::config(name, "duplicate service name"));
            }
        }
        let flow = postrider_common::flow::inheritable_pair()?;
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        Ok(Self {
            services,
            flow,
            exit_tx,
            exit_rx,
            accept_tx,
            accept_rx,
        })
    }

    /// Total live workers for a service.
    #[must_use]
    pub fn worker_count(&self, service: &str) -> usize {
        self.services.get(service).map_or(0, |s| s.workers.len())
    }

    /// Effective process limit for a service.
    #[must_use]
    pub fn effective_limit(&self, service: &str) -> usize {
        self.services
            .get(service)
            .map_or(0, |s| s.sample.max_proc)
    }

    fn spawn_for(&mut self, name: &str) {
        let Some(service) = self.services.get_mut(name) else {
            return;
        };
        let inherited = Inherited {
            listener: service.listener.as_ref().map(AsFd::as_fd),
            connection: None,
            flow_read: Some(self.flow.0.as_fd()),
            flow_write: Some(self.flow.1.as_fd()),
        };
        match spawn_worker(&service.config, inherited) {
            Ok(child) => {
                let Some(pid) = child.id() else {
                    warn!(service = name, "worker exited before tracking");
                    return;
                };
                service.workers.insert(pid, ());
                reap_in_background(name.to_string(), pid, child, self.exit_tx.clone());
            }
            Err(e) => {
                error!(service = name, error = %e, "spawn failed");
                service.throttle_until =
                    Some(Instant::now() + Duration::from_secs(service.config.respawn_throttle_secs));
            }
        }
    }

    /// Fork one worker for a connection the master accepted on behalf of a
    /// one-shot service. Over the limit or throttled, the connection is
    /// closed; the peer retries against a healthier service.
    fn spawn_for_connection(&mut self, name: &str, connection: OwnedFd) {
        let Some(service) = self.services.get_mut(name) else {
            return;
        };
        if service.stopped
            || service.throttled(Instant::now())
            || service.workers.len() >= service.sample.max_proc
        {
            warn!(
                service = name,
                workers = service.workers.len(),
                limit = service.sample.max_proc,
                "connection refused"
            );
            return;
        }
        let inherited = Inherited {
            listener: None,
            connection: Some(connection.as_fd()),
            flow_read: Some(self.flow.0.as_fd()),
            flow_write: Some(self.flow.1.as_fd()),
        };
        match spawn_worker(&service.config, inherited) {
            Ok(child) => {
                let Some(pid) = child.id() else {
                    warn!(service = name, "worker exited before tracking");
                    return;
                };
                service.workers.insert(pid, ());
                reap_in_background(name.to_string(), pid, child, self.exit_tx.clone());
            }
            Err(e) => {
                error!(service = name, error = %e, "spawn failed");
                service.throttle_until =
                    Some(Instant::now() + Duration::from_secs(service.config.respawn_throttle_secs));
            }
        }
    }

    /// Start the accept loop of every one-shot service that should be
    /// listening and is not yet.
    fn ensure_accepting(&mut self) {
        let names: Vec<String> = self
            .services
            .iter()
            .filter(|(_, s)| {
                s.config.kind == ProcessKind::OneShot
                    && !s.stopped
                    && s.accept_task.as_ref().is_none_or(tokio::task::JoinHandle::is_finished)
            })
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            self.start_accepting(&name);
        }
    }

    fn start_accepting(&mut self, name: &str) {
        let accept_tx = self.accept_tx.clone();
        let Some(service) = self.services.get_mut(name) else {
            return;
        };
        let Some(endpoint) = service.config.endpoint.clone() else {
            return;
        };
        let listener = match bind_endpoint(&endpoint) {
            Ok(listener) => listener,
            Err(e) => {
                error!(service = name, error = %e, "endpoint bind failed");
                service.throttle_until =
                    Some(Instant::now() + Duration::from_secs(service.config.respawn_throttle_secs));
                return;
            }
        };
        service.accept_task = Some(tokio::spawn(accept_loop(
            name.to_string(),
            endpoint,
            listener,
            accept_tx,
        )));
        info!(service = name, "accepting connections");
    }

    /// Bring every service up to its target worker count.
    fn maintain(&mut self) {
        let now = Instant::now();
        let mut wanted: Vec<(String, usize)> = Vec::new();
        for (name, service) in &self.services {
            if service.throttled(now) {
                continue;
            }
            let target = service.target();
            if service.workers.len() < target {
                wanted.push((name.clone(), target - service.workers.len()));
            }
        }
        for (name, missing) in wanted {
            for _ in 0..missing {
                self.spawn_for(&name);
            }
        }
    }

    fn handle_exit(&mut self, exit: &WorkerExit) {
        let Some(service) = self.services.get_mut(&exit.service) else {
            return;
        };
        service.workers.remove(&exit.pid);
        if exit.clean || service.stopped {
            debug!(service = %exit.service, pid = exit.pid, "worker exited");
            return;
        }
        warn!(
            service = %exit.service,
            pid = exit.pid,
            uptime_secs = exit.uptime.as_secs(),
            "worker exited abnormally"
        );
        // A worker that keeps dying at startup gets respawned at the
        // throttle rate, not in a tight loop.
        if exit.uptime < FRAGILE_UPTIME {
            service.throttle_until =
                Some(Instant::now() + Duration::from_secs(service.config.respawn_throttle_secs));
            info!(
                service = %exit.service,
                delay_secs = service.config.respawn_throttle_secs,
                "respawn throttled"
            );
        }
    }

    fn terminate_service(service: &Service) {
        for pid in service.workers.keys() {
            terminate_pid(*pid);
        }
    }

    fn handle_command(&mut self, command: MasterCommand) -> Option<bool> {
        match command {
            MasterCommand::Reload(configs) => {
                info!(services = configs.len(), "reloading service registry");
                let mut fresh = HashMap::new();
                for config in configs {
                    match self.services.remove(&config.name) {
                        Some(mut existing) if existing.config.command == config.command => {
                            // Same worker definition: keep the pool, adopt
                            // the new limits.
                            existing.config = config;
                            fresh.insert(existing.config.name.clone(), existing);
                        }
                        Some(existing) => {
                            // Changed definition: drain the old pool, the
                            // replacement spawns on the next maintenance
                            // pass.
                            Self::terminate_service(&existing);
                            drop(existing);
                            match Service::new(config) {
                                Ok(service) => {
                                    fresh.insert(service.config.name.clone(), service);
                                }
                                Err(e) => error!(error = %e, "reload rejected a service"),
                            }
                        }
                        None => match Service::new(config) {
                            Ok(service) => {
                                fresh.insert(service.config.name.clone(), service);
                            }
                            Err(e) => error!(error = %e, "reload rejected a service"),
                        },
                    }
                }
                // Anything left was removed from the configuration.
                for (_, service) in self.services.drain() {
                    Self::terminate_service(&service);
                }
                self.services = fresh;
                // A service reloaded into pool mode stops master-side
                // accepting; its workers own the listener again.
                for service in self.services.values_mut() {
                    if service.config.kind == ProcessKind::Pool {
                        service.stop_accepting();
                    }
                }
                self.maintain();
                self.ensure_accepting();
                None
            }
            MasterCommand::Start(name) => {
                if let Some(service) = self.services.get_mut(&name) {
                    service.stopped = false;
                    info!(service = %name, "service started");
                    self.maintain();
                    self.ensure_accepting();
                } else {
                    warn!(service = %name, "start for unknown service");
                }
                None
            }
            MasterCommand::Stop(name) => {
                if let Some(service) = self.services.get_mut(&name) {
                    service.stopped = true;
                    service.stop_accepting();
                    Self::terminate_service(service);
                    info!(service = %name, "service stopped");
                } else {
                    warn!(service = %name, "stop for unknown service");
                }
                None
            }
            MasterCommand::Shutdown { graceful } => Some(graceful),
        }
    }

    /// Run until a shutdown command or signal arrives.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<MasterCommand>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) -> Result<(), MasterError> {
        info!(services = self.services.len(), "master supervisor started");
        self.maintain();
        self.ensure_accepting();

        let mut sample_timer = interval(Duration::from_secs(SAMPLE_SECS));
        sample_timer.tick().await;
        let mut maintain_timer = interval(Duration::from_secs(1));
        maintain_timer.tick().await;

        let graceful = loop {
            tokio::select! {
                Some(exit) = self.exit_rx.recv() => {
                    self.handle_exit(&exit);
                }
                Some((service, connection)) = self.accept_rx.recv() => {
                    self.spawn_for_connection(&service, connection);
                }
                _ = sample_timer.tick() => {
                    for service in self.services.values_mut() {
                        sample_service(
                            &mut service.sample,
                            service.workers.len(),
                            service.config.peak_processes,
                            service.config.average_processes,
                        );
                    }
                }
                _ = maintain_timer.tick() => {
                    self.maintain();
                }
                command = commands.recv() => {
                    match command {
                        Some(command) => {
                            if let Some(graceful) = self.handle_command(command) {
                                break graceful;
                            }
                        }
                        None => break true,
                    }
                }
                signal = shutdown.recv() => {
                    match signal {
                        Ok(Signal::Reload) => {}
                        Ok(Signal::Shutdown) | Err(_) => break true,
                    }
                }
            }
        };

        self.shutdown(graceful).await;
        Ok(())
    }

    /// Drain (or terminate) every worker and exit.
    async fn shutdown(&mut self, graceful: bool) {
        info!(graceful, "master supervisor shutting down");
        for service in self.services.values_mut() {
            service.stopped = true;
            service.stop_accepting();
        }
        if !graceful {
            for service in self.services.values() {
                Self::terminate_service(service);
            }
        }

        let deadline = Instant::now() + DRAIN_DEADLINE;
        while self.services.values().any(|s| !s.workers.is_empty()) {
            if Instant::now() >= deadline {
                warn!("drain deadline passed, terminating remaining workers");
                for service in self.services.values() {
                    Self::terminate_service(service);
                }
                break;
            }
            match tokio::time::timeout(Duration::from_millis(200), self.exit_rx.recv()).await {
                Ok(Some(exit)) => self.handle_exit(&exit),
                Ok(None) => break,
                Err(_) => {}
            }
        }
        info!("master supervisor stopped");
    }
}

fn terminate_pid(pid: u32) {
    unsafe {
        libc::kill(i32::try_from(pid).unwrap_or_default(), libc::SIGTERM);
    }
}

/// Accept loop run by the master for a one-shot service: each accepted
/// connection is handed back to the supervisor, which forks one worker
/// for it.
async fn accept_loop(
    service: String,
    endpoint: Endpoint,
    listener: OwnedFd,
    accepts: mpsc::UnboundedSender<(String, OwnedFd)>,
) {
    match endpoint {
        Endpoint::Unix(_) => {
            let std_listener = std::os::unix::net::UnixListener::from(listener);
            if std_listener.set_nonblocking(true).is_err() {
                return;
            }
            let Ok(listener) = tokio::net::UnixListener::from_std(std_listener) else {
                return;
            };
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let Ok(stream) = stream.into_std() else {
                            continue;
                        };
                        // The worker expects an ordinary blocking socket.
                        if stream.set_nonblocking(false).is_err() {
                            continue;
                        }
                        if accepts.send((service.clone(), stream.into())).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(service = %service, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        Endpoint::Tcp(_) => {
            let std_listener = std::net::TcpListener::from(listener);
            if std_listener.set_nonblocking(true).is_err() {
                return;
            }
            let Ok(listener) = tokio::net::TcpListener::from_std(std_listener) else {
                return;
            };
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let Ok(stream) = stream.into_std() else {
                            continue;
                        };
                        if stream.set_nonblocking(false).is_err() {
                            continue;
                        }
                        if accepts.send((service.clone(), stream.into())).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(service = %service, error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

fn reap_in_background(
    service: String,
    pid: u32,
    mut child: Child,
    exits: mpsc::UnboundedSender<WorkerExit>,
) {
    tokio::spawn(async move {
        let started = Instant::now();
        let clean = match child.wait().await {
            Ok(status) => status.success(),
            Err(_) => false,
        };
        let _ = exits.send(WorkerExit {
            service,
            pid,
            clean,
            uptime: started.elapsed(),
        });
    });
}
