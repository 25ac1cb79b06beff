//! Delivery agent interface.
//!
//! An agent owns the destination protocol; the queue manager only hands it
//! a request and collects per-recipient statuses. Agents are reached over
//! named local endpoints; the connection is reused while the scheduler has
//! more batches for the same destination.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use postrider_common::attr::AttrList;
use thiserror::Error;
use tokio::{
    io::BufReader,
    net::{UnixListener, UnixStream},
    time::timeout,
};
use tracing::{debug, warn};

use crate::request::{DeliveryReply, DeliveryRequest};

#[derive(Debug, Error)]
pub enum AgentError {
    /// The agent endpoint is unreachable; a soft failure.
    #[error("agent unavailable: {0}")]
    Unavailable(std::io::Error),

    /// No reply within the request deadline; all outstanding recipients
    /// are treated as soft failures.
    #[error("agent timed out after {0:?}")]
    Timeout(Duration),

    /// The agent replied with something unparseable.
    #[error("agent protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One delivery hand-off to an agent for a given transport.
#[async_trait]
pub trait DeliveryAgent: Send + Sync {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReply, AgentError>;
}

/// Produces agent handles per transport name.
///
/// The production connector dials local sockets; tests plug in mocks.
pub trait AgentConnector: Send + Sync + std::fmt::Debug {
    fn connect(&self, transport: &str) -> Arc<dyn DeliveryAgent>;
}

/// Dials `<public>/transport-<name>` per request.
#[derive(Debug)]
pub struct SocketConnector {
    public_dir: PathBuf,
    request_timeout: Duration,
}

impl SocketConnector {
    #[must_use]
    pub const fn new(public_dir: PathBuf, request_timeout: Duration) -> Self {
        Self {
            public_dir,
            request_timeout,
        }
    }

    #[must_use]
    pub fn endpoint(&self, transport: &str) -> PathBuf {
        self.public_dir.join(format!("transport-{transport}"))
    }
}

impl AgentConnector for SocketConnector {
    fn connect(&self, transport: &str) -> Arc<dyn DeliveryAgent> {
        Arc::new(SocketAgent {
            path: self.endpoint(transport),
            request_timeout: self.request_timeout,
            connection: tokio::sync::Mutex::new(None),
        })
    }
}

type Connection = (
    BufReader<tokio::net::unix::OwnedReadHalf>,
    tokio::net::unix::OwnedWriteHalf,
);

/// Agent handle speaking the attribute protocol over a unix socket.
///
/// The connection persists across requests; the scheduler reuses the same
/// handle while it has more batches for one destination.
#[derive(Debug)]
struct SocketAgent {
    path: PathBuf,
    request_timeout: Duration,
    connection: tokio::sync::Mutex<Option<Connection>>,
}

#[async_trait]
impl DeliveryAgent for SocketAgent {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReply, AgentError> {
        let deadline = self.request_timeout;
        let mut slot = self.connection.lock().await;
        let exchange = async {
            if slot.is_none() {
                let stream = UnixStream::connect(&self.path)
                    .await
                    .map_err(AgentError::Unavailable)?;
                let (read_half, write_half) = stream.into_split();
                *slot = Some((BufReader::new(read_half), write_half));
            }
            let (reader, writer) = slot.as_mut().unwrap_or_else(|| unreachable!());
            request
                .to_attrs()
                .write_to(writer)
                .await
                .map_err(|e| AgentError::Protocol(e.to_string()))?;

            let attrs = AttrList::read_from(reader)
                .await
                .map_err(|e| AgentError::Protocol(e.to_string()))?
                .ok_or_else(|| AgentError::Protocol("agent closed the stream".to_string()))?;
            DeliveryReply::from_attrs(&attrs).map_err(|e| AgentError::Protocol(e.to_string()))
        };
        match timeout(deadline, exchange).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                *slot = None;
                Err(e)
            }
            Err(_) => {
                *slot = None;
                warn!(path = %self.path.display(), "delivery request timed out");
                Err(AgentError::Timeout(deadline))
            }
        }
    }
}

/// Serving side used by delivery agent processes (and tests): accepts
/// connections on a named endpoint and answers each request through the
/// supplied agent implementation.
#[derive(Debug)]
pub struct AgentServer {
    listener: UnixListener,
}

impl AgentServer {
    /// Bind the endpoint, replacing a stale socket file.
    pub fn bind(path: &PathBuf) -> Result<Self, AgentError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            listener: UnixListener::bind(path)?,
        })
    }

    /// Accept and serve requests until the task is aborted.
    pub async fn serve(&self, agent: Arc<dyn DeliveryAgent>) -> Result<(), AgentError> {
        loop {
            let (stream, _) = self.listener.accept().await?;
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(stream, agent).await {
                    debug!(error = %e, "agent connection ended");
                }
            });
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    agent: Arc<dyn DeliveryAgent>,
) -> Result<(), AgentError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    // The connection is reused for consecutive requests to the same
    // destination; each request is one attribute list.
    while let Some(attrs) = AttrList::read_from(&mut reader)
        .await
        .map_err(|e| AgentError::Protocol(e.to_string()))?
    {
        let request = DeliveryRequest::from_attrs(&attrs)
            .map_err(|e| AgentError::Protocol(e.to_string()))?;
        let reply = agent.deliver(request).await?;
        reply
            .to_attrs()
            .write_to(&mut write_half)
            .await
            .map_err(|e| AgentError::Protocol(e.to_string()))?;
    }
    Ok(())
}
