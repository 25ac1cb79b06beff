//! Control server: accepts connections and dispatches commands.

use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use postrider_common::attr::AttrList;
use tokio::{
    io::BufReader,
    net::{UnixListener, UnixStream},
};
use tracing::{debug, info, warn};

use crate::{
    ControlError,
    protocol::{Request, Response},
};

/// Application-side command execution.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, request: Request) -> Response;
}

#[derive(Debug)]
pub struct ControlServer {
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the control endpoint, replacing a stale socket file.
    pub fn bind(path: &Path) -> Result<Self, ControlError> {
        if path.exists() {
            std::fs::remove_file(path).map_err(|e| ControlError::Unavailable(e.to_string()))?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ControlError::Unavailable(e.to_string()))?;
        }
        let listener =
            UnixListener::bind(path).map_err(|e| ControlError::Unavailable(e.to_string()))?;
        info!(path = %path.display(), "control server listening");
        Ok(Self { listener })
    }

    /// Accept and serve until the surrounding task is aborted.
    pub async fn serve(&self, handler: Arc<dyn ControlHandler>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, _)) => {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        if let Err(e) = serve_connection(stream, handler).await {
                            debug!(error = %e, "control connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "control accept failed");
                }
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    handler: Arc<dyn ControlHandler>,
) -> Result<(), ControlError> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    while let Some(attrs) = AttrList::read_from(&mut reader)
        .await
        .map_err(|e| ControlError::Protocol(e.to_string()))?
    {
        let response = match Request::from_attrs(&attrs) {
            Ok(request) => {
                debug!(command = ?request.command, "control request");
                handler.handle(request).await
            }
            Err(e) => Response::error(e.to_string()),
        };
        response
            .to_attrs()
            .write_to(&mut write_half)
            .await
            .map_err(|e| ControlError::Protocol(e.to_string()))?;
    }
    Ok(())
}
