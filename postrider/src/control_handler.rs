//! Command execution behind the control socket.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use postrider_common::{Runtime, Signal};
use postrider_control::{Command, ControlHandler, Request, Response};
use postrider_qmgr::{QueueManager, ops};
use postrider_spool::QueueDirs;
use tokio::sync::broadcast;
use tracing::warn;

use crate::AppConfig;

/// Handler wired into the queue manager process.
pub struct Handler {
    pub runtime: Arc<Runtime>,
    pub dirs: QueueDirs,
    pub manager: Arc<QueueManager>,
    pub config_dir: PathBuf,
    pub signals: broadcast::Sender<Signal>,
}

#[async_trait]
impl ControlHandler for Handler {
    async fn handle(&self, request: Request) -> Response {
        match request.command {
            Command::List => match ops::list_queues(&self.dirs) {
                Ok(listings) => Response::ok(
                    listings
                        .into_iter()
                        .map(|l| format!("{} {}", l.queue, l.id))
                        .collect(),
                ),
                Err(e) => Response::error(e.to_string()),
            },
            Command::Flush { site } => match self.manager.flush(site.as_deref()) {
                Ok(count) => Response::ok(vec![format!("flushed {count} messages")]),
                Err(e) => Response::error(e.to_string()),
            },
            Command::Hold { id } => match ops::hold_message(&self.dirs, id) {
                Ok(()) => Response::ok(vec![]),
                Err(e) => Response::error(e.to_string()),
            },
            Command::Release { id } => match ops::release_message(&self.dirs, id) {
                Ok(()) => Response::ok(vec![]),
                Err(e) => Response::error(e.to_string()),
            },
            Command::DropHeld { id } => match ops::drop_held_message(&self.dirs, id) {
                Ok(()) => Response::ok(vec![]),
                Err(e) => Response::error(e.to_string()),
            },
            Command::Reload => match AppConfig::load(&self.config_dir) {
                Ok(config) => {
                    self.runtime.reload(config.params);
                    if let Err(e) = self.signals.send(Signal::Reload) {
                        warn!(error = %e, "no reload listeners");
                    }
                    Response::ok(vec!["configuration reloaded".to_string()])
                }
                Err(e) => Response::error(format!("reload failed: {e}")),
            },
            Command::Status => {
                let mut lines = Vec::new();
                match ops::list_queues(&self.dirs) {
                    Ok(listings) => {
                        for queue in ["incoming", "active", "deferred", "hold"] {
                            let count = listings
                                .iter()
                                .filter(|l| l.queue.as_str() == queue)
                                .count();
                            lines.push(format!("{queue}: {count}"));
                        }
                    }
                    Err(e) => return Response::error(e.to_string()),
                }
                Response::ok(lines)
            }
        }
    }
}
