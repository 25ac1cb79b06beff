//! One-shot wakeup messages between services.
//!
//! A trigger is a short byte payload sent to a named datagram endpoint.
//! Delivery is best effort; receivers treat every wake as "scan for any
//! work", so coalesced or duplicated triggers are harmless.

use std::{path::Path, time::Duration};

use tokio::{net::UnixDatagram, time::timeout};
use tracing::debug;

use crate::error::TriggerError;

/// Wake the queue manager to scan the incoming and deferred queues.
pub const TRIGGER_SCAN: u8 = b'W';
/// Wake the queue manager and move deferred mail for one site back into
/// rotation. The site name follows the command byte.
pub const TRIGGER_FLUSH: u8 = b'F';

const SEND_ATTEMPTS: u32 = 2;

/// Send a trigger payload to `path`, retrying once if nobody was listening
/// the first time.
pub async fn send_trigger(
    path: &Path,
    payload: &[u8],
    deadline: Duration,
) -> Result<(), TriggerError> {
    let mut last_err = None;
    for attempt in 0..SEND_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let socket = UnixDatagram::unbound()?;
        match timeout(deadline, socket.send_to(payload, path)).await {
            Err(_) => return Err(TriggerError::Timeout(deadline)),
            Ok(Ok(_)) => {
                debug!(path = %path.display(), len = payload.len(), "trigger sent");
                return Ok(());
            }
            Ok(Err(e)) => last_err = Some(e),
        }
    }
    Err(TriggerError::Unavailable(last_err.unwrap_or_else(|| {
        std::io::Error::other("trigger send failed")
    })))
}

/// Receiving side of a trigger endpoint.
#[derive(Debug)]
pub struct TriggerListener {
    socket: UnixDatagram,
}

impl TriggerListener {
    /// Bind the endpoint, replacing any stale socket file left behind by a
    /// previous instance.
    pub fn bind(path: &Path) -> Result<Self, TriggerError> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let socket = UnixDatagram::bind(path)?;
        Ok(Self { socket })
    }

    /// Wait for the next trigger and return its payload.
    pub async fn recv(&self) -> Result<Vec<u8>, TriggerError> {
        let mut buf = [0u8; 256];
        let n = self.socket.recv(&mut buf).await?;
        Ok(buf[..n].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_round_trip() {
        let dir = std::env::temp_dir().join(format!("postrider-trigger-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("qmgr");

        let listener = TriggerListener::bind(&path).unwrap();
        send_trigger(&path, &[TRIGGER_SCAN], Duration::from_secs(1))
            .await
            .unwrap();

        let payload = listener.recv().await.unwrap();
        assert_eq!(payload, vec![TRIGGER_SCAN]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn send_without_listener_reports_unavailable() {
        let path = std::env::temp_dir().join("postrider-no-listener");
        let err = send_trigger(&path, &[TRIGGER_SCAN], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TriggerError::Unavailable(_)));
    }
}
