//! Administrative queue operations, shared by the control service and the
//! CLI: hold, release, flush, and listing.

use std::time::SystemTime;

use postrider_spool::{QueueDirs, QueueId, QueueName, SpoolError};
use tracing::info;

/// Summary of one queued message, for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueListing {
    pub queue: QueueName,
    pub id: QueueId,
}

/// List every message in the incoming, active, deferred, and hold queues.
pub fn list_queues(dirs: &QueueDirs) -> Result<Vec<QueueListing>, SpoolError> {
    let mut listings = Vec::new();
    for queue in [
        QueueName::Incoming,
        QueueName::Active,
        QueueName::Deferred,
        QueueName::Hold,
    ] {
        for id in dirs.scan(queue, None)? {
            listings.push(QueueListing { queue, id });
        }
    }
    Ok(listings)
}

/// Park a message in the hold queue; it is skipped by every scan until
/// released.
pub fn hold_message(dirs: &QueueDirs, id: QueueId) -> Result<(), SpoolError> {
    for queue in [QueueName::Incoming, QueueName::Deferred, QueueName::Active] {
        match dirs.rename(id, queue, QueueName::Hold) {
            Ok(_) => {
                info!(queue_id = %id, from = %queue, "message held");
                return Ok(());
            }
            Err(SpoolError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Err(SpoolError::NotFound(id))
}

/// Release a held message back into the incoming queue.
pub fn release_message(dirs: &QueueDirs, id: QueueId) -> Result<(), SpoolError> {
    dirs.rename(id, QueueName::Hold, QueueName::Incoming)?;
    info!(queue_id = %id, "message released");
    Ok(())
}

/// Drop a held message for good.
pub fn drop_held_message(dirs: &QueueDirs, id: QueueId) -> Result<(), SpoolError> {
    dirs.remove(QueueName::Hold, id)?;
    info!(queue_id = %id, "held message dropped");
    Ok(())
}

/// Make deferred mail eligible immediately by rewinding its retry time.
///
/// With a site, only messages with a pending recipient in that domain are
/// flushed; without one, the whole deferred queue is.
pub fn flush_deferred(dirs: &QueueDirs, site: Option<&str>) -> Result<usize, SpoolError> {
    let mut flushed = 0;
    for id in dirs.scan(QueueName::Deferred, None)? {
        if let Some(site) = site {
            let path = dirs.path(QueueName::Deferred, id);
            let file = match std::fs::File::open(&path) {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let envelope = match crate::MessageEnvelope::read(id, file) {
                Ok(envelope) => envelope,
                // A corrupt deferred file is the scheduler's problem.
                Err(_) => continue,
            };
            let matches = envelope.pending.iter().any(|rcpt| {
                rcpt.domain()
                    .is_some_and(|domain| domain.eq_ignore_ascii_case(site))
            });
            if !matches {
                continue;
            }
        }
        dirs.set_mtime(QueueName::Deferred, id, SystemTime::UNIX_EPOCH)?;
        flushed += 1;
    }
    info!(site = site.unwrap_or("*"), flushed, "deferred queue flushed");
    Ok(flushed)
}
