//! Named queue directories with a hashed layout.
//!
//! A queue id maps to `<queue>/<d1>/<d2>/<id>` using its first two
//! characters, keeping directories small under load. Moves between queues
//! are renames within one filesystem and therefore atomic.

use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tracing::debug;

use crate::{QueueId, SpoolError};

/// The named queues a message may occupy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    /// Sealed by cleanup, waiting for the queue manager.
    Incoming,
    /// Owned by the queue manager, being scheduled.
    Active,
    /// Waiting out a retry interval.
    Deferred,
    /// Parked until an operator releases it.
    Hold,
    /// Per-message bounce logfiles.
    Bounce,
    /// Per-message defer logfiles.
    Defer,
    /// Failed validation; kept for inspection.
    Corrupt,
}

impl QueueName {
    pub const ALL: [Self; 7] = [
        Self::Incoming,
        Self::Active,
        Self::Deferred,
        Self::Hold,
        Self::Bounce,
        Self::Defer,
        Self::Corrupt,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Incoming => "incoming",
            Self::Active => "active",
            Self::Deferred => "deferred",
            Self::Hold => "hold",
            Self::Bounce => "bounce",
            Self::Defer => "defer",
            Self::Corrupt => "corrupt",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle on the spool directory tree.
#[derive(Debug, Clone)]
pub struct QueueDirs {
    root: PathBuf,
}

impl QueueDirs {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create every queue directory; idempotent.
    pub fn init(&self) -> Result<(), SpoolError> {
        for queue in QueueName::ALL {
            fs::create_dir_all(self.root.join(queue.as_str()))?;
        }
        fs::create_dir_all(self.root.join("public"))?;
        Ok(())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Hashed path of a queue file.
    #[must_use]
    pub fn path(&self, queue: QueueName, id: QueueId) -> PathBuf {
        let name = id.to_string();
        let mut bytes = name.bytes();
        let d1 = char::from(bytes.next().unwrap_or(b'0'));
        let d2 = char::from(bytes.next().unwrap_or(b'0'));
        self.root
            .join(queue.as_str())
            .join(d1.to_string())
            .join(d2.to_string())
            .join(name)
    }

    /// Create the hash subdirectories for a queue file path.
    pub fn ensure_parent(&self, queue: QueueName, id: QueueId) -> Result<PathBuf, SpoolError> {
        let path = self.path(queue, id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(path)
    }

    /// Atomically move a queue file between queues.
    pub fn rename(
        &self,
        id: QueueId,
        from: QueueName,
        to: QueueName,
    ) -> Result<PathBuf, SpoolError> {
        let src = self.path(from, id);
        if !src.exists() {
            return Err(SpoolError::NotFound(id));
        }
        let dst = self.ensure_parent(to, id)?;
        fs::rename(&src, &dst)?;
        debug!(queue_id = %id, from = %from, to = %to, "queue file moved");
        Ok(dst)
    }

    pub fn remove(&self, queue: QueueName, id: QueueId) -> Result<(), SpoolError> {
        let path = self.path(queue, id);
        if !path.exists() {
            return Err(SpoolError::NotFound(id));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    /// Set a queue file's mtime, used to encode the next retry time of a
    /// deferred message.
    pub fn set_mtime(
        &self,
        queue: QueueName,
        id: QueueId,
        when: SystemTime,
    ) -> Result<(), SpoolError> {
        let path = self.path(queue, id);
        let file = fs::File::options().append(true).open(&path)?;
        file.set_modified(when)?;
        Ok(())
    }

    /// Enumerate queue files whose mtime is at or before `eligible_before`.
    ///
    /// Passing `None` lists the whole queue. Files that vanish mid-scan lost
    /// a race with another move and are skipped.
    pub fn scan(
        &self,
        queue: QueueName,
        eligible_before: Option<SystemTime>,
    ) -> Result<Vec<QueueId>, SpoolError> {
        let mut found = Vec::new();
        let queue_root = self.root.join(queue.as_str());
        if !queue_root.exists() {
            return Ok(found);
        }
        let mut stack = vec![queue_root];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Some(id) = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .and_then(QueueId::from_file_name)
                else {
                    continue;
                };
                if let Some(deadline) = eligible_before {
                    match entry.metadata().and_then(|m| m.modified()) {
                        Ok(mtime) if mtime > deadline => continue,
                        Ok(_) => {}
                        Err(_) => continue,
                    }
                }
                found.push(id);
            }
        }
        found.sort();
        Ok(found)
    }
}
