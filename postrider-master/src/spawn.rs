//! Worker process spawning.
//!
//! Children inherit the service listener on a fixed descriptor and the
//! flow-control pipe ends on two more, all other descriptors stay
//! close-on-exec. Privileges drop after fork, before exec.

use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

use tokio::process::{Child, Command};
use tracing::debug;

use crate::{MasterError, service::ServiceConfig};

/// Descriptor the inherited listener lands on.
pub const LISTEN_FD: RawFd = 6;
/// Descriptor a single accepted connection lands on (one-shot workers).
pub const CONN_FD: RawFd = 7;
/// Descriptor of the flow-pipe consuming end.
pub const FLOW_READ_FD: RawFd = 3;
/// Descriptor of the flow-pipe producing end.
pub const FLOW_WRITE_FD: RawFd = 4;

/// Environment variable telling workers which descriptors they inherited.
pub const LISTEN_ENV: &str = "POSTRIDER_LISTEN_FD";
pub const CONN_ENV: &str = "POSTRIDER_CONN_FD";
pub const FLOW_ENV: &str = "POSTRIDER_FLOW_FDS";

/// Descriptors a worker inherits beyond stdio.
///
/// Pool workers get the service listener and accept for themselves;
/// one-shot workers get one connection the master already accepted.
#[derive(Debug, Clone, Copy, Default)]
pub struct Inherited<'a> {
    pub listener: Option<BorrowedFd<'a>>,
    pub connection: Option<BorrowedFd<'a>>,
    pub flow_read: Option<BorrowedFd<'a>>,
    pub flow_write: Option<BorrowedFd<'a>>,
}

/// Spawn one worker for a service.
pub fn spawn_worker(config: &ServiceConfig, inherited: Inherited<'_>) -> Result<Child, MasterError> {
    let mut command = Command::new(&config.command[0]);
    command.args(&config.command[1..]);
    if let Some(dir) = &config.directory {
        command.current_dir(dir);
    }
    if inherited.listener.is_some() {
        command.env(LISTEN_ENV, LISTEN_FD.to_string());
    }
    if inherited.connection.is_some() {
        command.env(CONN_ENV, CONN_FD.to_string());
    }
    if inherited.flow_read.is_some() || inherited.flow_write.is_some() {
        command.env(FLOW_ENV, format!("{FLOW_READ_FD},{FLOW_WRITE_FD}"));
    }

    let uid = config.uid;
    let gid = config.gid;
    let listener = inherited.listener.map(|fd| fd.as_raw_fd());
    let connection = inherited.connection.map(|fd| fd.as_raw_fd());
    let flow_read = inherited.flow_read.map(|fd| fd.as_raw_fd());
    let flow_write = inherited.flow_write.map(|fd| fd.as_raw_fd());

    // After fork, before exec: remap the inherited descriptors onto their
    // fixed numbers (dup2 clears close-on-exec on the copy), then shed
    // privileges, group first.
    unsafe {
        command.pre_exec(move || {
            if let Some(fd) = listener {
                dup_onto(fd, LISTEN_FD)?;
            }
            if let Some(fd) = connection {
                dup_onto(fd, CONN_FD)?;
            }
            if let Some(fd) = flow_read {
                dup_onto(fd, FLOW_READ_FD)?;
            }
            if let Some(fd) = flow_write {
                dup_onto(fd, FLOW_WRITE_FD)?;
            }
            if let Some(gid) = gid {
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(uid) = uid {
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let child = command.spawn()?;
    debug!(service = %config.name, pid = child.id(), "worker spawned");
    Ok(child)
}

fn dup_onto(fd: RawFd, target: RawFd) -> std::io::Result<()> {
    if fd == target {
        // Already in place; just clear close-on-exec.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        return Ok(());
    }
    if unsafe { libc::dup2(fd, target) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Ask a worker to finish up and exit.
pub fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(
                i32::try_from(pid).unwrap_or_default(),
                libc::SIGTERM,
            );
        }
    }
}
