//! Control protocol types.

use postrider_common::attr::AttrList;
use postrider_spool::QueueId;

use crate::ControlError;

/// Administrative commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List queued messages.
    List,
    /// Make deferred mail eligible now, optionally for one site.
    Flush { site: Option<String> },
    /// Park a message in the hold queue.
    Hold { id: QueueId },
    /// Release a held message.
    Release { id: QueueId },
    /// Drop a held message for good.
    DropHeld { id: QueueId },
    /// Reload the configuration.
    Reload,
    /// Service status summary.
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
}

/// Line-oriented response: either an error, or zero or more result lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub error: Option<String>,
    pub lines: Vec<String>,
}

impl Request {
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self { command }
    }

    #[must_use]
    pub fn to_attrs(&self) -> AttrList {
        let mut attrs = AttrList::new();
        match &self.command {
            Command::List => {
                attrs.set_str("command", "list");
            }
            Command::Flush { site } => {
                attrs.set_str("command", "flush");
                if let Some(site) = site {
                    attrs.set_str("site", site.clone());
                }
            }
            Command::Hold { id } => {
                attrs.set_str("command", "hold").set_str("queue_id", id.to_string());
            }
            Command::Release { id } => {
                attrs
                    .set_str("command", "release")
                    .set_str("queue_id", id.to_string());
            }
            Command::DropHeld { id } => {
                attrs
                    .set_str("command", "drop_held")
                    .set_str("queue_id", id.to_string());
            }
            Command::Reload => {
                attrs.set_str("command", "reload");
            }
            Command::Status => {
                attrs.set_str("command", "status");
            }
        }
        attrs
    }

    pub fn from_attrs(attrs: &AttrList) -> Result<Self, ControlError> {
        let command = attrs
            .get_str("command")
            .map_err(|e| ControlError::Protocol(e.to_string()))?;
        let queue_id = || {
            let text = attrs
                .get_str("queue_id")
                .map_err(|e| ControlError::Protocol(e.to_string()))?;
            QueueId::from_file_name(text)
                .ok_or_else(|| ControlError::Protocol(format!("bad queue id {text:?}")))
        };
        let command = match command {
            "list" => Command::List,
            "flush" => Command::Flush {
                site: attrs.get_str("site").ok().map(str::to_string),
            },
            "hold" => Command::Hold { id: queue_id()? },
            "release" => Command::Release { id: queue_id()? },
            "drop_held" => Command::DropHeld { id: queue_id()? },
            "reload" => Command::Reload,
            "status" => Command::Status,
            other => return Err(ControlError::Protocol(format!("unknown command {other:?}"))),
        };
        Ok(Self { command })
    }
}

impl Response {
    #[must_use]
    pub fn ok(lines: Vec<String>) -> Self {
        Self { error: None, lines }
    }

    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            lines: Vec::new(),
        }
    }

    #[must_use]
    pub fn to_attrs(&self) -> AttrList {
        let mut attrs = AttrList::new();
        match &self.error {
            Some(message) => {
                attrs.set_str("status", "error").set_str("message", message.clone());
            }
            None => {
                attrs.set_str("status", "ok");
                if !self.lines.is_empty() {
                    attrs.set_list("line", self.lines.clone());
                }
            }
        }
        attrs
    }

    pub fn from_attrs(attrs: &AttrList) -> Result<Self, ControlError> {
        match attrs.get_str("status") {
            Ok("ok") => Ok(Self::ok(attrs.get_list("line"))),
            Ok("error") => Ok(Self::error(
                attrs.get_str("message").unwrap_or("unspecified error"),
            )),
            Ok(other) => Err(ControlError::Protocol(format!("unknown status {other:?}"))),
            Err(e) => Err(ControlError::Protocol(e.to_string())),
        }
    }
}
