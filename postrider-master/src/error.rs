//! Supervisor errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MasterError {
    /// A service definition is unusable.
    #[error("bad service configuration for {service}: {reason}")]
    Config { service: String, reason: String },

    /// No such service in the registry.
    #[error("unknown service: {0}")]
    UnknownService(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MasterError {
    pub fn config(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            service: service.into(),
            reason: reason.into(),
        }
    }
}
