//! Queue manager errors.

use postrider_rewrite::ResolveError;
use postrider_spool::SpoolError;
use thiserror::Error;

use crate::agent::AgentError;

#[derive(Debug, Error)]
pub enum QmgrError {
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    #[error("resolver error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("delivery agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("cleanup error: {0}")]
    Cleanup(#[from] postrider_cleanup::CleanupError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
