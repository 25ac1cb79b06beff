//! Cleanup errors.

use postrider_maps::MapError;
use postrider_rewrite::ResolveError;
use postrider_spool::SpoolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CleanupError {
    /// Queue file I/O failed; the message must be aborted and resubmitted.
    #[error("spool error: {0}")]
    Spool(#[from] SpoolError),

    /// Address rewriting failed transiently (table lookup); resubmit later.
    #[error("rewrite error: {0}")]
    Rewrite(#[from] ResolveError),

    /// Map lookup failed transiently; resubmit later.
    #[error("map error: {0}")]
    Map(#[from] MapError),

    /// Records arrived that violate the protocol in a way that cannot be
    /// flagged and drained, e.g. records after END.
    #[error("protocol violation: {0}")]
    Protocol(String),
}
