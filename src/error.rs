//! Error taxonomy for the protocol engine (spec.md §7).
//!
//! Transient I/O, protocol duplicates, and protocol gaps are all handled internally and never
//! surfaced to callers. `PwError` exists so that `connect`/`connected` can distinguish the one
//! class of error the application must react to (`Unrecoverable`) from everything else.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PwError {
    /// The peer can no longer reconstruct the stream: it asked us to resend chunks we've
    /// already pruned from our journal, or it told us the same about itself (RESEND-ERROR).
    /// The caller must tear down the engine; reconnecting would not help.
    #[error("B91221 {log_id} unrecoverable: {reason}")]
    Unrecoverable { log_id: String, reason: String },
}

impl PwError {
    pub fn unrecoverable(log_id: impl Into<String>, reason: impl Into<String>) -> Self {
        PwError::Unrecoverable {
            log_id: log_id.into(),
            reason: reason.into(),
        }
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, PwError::Unrecoverable { .. })
    }
}
