//! Error taxonomy for the batch dispatch layer.
//!
//! Three classes matter to callers: fatal-to-query errors (cancellation,
//! shutdown, kill, unsupported options, topology failures, exhausted backoff),
//! per-task fatal errors delivered as a single error-bearing result on the
//! queue, and retryable conditions that are consumed silently inside the
//! worker loop and never surface.

use thiserror::Error;

use crate::backoff::BackoffKind;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The caller cancelled its context, or the in-flight RPC was cancelled.
    #[error("request cancelled by caller")]
    Cancelled,

    /// The process-wide shutdown flag was observed at send time.
    #[error("server is shutting down")]
    ShuttingDown,

    /// The per-query kill flag was observed at the liveness tick.
    #[error("query interrupted")]
    QueryInterrupted,

    /// Batch dispatch cannot serve ordered or descending scans.
    #[error("batch dispatch cannot provide keep-order or desc property")]
    OrderUnsupported,

    /// A backoff budget ran out; carries the error that forced the last cycle.
    #[error("{kind} backoff exhausted after {total_sleep_ms} ms: {cause}")]
    BackoffExhausted {
        kind: BackoffKind,
        total_sleep_ms: u64,
        cause: anyhow::Error,
    },

    /// Internal failure inside the topology cache; fatal to the plan.
    #[error("topology cache error: {0}")]
    Topology(anyhow::Error),

    /// A streaming response died mid-flight and the stream cannot be resumed.
    #[error("storage node timeout, store: {addr}")]
    ServerTimeout { addr: String },

    /// Protocol-level error string reported by the storage node.
    #[error("other error: {reason}")]
    Other { reason: String },

    /// Transport-level failure; normally consumed by the retry path and only
    /// surfaced when retrying is not allowed.
    #[error("transport error: {0}")]
    Transport(anyhow::Error),
}

impl DispatchError {
    /// Fatal conditions that must never be retried by the sender.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::ShuttingDown | Self::QueryInterrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(DispatchError::Cancelled.is_fatal());
        assert!(DispatchError::ShuttingDown.is_fatal());
        assert!(!DispatchError::ServerTimeout {
            addr: "s1".to_string()
        }
        .is_fatal());
    }
}
