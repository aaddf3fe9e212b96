//! Error types for chatline-sync

use thiserror::Error;

use crate::message::{ChannelId, Nonce};

/// Errors that can occur in the sync core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// A history or read-cursor fetch failed; retriable by explicit user action
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// A load-older request is already in flight for this channel
    #[error("already loading older history for channel {channel_id}")]
    AlreadyLoading { channel_id: ChannelId },

    /// Sending a message failed; the pending send stays visible as failed
    #[error("send failed: {0}")]
    SendFailed(String),

    /// A response arrived for a superseded request and was dropped
    #[error("stale response discarded for channel {channel_id} (generation {generation})")]
    StaleResponseDiscarded { channel_id: ChannelId, generation: u64 },

    /// Channel has never been opened in this session
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    /// No pending send with this nonce
    #[error("pending send not found: {nonce}")]
    PendingNotFound { nonce: Nonce },

    /// Realtime subscription could not be established
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Configuration rejected by validation
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The session has logged out or its loop has stopped
    #[error("session closed")]
    SessionClosed,

    /// An internal channel was closed
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Whether an explicit retry by the user can succeed
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SyncError::FetchFailed(_) | SyncError::SendFailed(_) | SyncError::SubscriptionFailed(_)
        )
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for SyncError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        SyncError::SessionClosed
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for SyncError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        SyncError::SessionClosed
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(SyncError::FetchFailed("timeout".into()).is_retriable());
        assert!(SyncError::SendFailed("500".into()).is_retriable());
        assert!(!SyncError::SessionClosed.is_retriable());
        assert!(
            !SyncError::AlreadyLoading {
                channel_id: ChannelId::new("c")
            }
            .is_retriable()
        );
    }

    #[test]
    fn test_display() {
        let err = SyncError::StaleResponseDiscarded {
            channel_id: ChannelId::new("general"),
            generation: 3,
        };
        assert_eq!(
            err.to_string(),
            "stale response discarded for channel general (generation 3)"
        );
    }
}
