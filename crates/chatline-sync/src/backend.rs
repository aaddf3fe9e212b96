//! Collaborator interfaces: the chat backend and the realtime transport

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::SyncResult;
use crate::events::RealtimeEvent;
use crate::message::{ChannelId, Message, Nonce};

/// Request/response API of the chat backend
#[async_trait]
pub trait ChatBackend: Send + Sync + 'static {
    /// Up to `limit` messages older than `before` (or the most recent ones
    /// when `before` is `None`), newest first
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> SyncResult<Vec<Message>>;

    /// Last-read instant of the viewing user
    async fn fetch_read_cursor(&self, channel_id: &ChannelId) -> SyncResult<Option<DateTime<Utc>>>;

    /// Mark the channel read up to now; returns the instant recorded
    async fn mark_read(&self, channel_id: &ChannelId) -> SyncResult<DateTime<Utc>>;

    /// Persist a message; the returned message echoes `nonce`
    async fn send_message(
        &self,
        channel_id: &ChannelId,
        body: &str,
        nonce: &Nonce,
    ) -> SyncResult<Message>;
}

/// Push subscription per channel
#[async_trait]
pub trait RealtimeTransport: Send + Sync + 'static {
    /// Start receiving events of a channel through a queue bounded at `capacity`
    async fn subscribe(
        &self,
        channel_id: &ChannelId,
        capacity: usize,
    ) -> SyncResult<mpsc::Receiver<RealtimeEvent>>;

    /// Stop delivering events of a channel
    async fn unsubscribe(&self, channel_id: &ChannelId);
}
