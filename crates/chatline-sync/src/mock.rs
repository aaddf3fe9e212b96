//! In-memory backend and transport.
//!
//! Used by the integration tests and the replay tool. The backend can
//! fail requests on demand and hold fetches until released, so callers can
//! choose the order in which concurrent requests resolve.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{Semaphore, mpsc};

use crate::backend::{ChatBackend, RealtimeTransport};
use crate::error::{SyncError, SyncResult};
use crate::events::RealtimeEvent;
use crate::message::{ChannelId, Message, MessageId, Nonce, UserId};

/// Transport that delivers whatever is published to it
#[derive(Default)]
pub struct MockTransport {
    subscribers: DashMap<ChannelId, mpsc::Sender<RealtimeEvent>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the channel's subscriber; `false` if nobody listens
    pub async fn publish(&self, channel_id: &ChannelId, event: RealtimeEvent) -> bool {
        // clone out so the map guard is not held across the await
        let tx = self.subscribers.get(channel_id).map(|s| s.clone());
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Whether a channel has a live subscription
    pub fn is_subscribed(&self, channel_id: &ChannelId) -> bool {
        self.subscribers
            .get(channel_id)
            .is_some_and(|s| !s.is_closed())
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.subscribers.iter().filter(|s| !s.is_closed()).count()
    }
}

#[async_trait]
impl RealtimeTransport for MockTransport {
    async fn subscribe(
        &self,
        channel_id: &ChannelId,
        capacity: usize,
    ) -> SyncResult<mpsc::Receiver<RealtimeEvent>> {
        let (tx, rx) = mpsc::channel(capacity);
        self.subscribers.insert(channel_id.clone(), tx);
        Ok(rx)
    }

    async fn unsubscribe(&self, channel_id: &ChannelId) {
        self.subscribers.remove(channel_id);
    }
}

/// Backend keeping messages and read cursors in memory
pub struct MockBackend {
    viewer: UserId,
    /// Ascending by timestamp
    messages: DashMap<ChannelId, Vec<Message>>,
    cursors: DashMap<ChannelId, DateTime<Utc>>,
    transport: Option<Arc<MockTransport>>,
    next_id: AtomicU64,
    fetch_failures: AtomicUsize,
    cursor_failures: AtomicUsize,
    send_failures: AtomicUsize,
    fetch_calls: AtomicUsize,
    paused: AtomicBool,
    gate: Semaphore,
}

impl MockBackend {
    /// Create a backend acting on behalf of `viewer`
    pub fn new(viewer: UserId) -> Self {
        Self {
            viewer,
            messages: DashMap::new(),
            cursors: DashMap::new(),
            transport: None,
            next_id: AtomicU64::new(1),
            fetch_failures: AtomicUsize::new(0),
            cursor_failures: AtomicUsize::new(0),
            send_failures: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            paused: AtomicBool::new(false),
            gate: Semaphore::new(0),
        }
    }

    /// Publish a `MessageCreated` event for every message sent, like a server fan-out
    pub fn with_transport(mut self, transport: Arc<MockTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Store a message as if it had been persisted earlier
    pub fn seed(&self, message: Message) {
        let mut messages = self.messages.entry(message.channel_id.clone()).or_default();
        let pos = messages.partition_point(|m| m.timestamp <= message.timestamp);
        messages.insert(pos, message);
    }

    /// Set the stored read cursor of a channel
    pub fn set_read_cursor(&self, channel_id: &ChannelId, last_read: DateTime<Utc>) {
        self.cursors.insert(channel_id.clone(), last_read);
    }

    /// Fail the next `n` history fetches
    pub fn fail_fetches(&self, n: usize) {
        self.fetch_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` read-cursor fetches
    pub fn fail_cursor_fetches(&self, n: usize) {
        self.cursor_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` sends
    pub fn fail_sends(&self, n: usize) {
        self.send_failures.store(n, Ordering::SeqCst);
    }

    /// Hold history fetches until released
    pub fn pause_fetches(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Let `n` held fetches proceed
    pub fn release_fetches(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// History fetches served so far
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Messages stored for a channel
    pub fn stored(&self, channel_id: &ChannelId) -> usize {
        self.messages.get(channel_id).map_or(0, |m| m.len())
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn fetch_messages(
        &self,
        channel_id: &ChannelId,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> SyncResult<Vec<Message>> {
        if self.paused.load(Ordering::SeqCst) {
            let permit = self.gate.acquire().await.map_err(|_| SyncError::ChannelClosed)?;
            permit.forget();
        }
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.fetch_failures) {
            return Err(SyncError::FetchFailed("injected fetch failure".to_string()));
        }

        let Some(messages) = self.messages.get(channel_id) else {
            return Ok(Vec::new());
        };
        let end = match before {
            Some(before) => messages.partition_point(|m| m.timestamp < before),
            None => messages.len(),
        };
        let start = end.saturating_sub(limit);
        Ok(messages[start..end].iter().rev().cloned().collect())
    }

    async fn fetch_read_cursor(&self, channel_id: &ChannelId) -> SyncResult<Option<DateTime<Utc>>> {
        if Self::take_failure(&self.cursor_failures) {
            return Err(SyncError::FetchFailed("injected cursor failure".to_string()));
        }
        // checkout: hand back the previous cursor and record this visit
        let previous = self.cursors.get(channel_id).map(|c| *c);
        self.cursors.insert(channel_id.clone(), Utc::now());
        Ok(previous)
    }

    async fn mark_read(&self, channel_id: &ChannelId) -> SyncResult<DateTime<Utc>> {
        let now = Utc::now();
        self.cursors.insert(channel_id.clone(), now);
        Ok(now)
    }

    async fn send_message(
        &self,
        channel_id: &ChannelId,
        body: &str,
        nonce: &Nonce,
    ) -> SyncResult<Message> {
        if Self::take_failure(&self.send_failures) {
            return Err(SyncError::SendFailed("injected send failure".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let message = Message::new(
            MessageId::new(format!("srv-{id}")),
            channel_id.clone(),
            self.viewer.clone(),
            body,
            Utc::now(),
        )
        .with_nonce(nonce.clone());
        self.seed(message.clone());

        if let Some(transport) = &self.transport {
            transport
                .publish(
                    channel_id,
                    RealtimeEvent::MessageCreated {
                        message: message.clone(),
                    },
                )
                .await;
        }
        Ok(message)
    }
}
