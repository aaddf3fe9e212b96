//! Locally-originated messages that the backend has not confirmed yet

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::message::{ChannelId, Message, Nonce};

/// Delivery status of a local send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendStatus {
    /// Handed to the network layer
    Sending,
    /// The send mutation failed; kept until the user retries or discards it
    Failed,
}

/// A message shown optimistically before the backend confirms it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSend {
    /// Correlation id echoed back on the confirmed message
    pub nonce: Nonce,
    /// Target channel
    pub channel_id: ChannelId,
    /// Text body
    pub body: String,
    /// Client clock at creation
    pub timestamp: DateTime<Utc>,
    /// Delivery status
    pub status: SendStatus,
}

/// Pending sends per channel, in creation order
#[derive(Debug, Default)]
pub struct PendingSends {
    channels: HashMap<ChannelId, Vec<PendingSend>>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new send and return its nonce
    pub fn add(&mut self, channel_id: &ChannelId, body: impl Into<String>) -> Nonce {
        self.add_at(channel_id, body, Utc::now())
    }

    /// Track a new send created at `timestamp`
    pub fn add_at(
        &mut self,
        channel_id: &ChannelId,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Nonce {
        let nonce = Nonce::generate();
        self.channels
            .entry(channel_id.clone())
            .or_default()
            .push(PendingSend {
                nonce: nonce.clone(),
                channel_id: channel_id.clone(),
                body: body.into(),
                timestamp,
                status: SendStatus::Sending,
            });
        nonce
    }

    fn find_mut(&mut self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<&mut PendingSend> {
        self.channels
            .get_mut(channel_id)
            .and_then(|sends| sends.iter_mut().find(|p| &p.nonce == nonce))
            .ok_or_else(|| SyncError::PendingNotFound {
                nonce: nonce.clone(),
            })
    }

    /// Mark a send as failed
    pub fn mark_failed(&mut self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<()> {
        self.find_mut(channel_id, nonce)?.status = SendStatus::Failed;
        Ok(())
    }

    /// Put a failed send back into `Sending` and return a copy for re-sending
    pub fn mark_sending(&mut self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<PendingSend> {
        let pending = self.find_mut(channel_id, nonce)?;
        pending.status = SendStatus::Sending;
        Ok(pending.clone())
    }

    /// Discard a send at the user's request
    pub fn remove(&mut self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<PendingSend> {
        let sends = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| SyncError::PendingNotFound {
                nonce: nonce.clone(),
            })?;
        let idx = sends
            .iter()
            .position(|p| &p.nonce == nonce)
            .ok_or_else(|| SyncError::PendingNotFound {
                nonce: nonce.clone(),
            })?;
        Ok(sends.remove(idx))
    }

    /// Drop the pending send confirmed by `message`, if it came from this client.
    ///
    /// Matches on exact nonce only; a message without a nonce, or with a
    /// nonce unknown here, is someone else's and is left alone.
    pub fn reconcile(&mut self, channel_id: &ChannelId, message: &Message) -> Option<PendingSend> {
        let nonce = message.nonce.as_ref()?;
        let sends = self.channels.get_mut(channel_id)?;
        let idx = sends.iter().position(|p| &p.nonce == nonce)?;
        debug!(%channel_id, %nonce, message_id = %message.id, "pending send confirmed");
        Some(sends.remove(idx))
    }

    /// Pending sends of a channel, oldest first
    pub fn get(&self, channel_id: &ChannelId) -> &[PendingSend] {
        self.channels
            .get(channel_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Look up a single pending send
    pub fn find(&self, channel_id: &ChannelId, nonce: &Nonce) -> Option<&PendingSend> {
        self.get(channel_id).iter().find(|p| &p.nonce == nonce)
    }

    /// Count of pending sends across all channels
    pub fn total_count(&self) -> usize {
        self.channels.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UserId;

    fn channel() -> ChannelId {
        ChannelId::new("general")
    }

    fn confirmed(id: &str, nonce: Option<Nonce>) -> Message {
        let msg = Message::new(id, channel(), UserId::new("me"), "hello", Utc::now());
        match nonce {
            Some(n) => msg.with_nonce(n),
            None => msg,
        }
    }

    #[test]
    fn test_add_starts_sending() {
        let mut pending = PendingSends::new();
        let nonce = pending.add(&channel(), "hello");

        let send = pending.find(&channel(), &nonce).unwrap();
        assert_eq!(send.status, SendStatus::Sending);
        assert_eq!(send.body, "hello");
    }

    #[test]
    fn test_reconcile_removes_exactly_one() {
        let mut pending = PendingSends::new();
        let n1 = pending.add(&channel(), "hello");
        let n2 = pending.add(&channel(), "hello");

        let removed = pending.reconcile(&channel(), &confirmed("m1", Some(n1.clone())));
        assert_eq!(removed.unwrap().nonce, n1);
        assert_eq!(pending.get(&channel()).len(), 1);
        assert_eq!(pending.get(&channel())[0].nonce, n2);
    }

    #[test]
    fn test_reconcile_ignores_foreign_messages() {
        let mut pending = PendingSends::new();
        pending.add(&channel(), "hello");

        // same body, no nonce: must not be treated as ours
        assert!(pending.reconcile(&channel(), &confirmed("m1", None)).is_none());
        let other = Nonce::from_string("someone-else");
        assert!(pending.reconcile(&channel(), &confirmed("m2", Some(other))).is_none());
        assert_eq!(pending.get(&channel()).len(), 1);
    }

    #[test]
    fn test_failed_is_kept_until_removed() {
        let mut pending = PendingSends::new();
        let nonce = pending.add(&channel(), "hello");

        pending.mark_failed(&channel(), &nonce).unwrap();
        assert_eq!(
            pending.find(&channel(), &nonce).unwrap().status,
            SendStatus::Failed
        );

        let retried = pending.mark_sending(&channel(), &nonce).unwrap();
        assert_eq!(retried.status, SendStatus::Sending);

        pending.remove(&channel(), &nonce).unwrap();
        assert!(pending.get(&channel()).is_empty());
        assert_eq!(
            pending.remove(&channel(), &nonce),
            Err(SyncError::PendingNotFound { nonce })
        );
    }

    #[test]
    fn test_channels_are_independent() {
        let mut pending = PendingSends::new();
        let other = ChannelId::new("random");
        let nonce = pending.add(&channel(), "hello");
        pending.add(&other, "hi");

        assert!(pending.reconcile(&other, &confirmed("m1", Some(nonce))).is_none());
        assert_eq!(pending.total_count(), 2);
    }
}
