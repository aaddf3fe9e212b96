//! Push events consumed by the reconciler and notifications it emits

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{ChannelId, Message, UserId};

/// Presence state of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Presence {
    /// Connected
    Online,
    /// Disconnected
    Offline,
    /// Typing in a channel
    Typing {
        /// Channel being typed in
        channel_id: ChannelId,
    },
}

/// Presence change of another user; passed through untouched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceEvent {
    /// User whose presence changed
    pub user_id: UserId,
    /// New presence
    pub presence: Presence,
}

/// Event delivered by the realtime subscription of a channel.
///
/// Delivery is at-least-once and may be slightly out of order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// A message was persisted
    MessageCreated {
        /// The persisted message
        message: Message,
    },
    /// A user's read cursor moved
    ReadCursorUpdated {
        /// Owner of the cursor
        user_id: UserId,
        /// Channel of the cursor
        channel_id: ChannelId,
        /// New last-read instant
        last_read: DateTime<Utc>,
    },
    /// Presence or typing change
    PresenceChanged(PresenceEvent),
}

impl RealtimeEvent {
    /// Channel the event applies to, when it has one
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            RealtimeEvent::MessageCreated { message } => Some(&message.channel_id),
            RealtimeEvent::ReadCursorUpdated { channel_id, .. } => Some(channel_id),
            RealtimeEvent::PresenceChanged(PresenceEvent {
                presence: Presence::Typing { channel_id },
                ..
            }) => Some(channel_id),
            RealtimeEvent::PresenceChanged(_) => None,
        }
    }
}

/// Change notification for observers of the sync state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotification {
    /// Confirmed messages of a channel changed
    TimelineChanged(ChannelId),
    /// Pending sends of a channel changed
    PendingChanged(ChannelId),
    /// Unread counter of a channel changed
    UnreadChanged {
        /// Channel
        channel_id: ChannelId,
        /// New count
        count: u32,
    },
    /// Read cursor of a channel changed
    CursorChanged(ChannelId),
    /// Presence passthrough
    Presence(PresenceEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = r#"{
            "type": "read_cursor_updated",
            "user_id": "alice",
            "channel_id": "general",
            "last_read": "2024-01-01T00:00:00Z"
        }"#;
        let event: RealtimeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.channel_id(), Some(&ChannelId::new("general")));
    }

    #[test]
    fn test_presence_wire_format() {
        let json = r#"{
            "type": "presence_changed",
            "user_id": "bob",
            "presence": {"state": "typing", "channel_id": "general"}
        }"#;
        let event: RealtimeEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.channel_id(), Some(&ChannelId::new("general")));

        let online = RealtimeEvent::PresenceChanged(PresenceEvent {
            user_id: UserId::new("bob"),
            presence: Presence::Online,
        });
        assert_eq!(online.channel_id(), None);
    }
}
