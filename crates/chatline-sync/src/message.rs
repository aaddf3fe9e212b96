//! Message types shared by every component of the sync core

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a direct-message or group channel
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Create a channel ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Identifier of a user account
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a user ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Backend-assigned message identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Create a message ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Client-generated correlation id linking a local send to its confirmed message
///
/// Matching is exact string equality.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nonce(String);

impl Nonce {
    /// Generate a random 128-bit nonce, hex encoded
    pub fn generate() -> Self {
        let bits: u128 = rand::random();
        Self(format!("{bits:032x}"))
    }

    /// Wrap an existing nonce string
    pub fn from_string(nonce: impl Into<String>) -> Self {
        Self(nonce.into())
    }

    /// The raw nonce
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Nonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message persisted by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Backend-assigned identifier
    pub id: MessageId,
    /// Channel the message belongs to
    pub channel_id: ChannelId,
    /// Author of the message
    pub sender_id: UserId,
    /// Text body
    pub body: String,
    /// Server timestamp
    pub timestamp: DateTime<Utc>,
    /// Correlation id echoed back for messages sent from this client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<Nonce>,
}

impl Message {
    /// Create a confirmed message without a nonce
    pub fn new(
        id: impl Into<MessageId>,
        channel_id: ChannelId,
        sender_id: UserId,
        body: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            channel_id,
            sender_id,
            body: body.into(),
            timestamp,
            nonce: None,
        }
    }

    /// Attach the nonce of the local send this message confirms
    pub fn with_nonce(mut self, nonce: Nonce) -> Self {
        self.nonce = Some(nonce);
        self
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One history fetch, newest message first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Page {
    messages: Vec<Message>,
}

impl Page {
    /// Build a page from backend output (already newest first)
    pub fn new(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    /// Number of messages in the page
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the page holds no messages
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages, newest first
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Oldest message of the page, used as the cursor for the next older fetch
    pub fn oldest(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Newest message of the page
    pub fn newest(&self) -> Option<&Message> {
        self.messages.first()
    }

    pub(crate) fn contains(&self, id: &MessageId) -> bool {
        self.messages.iter().any(|m| &m.id == id)
    }

    pub(crate) fn retain(&mut self, f: impl FnMut(&Message) -> bool) {
        self.messages.retain(f);
    }

    /// Insert keeping newest-first order; a message tying an existing
    /// timestamp is placed as the newer of the two.
    pub(crate) fn insert_latest(&mut self, message: Message) {
        let pos = self
            .messages
            .iter()
            .position(|m| m.timestamp <= message.timestamp)
            .unwrap_or(self.messages.len());
        self.messages.insert(pos, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn msg(id: &str, secs: i64) -> Message {
        Message::new(id, ChannelId::new("c"), UserId::new("u"), "hi", at(secs))
    }

    #[test]
    fn test_nonce_uniqueness() {
        let a = Nonce::generate();
        let b = Nonce::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn test_page_cursor_is_oldest() {
        let page = Page::new(vec![msg("3", 30), msg("2", 20), msg("1", 10)]);
        assert_eq!(page.oldest().unwrap().id.as_str(), "1");
        assert_eq!(page.newest().unwrap().id.as_str(), "3");
    }

    #[test]
    fn test_insert_latest_keeps_order() {
        let mut page = Page::new(vec![msg("3", 30), msg("1", 10)]);
        page.insert_latest(msg("2", 20));
        page.insert_latest(msg("4", 40));
        let ids: Vec<_> = page.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["4", "3", "2", "1"]);
    }

    #[test]
    fn test_insert_latest_tie_goes_newer() {
        let mut page = Page::new(vec![msg("a", 10)]);
        page.insert_latest(msg("b", 10));
        assert_eq!(page.newest().unwrap().id.as_str(), "b");
    }

    #[test]
    fn test_message_serde_skips_missing_nonce() {
        let json = serde_json::to_string(&msg("1", 10)).unwrap();
        assert!(!json.contains("nonce"));

        let with = msg("1", 10).with_nonce(Nonce::from_string("n1"));
        let back: Message = serde_json::from_str(&serde_json::to_string(&with).unwrap()).unwrap();
        assert_eq!(back.nonce, Some(Nonce::from_string("n1")));
    }
}
