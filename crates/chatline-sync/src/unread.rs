//! Unread divider placement and per-channel unread counters

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::message::{ChannelId, Message};

/// Index of the message the unread divider is rendered before.
///
/// The divider goes before the first message newer than `last_read` whose
/// predecessor is not newer than `last_read`. It is only ever placed between
/// two messages, never before the first one, so a timeline that is entirely
/// unread gets no divider.
pub fn compute_divider(timeline: &[Message], last_read: Option<DateTime<Utc>>) -> Option<usize> {
    let last_read = last_read?;
    timeline
        .windows(2)
        .position(|pair| pair[0].timestamp <= last_read && pair[1].timestamp > last_read)
        .map(|i| i + 1)
}

/// Unread message counts per channel
#[derive(Debug, Default)]
pub struct UnreadCounters {
    counts: HashMap<ChannelId, u32>,
}

impl UnreadCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count for a channel
    pub fn get(&self, channel_id: &ChannelId) -> u32 {
        self.counts.get(channel_id).copied().unwrap_or(0)
    }

    /// Add one and return the new count
    pub fn increment(&mut self, channel_id: &ChannelId) -> u32 {
        let count = self.counts.entry(channel_id.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Reset to zero; returns `true` if the count changed
    pub fn reset(&mut self, channel_id: &ChannelId) -> bool {
        self.counts.remove(channel_id).is_some_and(|c| c > 0)
    }

    /// Sum over all channels
    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}
