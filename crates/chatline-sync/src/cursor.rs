//! Read cursors for the viewing user.
//!
//! Opening a channel optimistically moves the cursor to "now" while the
//! backend is asked for the authoritative value. The fetch either confirms
//! the server value or rolls back to what was cached before the visit.
//! Pushed updates never move the cursor backwards; one arriving inside the
//! provisional window is kept and wins over an older fetched value.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::message::ChannelId;

/// State of one channel's read cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Provisionally at `optimistic` until the cursor fetch resolves
    Unconfirmed {
        /// Local "now" at the time the channel was opened
        optimistic: DateTime<Utc>,
        /// Value to restore if the fetch fails
        previous: Option<DateTime<Utc>>,
        /// Newest value pushed while the fetch was outstanding
        pushed: Option<DateTime<Utc>>,
    },
    /// Authoritative server value
    Confirmed(Option<DateTime<Utc>>),
    /// Fetch failed; restored to the pre-visit value
    RolledBack(Option<DateTime<Utc>>),
}

/// Read cursor of the viewing user in one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCursor {
    state: CursorState,
}

impl Default for ReadCursor {
    fn default() -> Self {
        Self {
            state: CursorState::Confirmed(None),
        }
    }
}

impl ReadCursor {
    /// Current state
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Effective last-read instant used for rendering
    pub fn last_read(&self) -> Option<DateTime<Utc>> {
        match self.state {
            CursorState::Unconfirmed { optimistic, .. } => Some(optimistic),
            CursorState::Confirmed(v) | CursorState::RolledBack(v) => v,
        }
    }

    /// Whether a fetch is outstanding
    pub fn is_unconfirmed(&self) -> bool {
        matches!(self.state, CursorState::Unconfirmed { .. })
    }

    /// Start a visit: optimistically mark everything up to `now` as read
    pub fn open(&mut self, now: DateTime<Utc>) {
        let (previous, pushed) = match self.state {
            // reopening before the first fetch resolved keeps the original fallback
            CursorState::Unconfirmed {
                previous, pushed, ..
            } => (previous, pushed),
            CursorState::Confirmed(v) | CursorState::RolledBack(v) => (v, None),
        };
        self.state = CursorState::Unconfirmed {
            optimistic: now,
            previous,
            pushed,
        };
    }

    /// Cursor fetch succeeded
    pub fn confirm(&mut self, server: Option<DateTime<Utc>>) {
        let pushed = match self.state {
            CursorState::Unconfirmed { pushed, .. } => pushed,
            _ => None,
        };
        self.state = CursorState::Confirmed(server.max(pushed));
    }

    /// Cursor fetch failed; returns `false` if there was nothing to roll back
    pub fn rollback(&mut self) -> bool {
        match self.state {
            CursorState::Unconfirmed {
                previous, pushed, ..
            } => {
                self.state = CursorState::RolledBack(previous.max(pushed));
                true
            }
            _ => false,
        }
    }

    /// Apply a pushed cursor value; stale values are ignored.
    ///
    /// While a fetch is outstanding the value is compared with the pre-visit
    /// cursor and kept for when the fetch resolves; the optimistic "now"
    /// stays in effect until then. Returns `true` if the value was taken.
    pub fn advance(&mut self, last_read: DateTime<Utc>) -> bool {
        if let CursorState::Unconfirmed {
            previous,
            ref mut pushed,
            ..
        } = self.state
        {
            if previous.max(*pushed).is_some_and(|current| last_read <= current) {
                return false;
            }
            *pushed = Some(last_read);
            return true;
        }
        if self.last_read().is_some_and(|current| last_read <= current) {
            return false;
        }
        self.state = CursorState::Confirmed(Some(last_read));
        true
    }
}

/// Read cursors of the viewing user, per channel
#[derive(Debug, Default)]
pub struct ReadCursors {
    cursors: HashMap<ChannelId, ReadCursor>,
}

impl ReadCursors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cursor of a channel; a never-seen channel has no last-read value
    pub fn get(&self, channel_id: &ChannelId) -> ReadCursor {
        self.cursors.get(channel_id).copied().unwrap_or_default()
    }

    /// Effective last-read instant of a channel
    pub fn last_read(&self, channel_id: &ChannelId) -> Option<DateTime<Utc>> {
        self.get(channel_id).last_read()
    }

    /// See [`ReadCursor::open`]
    pub fn open(&mut self, channel_id: &ChannelId, now: DateTime<Utc>) {
        self.cursors.entry(channel_id.clone()).or_default().open(now);
    }

    /// See [`ReadCursor::confirm`]
    pub fn confirm(&mut self, channel_id: &ChannelId, server: Option<DateTime<Utc>>) {
        self.cursors
            .entry(channel_id.clone())
            .or_default()
            .confirm(server);
    }

    /// See [`ReadCursor::rollback`]
    pub fn rollback(&mut self, channel_id: &ChannelId) -> bool {
        self.cursors
            .get_mut(channel_id)
            .is_some_and(ReadCursor::rollback)
    }

    /// See [`ReadCursor::advance`]
    pub fn advance(&mut self, channel_id: &ChannelId, last_read: DateTime<Utc>) -> bool {
        let moved = self
            .cursors
            .entry(channel_id.clone())
            .or_default()
            .advance(last_read);
        if !moved {
            debug!(%channel_id, %last_read, "ignoring stale read cursor");
        }
        moved
    }
}
