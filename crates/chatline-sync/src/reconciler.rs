//! Single writer of all per-channel sync state
//!
//! Push events, page loads, cursor fetches and send outcomes all pass
//! through [`Reconciler`], which keeps history, pending sends, read cursors
//! and unread counters consistent with each other and notifies observers.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::SyncConfig;
use crate::cursor::ReadCursors;
use crate::error::{SyncError, SyncResult};
use crate::events::{RealtimeEvent, SyncNotification};
use crate::history::{HistoryStatus, HistoryStore, LoadOutcome, LoadTicket};
use crate::message::{ChannelId, Message, MessageId, Nonce, UserId};
use crate::pending::{PendingSend, PendingSends};
use crate::unread::{UnreadCounters, compute_divider};

/// What applying an event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Message inserted into the live timeline
    Inserted,
    /// Channel on screen but its first page is still loading; held until it lands
    Held,
    /// Channel not loaded; only the unread counter was updated
    Counted,
    /// Message already known
    Duplicate,
    /// Read cursor moved forward
    CursorAdvanced,
    /// Read cursor update older than the cached one
    StaleCursor,
    /// Read cursor of another user
    ForeignCursor,
    /// Presence forwarded to observers
    Presence,
}

/// Render model of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelView {
    /// Channel
    pub channel_id: ChannelId,
    /// Confirmed messages, ascending by timestamp
    pub messages: Vec<Message>,
    /// Unconfirmed local sends, in creation order
    pub pending: Vec<PendingSend>,
    /// Index into `messages` the unread divider goes before
    pub divider: Option<usize>,
    /// Effective last-read instant
    pub last_read: Option<DateTime<Utc>>,
    /// Unread counter
    pub unread: u32,
    /// Whether older history may exist
    pub has_previous: bool,
    /// Whether a page load is in flight
    pub loading: bool,
    /// History load state
    pub status: HistoryStatus,
}

/// One rendered row of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelineRow<'a> {
    /// Unread separator
    Divider,
    /// Confirmed message
    Confirmed(&'a Message),
    /// Local send awaiting confirmation
    Pending(&'a PendingSend),
}

impl ChannelView {
    /// Rows in render order: confirmed messages with the divider, then pending sends
    pub fn rows(&self) -> Vec<TimelineRow<'_>> {
        let mut rows = Vec::with_capacity(self.messages.len() + self.pending.len() + 1);
        for (i, message) in self.messages.iter().enumerate() {
            if self.divider == Some(i) {
                rows.push(TimelineRow::Divider);
            }
            rows.push(TimelineRow::Confirmed(message));
        }
        rows.extend(self.pending.iter().map(TimelineRow::Pending));
        rows
    }
}

/// Merges pagination, optimistic sends and push events into one state
pub struct Reconciler {
    viewer: UserId,
    history: HistoryStore,
    pending: PendingSends,
    cursors: ReadCursors,
    unread: UnreadCounters,
    /// Ids counted while the channel had no live timeline
    counted: HashMap<ChannelId, HashSet<MessageId>>,
    notify_tx: broadcast::Sender<SyncNotification>,
}

impl Reconciler {
    /// Create a reconciler for the viewing user
    pub fn new(viewer: UserId, config: &SyncConfig) -> Self {
        let (notify_tx, _) = broadcast::channel(config.notification_capacity);
        Self {
            viewer,
            history: HistoryStore::new(config.page_size),
            pending: PendingSends::new(),
            cursors: ReadCursors::new(),
            unread: UnreadCounters::new(),
            counted: HashMap::new(),
            notify_tx,
        }
    }

    /// The viewing user
    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    /// Sender side of the notification channel
    pub fn notifier(&self) -> broadcast::Sender<SyncNotification> {
        self.notify_tx.clone()
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotification> {
        self.notify_tx.subscribe()
    }

    fn notify(&self, notification: SyncNotification) {
        // no receivers is fine
        let _ = self.notify_tx.send(notification);
    }

    fn bump_unread(&mut self, channel_id: &ChannelId) {
        let count = self.unread.increment(channel_id);
        self.notify(SyncNotification::UnreadChanged {
            channel_id: channel_id.clone(),
            count,
        });
    }

    fn clear_unread(&mut self, channel_id: &ChannelId) {
        if self.unread.reset(channel_id) {
            self.notify(SyncNotification::UnreadChanged {
                channel_id: channel_id.clone(),
                count: 0,
            });
        }
    }

    /// Apply one push event. Repeated deliveries are no-ops.
    pub fn apply(&mut self, event: RealtimeEvent) -> Applied {
        match event {
            RealtimeEvent::MessageCreated { message } => self.message_created(message),
            RealtimeEvent::ReadCursorUpdated {
                user_id,
                channel_id,
                last_read,
            } => {
                if user_id != self.viewer {
                    return Applied::ForeignCursor;
                }
                if self.cursors.advance(&channel_id, last_read) {
                    self.notify(SyncNotification::CursorChanged(channel_id));
                    Applied::CursorAdvanced
                } else {
                    Applied::StaleCursor
                }
            }
            RealtimeEvent::PresenceChanged(presence) => {
                self.notify(SyncNotification::Presence(presence));
                Applied::Presence
            }
        }
    }

    fn message_created(&mut self, message: Message) -> Applied {
        let channel_id = message.channel_id.clone();
        let seen_while_unloaded = self
            .counted
            .get(&channel_id)
            .is_some_and(|ids| ids.contains(&message.id));
        if seen_while_unloaded || self.history.contains(&channel_id, &message.id) {
            debug!(%channel_id, message_id = %message.id, "duplicate message event");
            return Applied::Duplicate;
        }

        if self.pending.reconcile(&channel_id, &message).is_some() {
            self.notify(SyncNotification::PendingChanged(channel_id.clone()));
        }

        let from_viewer = message.sender_id == self.viewer;
        if self.history.is_live(&channel_id) {
            let on_screen = self.history.is_mounted(&channel_id);
            self.history.insert_latest(message);
            self.notify(SyncNotification::TimelineChanged(channel_id.clone()));
            if !on_screen && !from_viewer {
                self.bump_unread(&channel_id);
            }
            Applied::Inserted
        } else if self.history.awaits_initial(&channel_id) {
            // on screen: merged into the first page, never unread
            self.history.hold_pushed(message);
            Applied::Held
        } else {
            self.count_unloaded(message, from_viewer);
            Applied::Counted
        }
    }

    fn count_unloaded(&mut self, message: Message, from_viewer: bool) {
        let channel_id = message.channel_id;
        self.counted
            .entry(channel_id.clone())
            .or_default()
            .insert(message.id);
        if !from_viewer {
            self.bump_unread(&channel_id);
        }
    }

    /// Put a channel on screen.
    ///
    /// Starts the read-cursor visit and returns a ticket for the initial
    /// page unless the timeline is already cached.
    pub fn open_channel(&mut self, channel_id: &ChannelId, now: DateTime<Utc>) -> Option<LoadTicket> {
        self.history.mount(channel_id);
        self.cursors.open(channel_id, now);
        self.notify(SyncNotification::CursorChanged(channel_id.clone()));
        if self.history.is_live(channel_id) {
            None
        } else {
            Some(self.history.begin_initial(channel_id))
        }
    }

    /// Take a channel off screen; its cached timeline is kept.
    ///
    /// Pushes held for a first page that never landed become unread.
    pub fn close_channel(&mut self, channel_id: &ChannelId) {
        for message in self.history.unmount(channel_id) {
            let from_viewer = message.sender_id == self.viewer;
            self.count_unloaded(message, from_viewer);
        }
    }

    /// Whether the channel is on screen
    pub fn is_open(&self, channel_id: &ChannelId) -> bool {
        self.history.is_mounted(channel_id)
    }

    /// Re-request the most recent page after a failure
    pub fn retry(&mut self, channel_id: &ChannelId) -> SyncResult<LoadTicket> {
        if !self.history.is_mounted(channel_id) {
            return Err(SyncError::ChannelNotFound(channel_id.clone()));
        }
        Ok(self.history.begin_initial(channel_id))
    }

    /// Request the next older page
    pub fn begin_older(&mut self, channel_id: &ChannelId) -> SyncResult<Option<LoadTicket>> {
        self.history.begin_older(channel_id)
    }

    /// Apply a fetched page
    pub fn complete_load(
        &mut self,
        ticket: &LoadTicket,
        result: SyncResult<Vec<Message>>,
    ) -> SyncResult<LoadOutcome> {
        let outcome = self.history.complete(ticket, result);
        match &outcome {
            Ok(_) => {
                self.counted.remove(&ticket.channel_id);
                self.notify(SyncNotification::TimelineChanged(ticket.channel_id.clone()));
            }
            Err(SyncError::FetchFailed(reason)) => {
                warn!(channel_id = %ticket.channel_id, %reason, "history fetch failed");
            }
            Err(_) => {}
        }
        outcome
    }

    /// Apply the result of the read-cursor fetch started by `open_channel`
    pub fn complete_cursor_fetch(
        &mut self,
        channel_id: &ChannelId,
        result: SyncResult<Option<DateTime<Utc>>>,
    ) -> SyncResult<()> {
        match result {
            Ok(server) => {
                self.cursors.confirm(channel_id, server);
                self.clear_unread(channel_id);
                self.notify(SyncNotification::CursorChanged(channel_id.clone()));
                Ok(())
            }
            Err(e) => {
                warn!(%channel_id, error = %e, "read cursor fetch failed, rolling back");
                if self.cursors.rollback(channel_id) {
                    self.notify(SyncNotification::CursorChanged(channel_id.clone()));
                }
                Err(SyncError::FetchFailed(e.to_string()))
            }
        }
    }

    /// The backend acknowledged a mark-read at `at`
    pub fn marked_read(&mut self, channel_id: &ChannelId, at: DateTime<Utc>) {
        if self.cursors.advance(channel_id, at) {
            self.notify(SyncNotification::CursorChanged(channel_id.clone()));
        }
        self.clear_unread(channel_id);
    }

    /// Track a local send
    pub fn add_pending(&mut self, channel_id: &ChannelId, body: impl Into<String>) -> Nonce {
        let nonce = self.pending.add(channel_id, body);
        self.notify(SyncNotification::PendingChanged(channel_id.clone()));
        nonce
    }

    /// The send mutation returned the persisted message
    pub fn send_succeeded(&mut self, nonce: &Nonce, mut message: Message) -> Applied {
        if message.nonce.is_none() {
            message.nonce = Some(nonce.clone());
        }
        let channel_id = message.channel_id.clone();
        let applied = self.message_created(message);
        // the push event may have confirmed a different copy first
        if self.pending.find(&channel_id, nonce).is_some() && applied == Applied::Duplicate {
            let _ = self.pending.remove(&channel_id, nonce);
            self.notify(SyncNotification::PendingChanged(channel_id));
        }
        applied
    }

    /// The send mutation failed
    pub fn send_failed(&mut self, channel_id: &ChannelId, nonce: &Nonce, error: SyncError) -> SyncError {
        warn!(%channel_id, %nonce, %error, "send failed");
        if self.pending.mark_failed(channel_id, nonce).is_ok() {
            self.notify(SyncNotification::PendingChanged(channel_id.clone()));
        }
        match error {
            SyncError::SendFailed(reason) => SyncError::SendFailed(reason),
            other => SyncError::SendFailed(other.to_string()),
        }
    }

    /// Move a failed send back to sending for another attempt
    pub fn retry_send(&mut self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<PendingSend> {
        let pending = self.pending.mark_sending(channel_id, nonce)?;
        self.notify(SyncNotification::PendingChanged(channel_id.clone()));
        Ok(pending)
    }

    /// Drop a pending send at the user's request
    pub fn discard(&mut self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<PendingSend> {
        let pending = self.pending.remove(channel_id, nonce)?;
        self.notify(SyncNotification::PendingChanged(channel_id.clone()));
        Ok(pending)
    }

    /// Unread counter of a channel
    pub fn unread(&self, channel_id: &ChannelId) -> u32 {
        self.unread.get(channel_id)
    }

    /// Unread total across channels
    pub fn total_unread(&self) -> u32 {
        self.unread.total()
    }

    /// Build the render model of a channel
    pub fn view(&self, channel_id: &ChannelId) -> ChannelView {
        let messages = self.history.timeline(channel_id);
        let last_read = self.cursors.last_read(channel_id);
        ChannelView {
            channel_id: channel_id.clone(),
            divider: compute_divider(&messages, last_read),
            messages,
            pending: self.pending.get(channel_id).to_vec(),
            last_read,
            unread: self.unread.get(channel_id),
            has_previous: self.history.has_previous(channel_id),
            loading: self.history.is_loading(channel_id),
            status: self.history.status(channel_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorState;
    use crate::events::{Presence, PresenceEvent};
    use crate::pending::SendStatus;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn channel() -> ChannelId {
        ChannelId::new("general")
    }

    fn msg(id: &str, sender: &str, secs: i64) -> Message {
        Message::new(id, channel(), UserId::new(sender), "hi", at(secs))
    }

    fn created(message: Message) -> RealtimeEvent {
        RealtimeEvent::MessageCreated { message }
    }

    fn live(initial: Vec<Message>) -> Reconciler {
        let mut r = Reconciler::new(UserId::new("me"), &SyncConfig::default());
        let ticket = r.open_channel(&channel(), at(1_000)).unwrap();
        r.complete_load(&ticket, Ok(initial)).unwrap();
        r
    }

    fn ids(view: &ChannelView) -> Vec<String> {
        view.messages.iter().map(|m| m.id.to_string()).collect()
    }

    #[test]
    fn test_message_created_is_idempotent() {
        let mut r = live(vec![msg("m1", "bob", 10)]);
        let event = created(msg("m2", "bob", 20));

        assert_eq!(r.apply(event.clone()), Applied::Inserted);
        let once = r.view(&channel());
        for _ in 0..5 {
            assert_eq!(r.apply(event.clone()), Applied::Duplicate);
        }
        assert_eq!(r.view(&channel()), once);
        assert_eq!(ids(&once), vec!["m1", "m2"]);
    }

    #[test]
    fn test_out_of_order_push_stays_sorted() {
        let mut r = live(vec![msg("m1", "bob", 10)]);
        r.apply(created(msg("m3", "bob", 30)));
        r.apply(created(msg("m2", "bob", 20)));
        assert_eq!(ids(&r.view(&channel())), vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_confirmation_removes_matching_pending_only() {
        let mut r = live(Vec::new());
        let n1 = r.add_pending(&channel(), "hello");
        let n2 = r.add_pending(&channel(), "hello");

        let confirmed = msg("m1", "me", 10).with_nonce(n1);
        assert_eq!(r.apply(created(confirmed)), Applied::Inserted);

        let view = r.view(&channel());
        assert_eq!(view.pending.len(), 1);
        assert_eq!(view.pending[0].nonce, n2);
        assert_eq!(ids(&view), vec!["m1"]);
    }

    #[test]
    fn test_send_response_after_push_clears_pending() {
        let mut r = live(Vec::new());
        let nonce = r.add_pending(&channel(), "hello");

        // push arrives without the nonce, then the mutation responds
        r.apply(created(msg("m1", "me", 10)));
        assert_eq!(r.view(&channel()).pending.len(), 1);

        assert_eq!(
            r.send_succeeded(&nonce, msg("m1", "me", 10)),
            Applied::Duplicate
        );
        let view = r.view(&channel());
        assert!(view.pending.is_empty());
        assert_eq!(view.messages.len(), 1);
    }

    #[test]
    fn test_unloaded_channel_counts_unread_once() {
        let mut r = Reconciler::new(UserId::new("me"), &SyncConfig::default());
        let event = created(msg("m1", "bob", 10));

        assert_eq!(r.apply(event.clone()), Applied::Counted);
        assert_eq!(r.apply(event), Applied::Duplicate);
        assert_eq!(r.unread(&channel()), 1);
        assert!(r.view(&channel()).messages.is_empty());
    }

    #[test]
    fn test_own_messages_are_not_unread() {
        let mut r = Reconciler::new(UserId::new("me"), &SyncConfig::default());
        r.apply(created(msg("m1", "me", 10)));
        assert_eq!(r.unread(&channel()), 0);
    }

    #[test]
    fn test_closed_live_channel_inserts_and_counts() {
        let mut r = live(Vec::new());
        assert!(r.is_open(&channel()));
        r.close_channel(&channel());
        assert!(!r.is_open(&channel()));
        assert_eq!(r.apply(created(msg("m1", "bob", 10))), Applied::Inserted);
        assert_eq!(r.unread(&channel()), 1);

        let random = ChannelId::new("random");
        r.apply(created(Message::new("r1", random.clone(), UserId::new("bob"), "hey", at(20))));
        assert_eq!(r.unread(&random), 1);
        assert_eq!(r.total_unread(), 2);
    }

    #[test]
    fn test_push_racing_first_page_is_kept() {
        let mut r = Reconciler::new(UserId::new("me"), &SyncConfig::default());
        let ticket = r.open_channel(&channel(), at(1_000)).unwrap();

        assert_eq!(r.apply(created(msg("m2", "bob", 20))), Applied::Held);
        assert_eq!(r.apply(created(msg("m2", "bob", 20))), Applied::Duplicate);
        assert_eq!(r.unread(&channel()), 0);

        // the page was read before m2 was persisted
        r.complete_load(&ticket, Ok(vec![msg("m1", "bob", 10)])).unwrap();
        let view = r.view(&channel());
        assert_eq!(ids(&view), vec!["m1", "m2"]);
        assert_eq!(view.unread, 0);
    }

    #[test]
    fn test_push_racing_refetch_is_kept() {
        let mut r = live(vec![msg("m1", "bob", 10)]);
        let refetch = r.retry(&channel()).unwrap();
        assert_eq!(r.apply(created(msg("m2", "bob", 20))), Applied::Inserted);

        r.complete_load(&refetch, Ok(vec![msg("m1", "bob", 10)])).unwrap();
        assert_eq!(ids(&r.view(&channel())), vec!["m1", "m2"]);
    }

    #[test]
    fn test_held_pushes_become_unread_on_close() {
        let mut r = Reconciler::new(UserId::new("me"), &SyncConfig::default());
        r.open_channel(&channel(), at(1_000)).unwrap();
        r.apply(created(msg("m1", "bob", 10)));
        r.apply(created(msg("m2", "me", 20)));

        r.close_channel(&channel());
        assert_eq!(r.unread(&channel()), 1);
        // redelivery after closing is still recognised
        assert_eq!(r.apply(created(msg("m1", "bob", 10))), Applied::Duplicate);
        assert_eq!(r.unread(&channel()), 1);
    }

    #[test]
    fn test_cursor_fetch_resets_unread() {
        let mut r = Reconciler::new(UserId::new("me"), &SyncConfig::default());
        r.apply(created(msg("m1", "bob", 10)));
        r.open_channel(&channel(), at(1_000));
        r.complete_cursor_fetch(&channel(), Ok(Some(at(5)))).unwrap();

        assert_eq!(r.unread(&channel()), 0);
        assert_eq!(r.view(&channel()).last_read, Some(at(5)));
    }

    #[test]
    fn test_cursor_fetch_failure_rolls_back() {
        let mut r = live(Vec::new());
        assert_eq!(r.view(&channel()).last_read, Some(at(1_000)));

        let err = r
            .complete_cursor_fetch(&channel(), Err(SyncError::FetchFailed("offline".into())))
            .unwrap_err();
        assert!(err.is_retriable());
        assert_eq!(r.cursors.get(&channel()).state(), CursorState::RolledBack(None));
    }

    #[test]
    fn test_read_cursor_guard() {
        let mut r = Reconciler::new(UserId::new("me"), &SyncConfig::default());
        let update = |user: &str, secs| RealtimeEvent::ReadCursorUpdated {
            user_id: UserId::new(user),
            channel_id: channel(),
            last_read: at(secs),
        };

        assert_eq!(r.apply(update("me", 20)), Applied::CursorAdvanced);
        assert_eq!(r.apply(update("me", 10)), Applied::StaleCursor);
        assert_eq!(r.apply(update("bob", 99)), Applied::ForeignCursor);
        assert_eq!(r.view(&channel()).last_read, Some(at(20)));
    }

    #[test]
    fn test_divider_in_view() {
        let mut r = live(vec![msg("m3", "bob", 30), msg("m2", "bob", 20), msg("m1", "bob", 10)]);
        r.complete_cursor_fetch(&channel(), Ok(Some(at(15)))).unwrap();

        let view = r.view(&channel());
        assert_eq!(view.divider, Some(1));
        let rows = view.rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[1], TimelineRow::Divider);
    }

    #[test]
    fn test_failed_send_stays_visible() {
        let mut r = live(Vec::new());
        let nonce = r.add_pending(&channel(), "hello");
        let err = r.send_failed(&channel(), &nonce, SyncError::FetchFailed("500".into()));
        assert!(matches!(err, SyncError::SendFailed(_)));

        let view = r.view(&channel());
        assert_eq!(view.pending[0].status, SendStatus::Failed);
        assert!(matches!(view.rows().last(), Some(TimelineRow::Pending(_))));

        r.discard(&channel(), &nonce).unwrap();
        assert!(r.view(&channel()).pending.is_empty());
    }

    #[test]
    fn test_presence_passthrough() {
        let mut r = live(Vec::new());
        let mut rx = r.subscribe();
        let presence = PresenceEvent {
            user_id: UserId::new("bob"),
            presence: Presence::Typing {
                channel_id: channel(),
            },
        };
        let before = r.view(&channel());

        assert_eq!(
            r.apply(RealtimeEvent::PresenceChanged(presence.clone())),
            Applied::Presence
        );
        assert_eq!(rx.try_recv().unwrap(), SyncNotification::Presence(presence));
        assert_eq!(r.view(&channel()), before);
    }
}
