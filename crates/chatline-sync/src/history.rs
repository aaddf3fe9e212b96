//! Backward-paginated message history per channel
//!
//! Pages are kept oldest-first; messages inside a page are newest-first, as
//! the backend returns them. Loads are split into `begin_*` and `complete`
//! so that the network fetch can run elsewhere while every state change
//! happens at a single reconciliation point.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::message::{ChannelId, Message, MessageId, Page};

/// Which page a load request is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadKind {
    /// Most recent page
    Initial,
    /// Page of messages strictly older than `before`
    Older {
        /// Timestamp of the oldest loaded message
        before: DateTime<Utc>,
    },
}

impl LoadKind {
    /// Cursor to pass to the backend
    pub fn cursor(&self) -> Option<DateTime<Utc>> {
        match self {
            LoadKind::Initial => None,
            LoadKind::Older { before } => Some(*before),
        }
    }
}

/// Identity of one in-flight load; only the newest ticket of a channel may complete
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadTicket {
    /// Channel being loaded
    pub channel_id: ChannelId,
    /// What is being loaded
    pub kind: LoadKind,
    generation: u64,
    request: u64,
}

/// Result of a completed load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOutcome {
    /// What was loaded
    pub kind: LoadKind,
    /// Messages added to the timeline
    pub added: usize,
    /// Whether older history remains
    pub has_previous: bool,
}

/// Load state of a channel's history
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryStatus {
    /// Nothing requested yet
    Idle,
    /// Initial page in flight
    Loading,
    /// Initial page loaded; the timeline reaches "now"
    Ready,
    /// Initial page failed; waits for an explicit retry
    Failed(String),
}

#[derive(Debug)]
struct ChannelHistory {
    pages: Vec<Page>,
    ids: HashSet<MessageId>,
    has_previous: bool,
    status: HistoryStatus,
    mounted: bool,
    generation: u64,
    next_request: u64,
    in_flight: Option<u64>,
    /// Whether the load in flight is for the most recent page
    refreshing: bool,
    /// Pushes received while the most recent page is outstanding
    pushed: Vec<Message>,
}

impl ChannelHistory {
    fn new() -> Self {
        Self {
            pages: Vec::new(),
            ids: HashSet::new(),
            has_previous: true,
            status: HistoryStatus::Idle,
            mounted: false,
            generation: 0,
            next_request: 0,
            in_flight: None,
            refreshing: false,
            pushed: Vec::new(),
        }
    }

    fn ticket(&mut self, channel_id: &ChannelId, kind: LoadKind) -> LoadTicket {
        self.next_request += 1;
        self.in_flight = Some(self.next_request);
        self.refreshing = kind == LoadKind::Initial;
        LoadTicket {
            channel_id: channel_id.clone(),
            kind,
            generation: self.generation,
            request: self.next_request,
        }
    }

    fn is_current(&self, ticket: &LoadTicket) -> bool {
        self.mounted
            && ticket.generation == self.generation
            && self.in_flight == Some(ticket.request)
    }
}

/// Paginated history for every channel of a session
#[derive(Debug)]
pub struct HistoryStore {
    page_size: usize,
    channels: HashMap<ChannelId, ChannelHistory>,
}

impl HistoryStore {
    /// Create a store fetching `page_size` messages per page
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            channels: HashMap::new(),
        }
    }

    /// Messages requested per page
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Mark the channel as on screen
    pub fn mount(&mut self, channel_id: &ChannelId) {
        self.channels
            .entry(channel_id.clone())
            .or_insert_with(ChannelHistory::new)
            .mounted = true;
    }

    /// Mark the channel as off screen; in-flight results will be discarded.
    ///
    /// Returns the held pushes that never reached a timeline.
    pub fn unmount(&mut self, channel_id: &ChannelId) -> Vec<Message> {
        let Some(history) = self.channels.get_mut(channel_id) else {
            return Vec::new();
        };
        history.mounted = false;
        history.generation += 1;
        history.in_flight = None;
        history.refreshing = false;
        if history.status == HistoryStatus::Loading {
            history.status = HistoryStatus::Idle;
        }
        let pushed = std::mem::take(&mut history.pushed);
        if history.status == HistoryStatus::Ready {
            // already inserted into the live pages
            Vec::new()
        } else {
            pushed
        }
    }

    /// Whether the channel is on screen
    pub fn is_mounted(&self, channel_id: &ChannelId) -> bool {
        self.channels.get(channel_id).is_some_and(|h| h.mounted)
    }

    /// Start loading the most recent page.
    ///
    /// Supersedes any load in flight for the channel. Used for the first
    /// load and for an explicit retry or refetch.
    pub fn begin_initial(&mut self, channel_id: &ChannelId) -> LoadTicket {
        let history = self
            .channels
            .entry(channel_id.clone())
            .or_insert_with(ChannelHistory::new);
        history.generation += 1;
        if history.status != HistoryStatus::Ready {
            history.status = HistoryStatus::Loading;
        }
        history.ticket(channel_id, LoadKind::Initial)
    }

    /// Start loading the next older page.
    ///
    /// Returns `Ok(None)` when there is nothing to load: the initial page is
    /// not loaded yet or history is exhausted.
    pub fn begin_older(&mut self, channel_id: &ChannelId) -> SyncResult<Option<LoadTicket>> {
        let history = self
            .channels
            .get_mut(channel_id)
            .ok_or_else(|| SyncError::ChannelNotFound(channel_id.clone()))?;

        if history.in_flight.is_some() {
            return Err(SyncError::AlreadyLoading {
                channel_id: channel_id.clone(),
            });
        }
        if history.status != HistoryStatus::Ready || !history.has_previous {
            return Ok(None);
        }

        let Some(before) = history
            .pages
            .first()
            .and_then(|p| p.oldest())
            .map(|m| m.timestamp)
        else {
            return Ok(None);
        };

        Ok(Some(history.ticket(channel_id, LoadKind::Older { before })))
    }

    /// Apply the result of a fetch started with `ticket`
    pub fn complete(
        &mut self,
        ticket: &LoadTicket,
        result: SyncResult<Vec<Message>>,
    ) -> SyncResult<LoadOutcome> {
        let page_size = self.page_size;
        let history = self
            .channels
            .get_mut(&ticket.channel_id)
            .ok_or_else(|| SyncError::ChannelNotFound(ticket.channel_id.clone()))?;

        if !history.is_current(ticket) {
            debug!(
                channel_id = %ticket.channel_id,
                generation = ticket.generation,
                "discarding stale history response"
            );
            return Err(SyncError::StaleResponseDiscarded {
                channel_id: ticket.channel_id.clone(),
                generation: ticket.generation,
            });
        }
        history.in_flight = None;
        history.refreshing = false;

        let messages = match result {
            Ok(messages) => messages,
            Err(e) => {
                let reason = match &e {
                    SyncError::FetchFailed(reason) => reason.clone(),
                    other => other.to_string(),
                };
                if ticket.kind == LoadKind::Initial && history.status != HistoryStatus::Ready {
                    history.status = HistoryStatus::Failed(reason.clone());
                }
                return Err(SyncError::FetchFailed(reason));
            }
        };

        let has_previous = messages.len() >= page_size;
        let mut page = Page::new(messages);

        let added = match ticket.kind {
            LoadKind::Initial => {
                // the snapshot may predate messages pushed while it was in flight
                for message in std::mem::take(&mut history.pushed) {
                    if !page.contains(&message.id) {
                        page.insert_latest(message);
                    }
                }
                history.ids = page.messages().iter().map(|m| m.id.clone()).collect();
                let added = page.len();
                history.pages = vec![page];
                history.status = HistoryStatus::Ready;
                added
            }
            LoadKind::Older { .. } => {
                let before = page.len();
                page.retain(|m| !history.ids.contains(&m.id));
                if page.len() != before {
                    debug!(
                        channel_id = %ticket.channel_id,
                        dropped = before - page.len(),
                        "dropped messages already present in newer pages"
                    );
                }
                history.ids.extend(page.messages().iter().map(|m| m.id.clone()));
                let added = page.len();
                if !page.is_empty() {
                    history.pages.insert(0, page);
                }
                added
            }
        };
        history.has_previous = has_previous;

        Ok(LoadOutcome {
            kind: ticket.kind,
            added,
            has_previous,
        })
    }

    /// Load state of the channel
    pub fn status(&self, channel_id: &ChannelId) -> HistoryStatus {
        self.channels
            .get(channel_id)
            .map(|h| h.status.clone())
            .unwrap_or(HistoryStatus::Idle)
    }

    /// Whether the loaded timeline reaches "now"
    pub fn is_live(&self, channel_id: &ChannelId) -> bool {
        self.status(channel_id) == HistoryStatus::Ready
    }

    /// Whether older history may exist
    pub fn has_previous(&self, channel_id: &ChannelId) -> bool {
        self.channels.get(channel_id).is_some_and(|h| h.has_previous)
    }

    /// Whether any load is in flight
    pub fn is_loading(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|h| h.in_flight.is_some())
    }

    /// Whether a message is already in the loaded timeline or held for it
    pub fn contains(&self, channel_id: &ChannelId, id: &MessageId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|h| h.ids.contains(id) || h.pushed.iter().any(|m| &m.id == id))
    }

    /// Whether the channel is on screen but its most recent page has not landed
    pub fn awaits_initial(&self, channel_id: &ChannelId) -> bool {
        self.channels
            .get(channel_id)
            .is_some_and(|h| h.mounted && h.status != HistoryStatus::Ready)
    }

    /// Hold a pushed message until the most recent page lands.
    ///
    /// Returns `false` if the channel is not waiting for that page or the
    /// message is already held.
    pub fn hold_pushed(&mut self, message: Message) -> bool {
        let Some(history) = self.channels.get_mut(&message.channel_id) else {
            return false;
        };
        if !history.mounted
            || history.status == HistoryStatus::Ready
            || history.pushed.iter().any(|m| m.id == message.id)
        {
            return false;
        }
        history.pushed.push(message);
        true
    }

    /// Insert a pushed message into the most recent page.
    ///
    /// Returns `false` if the channel is not live or the message is already
    /// present.
    pub fn insert_latest(&mut self, message: Message) -> bool {
        let Some(history) = self.channels.get_mut(&message.channel_id) else {
            return false;
        };
        if history.status != HistoryStatus::Ready || history.ids.contains(&message.id) {
            return false;
        }
        let Some(newest) = history.pages.last_mut() else {
            return false;
        };
        history.ids.insert(message.id.clone());
        if history.in_flight.is_some() && history.refreshing {
            // a refetch in flight replaces the pages; carry this one over
            history.pushed.push(message.clone());
        }
        newest.insert_latest(message);
        true
    }

    /// Loaded messages in ascending timestamp order
    pub fn timeline(&self, channel_id: &ChannelId) -> Vec<Message> {
        let Some(history) = self.channels.get(channel_id) else {
            return Vec::new();
        };
        let mut rows: Vec<Message> = history
            .pages
            .iter()
            .flat_map(|p| p.messages().iter().rev().cloned())
            .collect();
        // stable: equal timestamps keep arrival order
        rows.sort_by_key(|m| m.timestamp);
        rows
    }

    /// Number of loaded pages
    pub fn page_count(&self, channel_id: &ChannelId) -> usize {
        self.channels.get(channel_id).map_or(0, |h| h.pages.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UserId;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn channel() -> ChannelId {
        ChannelId::new("general")
    }

    fn msg(id: u32, secs: i64) -> Message {
        Message::new(
            format!("m{id}"),
            channel(),
            UserId::new("alice"),
            format!("msg {id}"),
            at(secs),
        )
    }

    /// Newest-first run of messages with ids and timestamps `from..=to`
    fn page(from: u32, to: u32) -> Vec<Message> {
        (from..=to).rev().map(|i| msg(i, i as i64 * 10)).collect()
    }

    fn ready_store(page_size: usize, initial: Vec<Message>) -> HistoryStore {
        let mut store = HistoryStore::new(page_size);
        store.mount(&channel());
        let ticket = store.begin_initial(&channel());
        store.complete(&ticket, Ok(initial)).unwrap();
        store
    }

    #[test]
    fn test_initial_load() {
        let store = ready_store(3, page(4, 6));

        assert!(store.is_live(&channel()));
        assert!(store.has_previous(&channel()));
        let ids: Vec<_> = store
            .timeline(&channel())
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["m4", "m5", "m6"]);
    }

    #[test]
    fn test_short_page_ends_history() {
        let store = ready_store(40, page(1, 3));
        assert!(!store.has_previous(&channel()));
    }

    #[test]
    fn test_older_uses_oldest_timestamp_as_cursor() {
        let mut store = ready_store(3, page(4, 6));
        let ticket = store.begin_older(&channel()).unwrap().unwrap();
        assert_eq!(ticket.kind.cursor(), Some(at(40)));

        let outcome = store.complete(&ticket, Ok(page(2, 3))).unwrap();
        assert_eq!(outcome.added, 2);
        assert!(!outcome.has_previous);
        assert_eq!(store.page_count(&channel()), 2);
        assert_eq!(store.timeline(&channel()).first().unwrap().id.as_str(), "m2");

        // exhausted
        assert!(store.begin_older(&channel()).unwrap().is_none());
    }

    #[test]
    fn test_second_concurrent_older_is_rejected() {
        let mut store = ready_store(3, page(4, 6));
        let first = store.begin_older(&channel()).unwrap().unwrap();
        let second = store.begin_older(&channel());
        assert_eq!(
            second,
            Err(SyncError::AlreadyLoading {
                channel_id: channel()
            })
        );

        store.complete(&first, Ok(page(1, 3))).unwrap();
        assert_eq!(store.page_count(&channel()), 2);
    }

    #[test]
    fn test_superseded_response_is_discarded() {
        let mut store = ready_store(3, page(4, 6));
        let older = store.begin_older(&channel()).unwrap().unwrap();

        // explicit refetch supersedes the older load
        let refetch = store.begin_initial(&channel());
        store.complete(&refetch, Ok(page(4, 6))).unwrap();

        let result = store.complete(&older, Ok(page(1, 3)));
        assert!(matches!(
            result,
            Err(SyncError::StaleResponseDiscarded { .. })
        ));
        assert_eq!(store.page_count(&channel()), 1);
    }

    #[test]
    fn test_unmounted_response_has_no_side_effects() {
        let mut store = HistoryStore::new(3);
        store.mount(&channel());
        let ticket = store.begin_initial(&channel());
        store.unmount(&channel());

        let result = store.complete(&ticket, Ok(page(1, 3)));
        assert!(matches!(
            result,
            Err(SyncError::StaleResponseDiscarded { .. })
        ));
        assert_eq!(store.status(&channel()), HistoryStatus::Idle);
        assert!(store.timeline(&channel()).is_empty());
    }

    #[test]
    fn test_initial_failure_then_retry() {
        let mut store = HistoryStore::new(3);
        store.mount(&channel());
        let ticket = store.begin_initial(&channel());
        let err = store
            .complete(&ticket, Err(SyncError::FetchFailed("offline".into())))
            .unwrap_err();
        assert_eq!(err, SyncError::FetchFailed("offline".into()));
        assert_eq!(
            store.status(&channel()),
            HistoryStatus::Failed("offline".into())
        );

        let retry = store.begin_initial(&channel());
        store.complete(&retry, Ok(page(1, 2))).unwrap();
        assert!(store.is_live(&channel()));
    }

    #[test]
    fn test_older_page_overlap_is_dropped() {
        let mut store = ready_store(3, page(4, 6));
        let ticket = store.begin_older(&channel()).unwrap().unwrap();
        // backend returned one message we already hold
        store.complete(&ticket, Ok(page(2, 4))).unwrap();

        let ids: Vec<_> = store
            .timeline(&channel())
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["m2", "m3", "m4", "m5", "m6"]);
    }

    #[test]
    fn test_insert_latest_requires_live_channel() {
        let mut store = HistoryStore::new(3);
        assert!(!store.insert_latest(msg(1, 10)));

        let mut store = ready_store(3, page(1, 2));
        assert!(store.insert_latest(msg(3, 30)));
        assert!(!store.insert_latest(msg(3, 30)));
        assert!(store.contains(&channel(), &MessageId::new("m3")));
        assert_eq!(store.timeline(&channel()).len(), 3);
    }

    #[test]
    fn test_push_during_initial_load_is_merged() {
        let mut store = HistoryStore::new(3);
        store.mount(&channel());
        let ticket = store.begin_initial(&channel());

        assert!(store.awaits_initial(&channel()));
        assert!(store.hold_pushed(msg(7, 70)));
        assert!(!store.hold_pushed(msg(7, 70)));
        assert!(store.contains(&channel(), &MessageId::new("m7")));

        // snapshot taken before m7 was persisted
        let outcome = store.complete(&ticket, Ok(page(4, 6))).unwrap();
        assert_eq!(outcome.added, 4);
        assert!(outcome.has_previous);
        let ids: Vec<_> = store
            .timeline(&channel())
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["m4", "m5", "m6", "m7"]);
        assert!(!store.awaits_initial(&channel()));
    }

    #[test]
    fn test_held_push_already_in_page_is_not_duplicated() {
        let mut store = HistoryStore::new(3);
        store.mount(&channel());
        let ticket = store.begin_initial(&channel());
        assert!(store.hold_pushed(msg(6, 60)));

        store.complete(&ticket, Ok(page(4, 6))).unwrap();
        assert_eq!(store.timeline(&channel()).len(), 3);
    }

    #[test]
    fn test_held_push_survives_failed_load() {
        let mut store = HistoryStore::new(3);
        store.mount(&channel());
        let ticket = store.begin_initial(&channel());
        assert!(store.hold_pushed(msg(9, 90)));
        store
            .complete(&ticket, Err(SyncError::FetchFailed("offline".into())))
            .unwrap_err();

        let retry = store.begin_initial(&channel());
        store.complete(&retry, Ok(page(1, 2))).unwrap();
        assert_eq!(store.timeline(&channel()).len(), 3);
    }

    #[test]
    fn test_push_during_refetch_survives_replacement() {
        let mut store = ready_store(3, page(4, 6));
        let refetch = store.begin_initial(&channel());
        assert!(store.insert_latest(msg(7, 70)));

        store.complete(&refetch, Ok(page(4, 6))).unwrap();
        let ids: Vec<_> = store
            .timeline(&channel())
            .iter()
            .map(|m| m.id.to_string())
            .collect();
        assert_eq!(ids, vec!["m4", "m5", "m6", "m7"]);
    }

    #[test]
    fn test_unmount_hands_back_held_pushes() {
        let mut store = HistoryStore::new(3);
        assert!(!store.hold_pushed(msg(1, 10)));

        store.mount(&channel());
        store.begin_initial(&channel());
        assert!(store.hold_pushed(msg(1, 10)));

        let held = store.unmount(&channel());
        assert_eq!(held, vec![msg(1, 10)]);
        assert!(!store.awaits_initial(&channel()));
        assert!(!store.contains(&channel(), &MessageId::new("m1")));
    }

    #[test]
    fn test_insert_into_empty_channel() {
        let mut store = ready_store(40, Vec::new());
        assert!(store.insert_latest(msg(1, 10)));
        assert_eq!(store.timeline(&channel()).len(), 1);
    }
}
