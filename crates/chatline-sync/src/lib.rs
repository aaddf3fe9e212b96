//! # Chatline Sync
//!
//! Chat feed synchronization and unread tracking for Chatline clients.
//!
//! Merges backward-paginated history, optimistic local sends and
//! push-delivered realtime events into one ordered, duplicate-free
//! timeline per channel, and decides where the unread divider goes.
//!
//! ## Features
//!
//! - Cursor-paginated history with stale-response discard
//! - Optimistic sends matched to confirmed messages by nonce
//! - Idempotent handling of at-least-once push delivery
//! - Read-cursor checkout with optimistic reset and rollback
//! - Per-channel unread counters
//! - Session-scoped realtime subscriptions torn down on logout
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use chatline_sync::{ChatSession, ChannelId, SyncConfig, UserId};
//! use chatline_sync::mock::{MockBackend, MockTransport};
//!
//! let transport = Arc::new(MockTransport::new());
//! let backend = Arc::new(MockBackend::new(UserId::new("me")).with_transport(transport.clone()));
//! let session = ChatSession::start(SyncConfig::default(), UserId::new("me"), backend, transport)?;
//!
//! let general = ChannelId::new("general");
//! session.open_channel(&general).await?;
//! session.send(&general, "Hello, world!").await?;
//!
//! let view = session.view(&general).await?;
//! for row in view.rows() {
//!     println!("{row:?}");
//! }
//!
//! session.logout().await?;
//! ```

pub mod backend;
pub mod config;
pub mod cursor;
pub mod error;
pub mod events;
pub mod history;
pub mod message;
pub mod mock;
pub mod pending;
pub mod reconciler;
pub mod session;
pub mod unread;

// Re-exports
pub use backend::{ChatBackend, RealtimeTransport};
pub use config::{Preset, SyncConfig};
pub use cursor::{CursorState, ReadCursor, ReadCursors};
pub use error::{SyncError, SyncResult};
pub use events::{Presence, PresenceEvent, RealtimeEvent, SyncNotification};
pub use history::{HistoryStatus, HistoryStore, LoadKind, LoadOutcome, LoadTicket};
pub use message::{ChannelId, Message, MessageId, Nonce, Page, UserId};
pub use pending::{PendingSend, PendingSends, SendStatus};
pub use reconciler::{Applied, ChannelView, Reconciler, TimelineRow};
pub use session::{ChatSession, SessionStatus};
pub use unread::{UnreadCounters, compute_divider};
