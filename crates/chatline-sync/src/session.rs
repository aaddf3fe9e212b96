//! Session runtime
//!
//! A [`ChatSession`] is a cheap handle to one reconciliation loop. The loop
//! owns the [`Reconciler`] and is the only code that mutates it. Network
//! calls run in spawned tasks whose results come back as commands on the
//! same bounded queue, and every realtime subscription is forwarded into
//! that queue in receipt order. Logging out unsubscribes every channel and
//! stops the loop, so no subscription outlives its session.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::backend::{ChatBackend, RealtimeTransport};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{RealtimeEvent, SyncNotification};
use crate::history::{LoadOutcome, LoadTicket};
use crate::message::{ChannelId, Message, Nonce, UserId};
use crate::reconciler::{ChannelView, Reconciler};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Authenticated; subscriptions may be live
    Active,
    /// Logged out; all subscriptions are torn down
    LoggedOut,
}

type Reply<T> = oneshot::Sender<SyncResult<T>>;

enum Command {
    Open {
        channel_id: ChannelId,
        reply: Reply<()>,
    },
    Watch {
        channel_id: ChannelId,
        reply: Reply<()>,
    },
    Close {
        channel_id: ChannelId,
    },
    LoadOlder {
        channel_id: ChannelId,
        reply: Reply<Option<LoadOutcome>>,
    },
    Retry {
        channel_id: ChannelId,
        reply: Reply<()>,
    },
    Send {
        channel_id: ChannelId,
        body: String,
        reply: Reply<Nonce>,
    },
    RetrySend {
        channel_id: ChannelId,
        nonce: Nonce,
        reply: Reply<()>,
    },
    Discard {
        channel_id: ChannelId,
        nonce: Nonce,
        reply: Reply<()>,
    },
    MarkRead {
        channel_id: ChannelId,
        reply: Reply<()>,
    },
    View {
        channel_id: ChannelId,
        reply: oneshot::Sender<ChannelView>,
    },
    Event(RealtimeEvent),
    PageLoaded {
        ticket: LoadTicket,
        result: SyncResult<Vec<Message>>,
        reply: PageReply,
    },
    CursorFetched {
        channel_id: ChannelId,
        result: SyncResult<Option<DateTime<Utc>>>,
    },
    SendFinished {
        channel_id: ChannelId,
        nonce: Nonce,
        result: SyncResult<Message>,
    },
    MarkReadFinished {
        channel_id: ChannelId,
        result: SyncResult<DateTime<Utc>>,
        reply: Reply<()>,
    },
    Logout {
        reply: oneshot::Sender<()>,
    },
}

/// Who is waiting for a page load
enum PageReply {
    Initial(Reply<()>),
    Older(Reply<Option<LoadOutcome>>),
}

/// Handle to a running sync session
#[derive(Clone)]
pub struct ChatSession {
    commands: mpsc::Sender<Command>,
    notify_tx: broadcast::Sender<SyncNotification>,
    status: watch::Receiver<SessionStatus>,
    viewer: UserId,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("viewer", &self.viewer)
            .field("status", &*self.status.borrow())
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    /// Start a session for an authenticated user.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: SyncConfig,
        viewer: UserId,
        backend: Arc<dyn ChatBackend>,
        transport: Arc<dyn RealtimeTransport>,
    ) -> SyncResult<Self> {
        config.validate()?;

        let (commands, rx) = mpsc::channel(config.command_queue_capacity);
        let (status_tx, status) = watch::channel(SessionStatus::Active);
        let reconciler = Reconciler::new(viewer.clone(), &config);
        let notify_tx = reconciler.notifier();

        let session_loop = SessionLoop {
            config,
            reconciler,
            backend,
            transport,
            commands: commands.downgrade(),
            subscriptions: HashMap::new(),
            status_tx,
        };
        tokio::spawn(
            session_loop
                .run(rx)
                .instrument(info_span!("chat_session", viewer = %viewer)),
        );
        info!(viewer = %viewer, "chat session started");

        Ok(Self {
            commands,
            notify_tx,
            status,
            viewer,
        })
    }

    /// The viewing user
    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    /// Current lifecycle state
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch lifecycle changes
    pub fn status_changes(&self) -> watch::Receiver<SessionStatus> {
        self.status.clone()
    }

    /// Subscribe to change notifications
    pub fn notifications(&self) -> broadcast::Receiver<SyncNotification> {
        self.notify_tx.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> SyncResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(make(reply)).await?;
        rx.await?
    }

    /// Open a channel: subscribe, load the most recent page and check out the read cursor.
    ///
    /// Resolves once the first page is applied; a cached channel resolves immediately.
    pub async fn open_channel(&self, channel_id: &ChannelId) -> SyncResult<()> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::Open { channel_id, reply }).await
    }

    /// Receive a channel's realtime events without opening it.
    ///
    /// Messages arriving before the channel is first opened only count
    /// towards its unread counter.
    pub async fn watch_channel(&self, channel_id: &ChannelId) -> SyncResult<()> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::Watch { channel_id, reply })
            .await
    }

    /// Navigate away from a channel; in-flight results for it are discarded
    pub async fn close_channel(&self, channel_id: &ChannelId) -> SyncResult<()> {
        self.commands
            .send(Command::Close {
                channel_id: channel_id.clone(),
            })
            .await?;
        Ok(())
    }

    /// Load the next older page.
    ///
    /// `Ok(None)` means there was nothing to load or the response was
    /// superseded; `AlreadyLoading` means another load is in flight.
    pub async fn load_older(&self, channel_id: &ChannelId) -> SyncResult<Option<LoadOutcome>> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::LoadOlder { channel_id, reply })
            .await
    }

    /// Reload the most recent page after a failure
    pub async fn retry(&self, channel_id: &ChannelId) -> SyncResult<()> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::Retry { channel_id, reply }).await
    }

    /// Send a message optimistically; returns the nonce of the pending send
    pub async fn send(&self, channel_id: &ChannelId, body: impl Into<String>) -> SyncResult<Nonce> {
        let channel_id = channel_id.clone();
        let body = body.into();
        self.request(|reply| Command::Send {
            channel_id,
            body,
            reply,
        })
        .await
    }

    /// Re-send a failed message
    pub async fn retry_send(&self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<()> {
        let channel_id = channel_id.clone();
        let nonce = nonce.clone();
        self.request(|reply| Command::RetrySend {
            channel_id,
            nonce,
            reply,
        })
        .await
    }

    /// Discard a pending or failed send
    pub async fn discard(&self, channel_id: &ChannelId, nonce: &Nonce) -> SyncResult<()> {
        let channel_id = channel_id.clone();
        let nonce = nonce.clone();
        self.request(|reply| Command::Discard {
            channel_id,
            nonce,
            reply,
        })
        .await
    }

    /// Mark a channel read up to now
    pub async fn mark_read(&self, channel_id: &ChannelId) -> SyncResult<()> {
        let channel_id = channel_id.clone();
        self.request(|reply| Command::MarkRead { channel_id, reply })
            .await
    }

    /// Snapshot of a channel's render model
    pub async fn view(&self, channel_id: &ChannelId) -> SyncResult<ChannelView> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::View {
                channel_id: channel_id.clone(),
                reply,
            })
            .await?;
        Ok(rx.await?)
    }

    /// Tear down every subscription and stop the session
    pub async fn logout(&self) -> SyncResult<()> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Logout { reply }).await?;
        rx.await?;
        Ok(())
    }
}

struct SessionLoop {
    config: SyncConfig,
    reconciler: Reconciler,
    backend: Arc<dyn ChatBackend>,
    transport: Arc<dyn RealtimeTransport>,
    commands: mpsc::WeakSender<Command>,
    subscriptions: HashMap<ChannelId, JoinHandle<()>>,
    status_tx: watch::Sender<SessionStatus>,
}

/// Post a task's result back to the loop unless the session is gone
async fn post(commands: &mpsc::WeakSender<Command>, command: Command) {
    if let Some(tx) = commands.upgrade() {
        let _ = tx.send(command).await;
    }
}

impl SessionLoop {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            if self.handle(command).await.is_break() {
                return;
            }
        }
        // every handle dropped
        self.teardown().await;
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Open { channel_id, reply } => self.open(channel_id, reply).await,
            Command::Watch { channel_id, reply } => {
                let result = self.subscribe(&channel_id).await;
                if let Err(e) = &result {
                    warn!(%channel_id, error = %e, "realtime subscription failed");
                }
                let _ = reply.send(result);
            }
            Command::Close { channel_id } => {
                debug!(%channel_id, "closing channel");
                self.reconciler.close_channel(&channel_id);
            }
            Command::LoadOlder { channel_id, reply } => match self.reconciler.begin_older(&channel_id) {
                Ok(Some(ticket)) => self.spawn_fetch(ticket, PageReply::Older(reply)),
                Ok(None) => {
                    let _ = reply.send(Ok(None));
                }
                Err(e) => {
                    debug!(%channel_id, error = %e, "load older rejected");
                    let _ = reply.send(Err(e));
                }
            },
            Command::Retry { channel_id, reply } => match self.reconciler.retry(&channel_id) {
                Ok(ticket) => self.spawn_fetch(ticket, PageReply::Initial(reply)),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Send {
                channel_id,
                body,
                reply,
            } => {
                let nonce = self.reconciler.add_pending(&channel_id, body.clone());
                self.spawn_send(channel_id, body, nonce.clone());
                let _ = reply.send(Ok(nonce));
            }
            Command::RetrySend {
                channel_id,
                nonce,
                reply,
            } => match self.reconciler.retry_send(&channel_id, &nonce) {
                Ok(pending) => {
                    self.spawn_send(channel_id, pending.body, nonce);
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Discard {
                channel_id,
                nonce,
                reply,
            } => {
                let _ = reply.send(self.reconciler.discard(&channel_id, &nonce).map(|_| ()));
            }
            Command::MarkRead { channel_id, reply } => {
                let backend = self.backend.clone();
                let commands = self.commands.clone();
                tokio::spawn(async move {
                    let result = backend.mark_read(&channel_id).await;
                    post(
                        &commands,
                        Command::MarkReadFinished {
                            channel_id,
                            result,
                            reply,
                        },
                    )
                    .await;
                });
            }
            Command::View { channel_id, reply } => {
                let _ = reply.send(self.reconciler.view(&channel_id));
            }
            Command::Event(event) => {
                let applied = self.reconciler.apply(event);
                debug!(?applied, "applied realtime event");
            }
            Command::PageLoaded {
                ticket,
                result,
                reply,
            } => self.page_loaded(ticket, result, reply),
            Command::CursorFetched { channel_id, result } => {
                // failures roll back and are already logged
                let _ = self.reconciler.complete_cursor_fetch(&channel_id, result);
            }
            Command::SendFinished {
                channel_id,
                nonce,
                result,
            } => match result {
                Ok(message) => {
                    self.reconciler.send_succeeded(&nonce, message);
                }
                Err(e) => {
                    self.reconciler.send_failed(&channel_id, &nonce, e);
                }
            },
            Command::MarkReadFinished {
                channel_id,
                result,
                reply,
            } => {
                let result = result.map(|at| self.reconciler.marked_read(&channel_id, at));
                if let Err(e) = &result {
                    warn!(%channel_id, error = %e, "mark read failed");
                }
                let _ = reply.send(result);
            }
            Command::Logout { reply } => {
                self.teardown().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn open(&mut self, channel_id: ChannelId, reply: Reply<()>) {
        if let Err(e) = self.subscribe(&channel_id).await {
            warn!(%channel_id, error = %e, "realtime subscription failed");
            let _ = reply.send(Err(e));
            return;
        }

        let ticket = self.reconciler.open_channel(&channel_id, Utc::now());

        let backend = self.backend.clone();
        let commands = self.commands.clone();
        let cursor_channel = channel_id.clone();
        tokio::spawn(async move {
            let result = backend.fetch_read_cursor(&cursor_channel).await;
            post(
                &commands,
                Command::CursorFetched {
                    channel_id: cursor_channel,
                    result,
                },
            )
            .await;
        });

        match ticket {
            Some(ticket) => self.spawn_fetch(ticket, PageReply::Initial(reply)),
            None => {
                let _ = reply.send(Ok(()));
            }
        }
    }

    async fn subscribe(&mut self, channel_id: &ChannelId) -> SyncResult<()> {
        if self
            .subscriptions
            .get(channel_id)
            .is_some_and(|task| !task.is_finished())
        {
            return Ok(());
        }

        let mut events = self
            .transport
            .subscribe(channel_id, self.config.event_queue_capacity)
            .await
            .map_err(|e| match e {
                SyncError::SubscriptionFailed(reason) => SyncError::SubscriptionFailed(reason),
                other => SyncError::SubscriptionFailed(other.to_string()),
            })?;

        let commands = self.commands.clone();
        let forward_channel = channel_id.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(tx) = commands.upgrade() else {
                    break;
                };
                if tx.send(Command::Event(event)).await.is_err() {
                    break;
                }
            }
            debug!(channel_id = %forward_channel, "realtime forwarder exited");
        });
        self.subscriptions.insert(channel_id.clone(), task);
        info!(%channel_id, "realtime subscription established");
        Ok(())
    }

    fn spawn_fetch(&self, ticket: LoadTicket, reply: PageReply) {
        let backend = self.backend.clone();
        let commands = self.commands.clone();
        let limit = self.config.page_size;
        tokio::spawn(async move {
            let result = backend
                .fetch_messages(&ticket.channel_id, ticket.kind.cursor(), limit)
                .await;
            post(
                &commands,
                Command::PageLoaded {
                    ticket,
                    result,
                    reply,
                },
            )
            .await;
        });
    }

    fn spawn_send(&self, channel_id: ChannelId, body: String, nonce: Nonce) {
        let backend = self.backend.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let result = backend.send_message(&channel_id, &body, &nonce).await;
            post(
                &commands,
                Command::SendFinished {
                    channel_id,
                    nonce,
                    result,
                },
            )
            .await;
        });
    }

    fn page_loaded(&mut self, ticket: LoadTicket, result: SyncResult<Vec<Message>>, reply: PageReply) {
        let outcome = match self.reconciler.complete_load(&ticket, result) {
            // superseded requests are an expected race, not a failure
            Err(SyncError::StaleResponseDiscarded { .. }) => Ok(None),
            other => other.map(Some),
        };
        match reply {
            PageReply::Initial(reply) => {
                let _ = reply.send(outcome.map(|_| ()));
            }
            PageReply::Older(reply) => {
                let _ = reply.send(outcome);
            }
        }
    }

    async fn teardown(&mut self) {
        for (channel_id, task) in self.subscriptions.drain() {
            self.transport.unsubscribe(&channel_id).await;
            task.abort();
            info!(%channel_id, "realtime subscription torn down");
        }
        let _ = self.status_tx.send(SessionStatus::LoggedOut);
        info!(viewer = %self.reconciler.viewer(), "chat session closed");
    }
}
