use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use towline_api::{ApiError, ChatApi};
use towline_core::config::SyncConfig;
use towline_core::event::{Channel, Event, EventBus, EventPayload, EventSource};
use towline_core::model::{Message, Participant};
use towline_directory::{ConversationDirectory, DirectoryError, DirectoryUpdate};
use towline_messaging::{MessageChannel, MessagingError, ReceiveOutcome};
use towline_presence::{TypingExpiry, TypingTracker};
use towline_receipts::ReadReceiptPropagator;
use towline_transport::{ClientEvent, PushTransport, ServerEvent, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("reconnect attempts exhausted after {attempts}")]
    ReconnectExhausted { attempts: u32 },
}

/// The current user, injected explicitly instead of being read from
/// ambient storage inside components.
#[derive(Debug, Clone)]
pub struct Session {
    pub user: Participant,
}

impl Session {
    pub fn new(user: Participant) -> Self {
        Self { user }
    }

    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

/// Lifecycle of the single active conversation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    Joining,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        attempt: u32,
    },
}

/// The three intents the UI forwards, plus explicit retry and the
/// find-or-create entry point for starting a chat from a listing page.
#[derive(Debug, Clone)]
pub enum Intent {
    SelectConversation { chat_id: String },
    BeginConversation { peer_id: String },
    SendMessage { content: String },
    RetrySend { provisional_id: String },
    Keystroke,
}

/// Top-level controller of the messaging core.
///
/// All mutations are serialized through `&mut self` handlers: UI intents
/// come in through [`SyncCoordinator::run`]'s intent channel or direct
/// method calls, push events through the transport. The coordinator is
/// the single writer of the active-conversation pointer; every other
/// component sees it read-only.
pub struct SyncCoordinator<A, T> {
    session: Session,
    config: SyncConfig,
    api: Arc<A>,
    transport: T,
    bus: Arc<dyn EventBus>,
    directory: ConversationDirectory<A>,
    channel: MessageChannel<A>,
    typing: TypingTracker,
    receipts: ReadReceiptPropagator,
    channel_state: ChannelState,
    connection: ConnectionState,
}

impl<A, T> SyncCoordinator<A, T>
where
    A: ChatApi,
    T: PushTransport,
{
    pub fn new(
        session: Session,
        api: Arc<A>,
        transport: T,
        bus: Arc<dyn EventBus>,
        config: SyncConfig,
    ) -> Self {
        let directory = ConversationDirectory::new(api.clone());
        let channel = MessageChannel::new(api.clone());
        let typing = TypingTracker::new(&config.typing);
        let receipts = ReadReceiptPropagator::new(session.user.id.clone());
        Self {
            session,
            config,
            api,
            transport,
            bus,
            directory,
            channel,
            typing,
            receipts,
            channel_state: ChannelState::Closed,
            connection: ConnectionState::Disconnected,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn directory(&self) -> &ConversationDirectory<A> {
        &self.directory
    }

    pub fn channel(&self) -> &MessageChannel<A> {
        &self.channel
    }

    pub fn typing(&self) -> &TypingTracker {
        &self.typing
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel_state
    }

    pub fn connection_state(&self) -> &ConnectionState {
        &self.connection
    }

    /// Connect the push channel and pull the initial conversation list.
    pub async fn start(&mut self) -> Result<(), SyncError> {
        self.connection = ConnectionState::Connecting;
        if let Err(error) = self.transport.connect().await {
            self.connection = ConnectionState::Disconnected;
            return Err(error.into());
        }
        self.connection = ConnectionState::Connected;
        self.publish(
            "system.connection.established",
            EventPayload::ConnectionEstablished,
        );

        let user_id = self.session.user.id.clone();
        self.directory.load_all(&user_id).await?;
        self.publish("ui.conversation.list", EventPayload::ConversationListChanged);
        info!(conversations = self.directory.len(), "sync engine started");
        Ok(())
    }

    /// Make `chat_id` the active conversation: close the previous
    /// channel, join the push channel, pull history, optimistically clear
    /// unread, and request the bulk receipt.
    pub async fn select_conversation(&mut self, chat_id: &str) -> Result<(), SyncError> {
        if self.channel.active_chat() == Some(chat_id) && self.channel_state == ChannelState::Active
        {
            return Ok(());
        }

        self.close_active().await;
        self.channel_state = ChannelState::Joining;
        self.emit(ClientEvent::JoinChannel {
            chat_id: chat_id.to_string(),
        })
        .await;

        match self.channel.open(chat_id).await {
            Ok(count) => debug!(chat_id, count, "conversation opened"),
            Err(error) => {
                self.channel.close();
                self.channel_state = ChannelState::Closed;
                self.publish(
                    "system.error",
                    EventPayload::ErrorOccurred {
                        component: "messaging".into(),
                        message: error.to_string(),
                        recoverable: true,
                    },
                );
                return Err(error.into());
            }
        }
        self.channel_state = ChannelState::Active;

        if self.directory.clear_unread(chat_id) {
            self.publish(
                "ui.unread.cleared",
                EventPayload::UnreadCleared {
                    chat_id: chat_id.to_string(),
                },
            );
        }
        let request = self.receipts.mark_chat_read(chat_id);
        self.emit(request).await;

        self.publish(
            "ui.conversation.opened",
            EventPayload::ConversationOpened {
                chat_id: chat_id.to_string(),
            },
        );
        Ok(())
    }

    /// Find or create the conversation with `peer_id` and select it.
    pub async fn begin_conversation(&mut self, peer_id: &str) -> Result<(), SyncError> {
        let user_id = self.session.user.id.clone();
        let conversation = self.api.find_or_create_conversation(&user_id, peer_id).await?;
        let chat_id = conversation.id.clone();
        self.directory.upsert(conversation);
        self.publish("ui.conversation.list", EventPayload::ConversationListChanged);
        self.select_conversation(&chat_id).await
    }

    /// Optimistically append a message, persist it, and broadcast the
    /// confirmed result. On failure the message stays visible in a failed
    /// state for explicit retry.
    pub async fn send_message(&mut self, content: &str) -> Result<Message, SyncError> {
        let chat_id = self
            .channel
            .active_chat()
            .map(str::to_string)
            .ok_or(MessagingError::NoActiveConversation)?;

        if self.typing.stop_local(&chat_id) {
            let user_id = self.session.user.id.clone();
            self.emit(ClientEvent::StopTyping { chat_id, user_id }).await;
        }

        let provisional = self.channel.begin_send(&self.session.user, content)?;
        self.publish(
            "ui.message.pending",
            EventPayload::MessagePending {
                message: provisional.clone(),
            },
        );
        self.finish_send(&provisional.id).await
    }

    /// Reissue the persist request for a failed optimistic message.
    pub async fn retry_send(&mut self, provisional_id: &str) -> Result<Message, SyncError> {
        let message = self.channel.prepare_retry(provisional_id)?.clone();
        self.publish("ui.message.pending", EventPayload::MessagePending { message });
        self.finish_send(provisional_id).await
    }

    /// Register a keystroke in the active conversation's composer.
    pub async fn keystroke(&mut self) {
        let Some(chat_id) = self.channel.active_chat().map(str::to_string) else {
            return;
        };
        if self.typing.on_local_keystroke(&chat_id, Instant::now()) {
            let user_id = self.session.user.id.clone();
            self.emit(ClientEvent::Typing { chat_id, user_id }).await;
        }
    }

    /// Apply one push event to the stores.
    pub async fn handle_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { message } => self.on_message_received(message).await,
            ServerEvent::TypingStarted { chat_id, user_id } => {
                if user_id != self.session.user.id {
                    self.typing
                        .on_remote_typing(&chat_id, &user_id, Instant::now());
                    self.publish(
                        "push.typing.started",
                        EventPayload::TypingStarted { chat_id, user_id },
                    );
                }
            }
            ServerEvent::TypingStopped { chat_id, user_id } => {
                if self.typing.on_remote_stop(&chat_id, &user_id) {
                    self.publish(
                        "push.typing.stopped",
                        EventPayload::TypingStopped { chat_id, user_id },
                    );
                }
            }
            ServerEvent::MessageRead { message } => {
                if self.receipts.apply_message_read(&mut self.channel, &message) {
                    self.publish(
                        "push.message.read",
                        EventPayload::MessageRead {
                            chat_id: message.chat_id.clone(),
                            message_id: message.id.clone(),
                        },
                    );
                }
            }
            ServerEvent::ChatRead { chat_id, user_id } => {
                let outcome = self.receipts.apply_chat_read(
                    &mut self.channel,
                    &mut self.directory,
                    &chat_id,
                    &user_id,
                );
                if outcome.unread_reconciled {
                    self.publish(
                        "ui.unread.cleared",
                        EventPayload::UnreadCleared {
                            chat_id: chat_id.clone(),
                        },
                    );
                    self.publish("ui.conversation.list", EventPayload::ConversationListChanged);
                }
                self.publish("push.chat.read", EventPayload::ChatRead { chat_id, user_id });
            }
            ServerEvent::PresenceChanged { user_id, online } => {
                if user_id != self.session.user.id
                    && self.directory.set_online(&user_id, online) > 0
                {
                    self.publish(
                        "push.presence.changed",
                        EventPayload::PresenceChanged { user_id, online },
                    );
                }
            }
        }
    }

    /// Force a full state rebuild from the pull API: the push channel has
    /// no replay, so this is the only repair for events missed while
    /// disconnected.
    pub async fn resync(&mut self) -> Result<(), SyncError> {
        self.publish("system.sync.started", EventPayload::SyncStarted);

        let user_id = self.session.user.id.clone();
        self.directory.load_all(&user_id).await?;
        self.publish("ui.conversation.list", EventPayload::ConversationListChanged);

        let mut messages = 0;
        if let Some(chat_id) = self.channel.active_chat().map(str::to_string) {
            self.channel_state = ChannelState::Joining;
            self.emit(ClientEvent::JoinChannel {
                chat_id: chat_id.clone(),
            })
            .await;
            messages = self.channel.open(&chat_id).await?;
            self.channel_state = ChannelState::Active;

            if self.directory.clear_unread(&chat_id) {
                self.publish(
                    "ui.unread.cleared",
                    EventPayload::UnreadCleared {
                        chat_id: chat_id.clone(),
                    },
                );
            }
            let request = self.receipts.mark_chat_read(&chat_id);
            self.emit(request).await;
            self.publish(
                "ui.conversation.opened",
                EventPayload::ConversationOpened { chat_id },
            );
        }

        self.publish(
            "system.sync.completed",
            EventPayload::SyncCompleted {
                conversations: self.directory.len(),
                messages,
            },
        );
        Ok(())
    }

    /// Fire any typing deadlines that are due.
    pub async fn poll_typing(&mut self) {
        for expiry in self.typing.poll(Instant::now()) {
            match expiry {
                TypingExpiry::LocalIdle { chat_id } => {
                    let user_id = self.session.user.id.clone();
                    self.emit(ClientEvent::StopTyping { chat_id, user_id }).await;
                }
                TypingExpiry::RemoteStale { chat_id, user_id } => {
                    self.publish(
                        "push.typing.stopped",
                        EventPayload::TypingStopped { chat_id, user_id },
                    );
                }
            }
        }
    }

    /// Drive the engine: push events, UI intents, and typing deadlines,
    /// until the intent channel closes. Transport drops are recovered
    /// with backoff and a full resync.
    pub async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<Intent>,
    ) -> Result<(), SyncError> {
        loop {
            let deadline = self.typing.next_deadline();
            let wake = tokio::select! {
                event = self.transport.recv() => Wake::Push(event),
                intent = intents.recv() => Wake::Intent(intent),
                _ = sleep_until_deadline(deadline) => Wake::Timer,
            };

            match wake {
                Wake::Push(Ok(event)) => self.handle_server_event(event).await,
                Wake::Push(Err(TransportError::Disconnected(reason))) => {
                    match self.recover(reason).await {
                        Ok(()) => {}
                        Err(error @ SyncError::ReconnectExhausted { .. }) => return Err(error),
                        Err(error) => {
                            // Stale but consistent; the next event or
                            // intent can trigger another repair.
                            warn!(error = %error, "resync failed");
                            self.publish(
                                "system.error",
                                EventPayload::ErrorOccurred {
                                    component: "sync".into(),
                                    message: error.to_string(),
                                    recoverable: true,
                                },
                            );
                        }
                    }
                }
                Wake::Push(Err(error)) => warn!(error = %error, "transport receive error"),
                Wake::Intent(Some(intent)) => self.dispatch(intent).await,
                Wake::Intent(None) => {
                    info!("intent channel closed, shutting down");
                    self.shutdown().await;
                    return Ok(());
                }
                Wake::Timer => self.poll_typing().await,
            }
        }
    }

    async fn dispatch(&mut self, intent: Intent) {
        let result = match intent {
            Intent::SelectConversation { chat_id } => self.select_conversation(&chat_id).await,
            Intent::BeginConversation { peer_id } => self.begin_conversation(&peer_id).await,
            Intent::SendMessage { content } => self.send_message(&content).await.map(|_| ()),
            Intent::RetrySend { provisional_id } => {
                self.retry_send(&provisional_id).await.map(|_| ())
            }
            Intent::Keystroke => {
                self.keystroke().await;
                Ok(())
            }
        };
        // Failures were already surfaced on the bus where the UI needs
        // them; the intent itself has no reply channel.
        if let Err(error) = result {
            warn!(error = %error, "intent failed");
        }
    }

    async fn on_message_received(&mut self, message: Message) {
        let self_id = self.session.user.id.clone();
        let active = self.channel.active_chat().map(str::to_string);

        let inserted = self.channel.receive(message.clone()) == ReceiveOutcome::Inserted;

        if self
            .directory
            .apply_incoming(&message, active.as_deref(), &self_id)
            == DirectoryUpdate::UnknownConversation
        {
            self.refresh_directory().await;
        }
        self.publish("ui.conversation.list", EventPayload::ConversationListChanged);

        if inserted {
            self.publish(
                "push.message.received",
                EventPayload::MessageReceived {
                    message: message.clone(),
                },
            );
            if !message.is_from(&self_id) {
                // Observed while its conversation is on screen.
                let request = self.receipts.mark_message_read(&message.chat_id, &message.id);
                self.emit(request).await;
            }
        }
    }

    async fn refresh_directory(&mut self) {
        let user_id = self.session.user.id.clone();
        if let Err(error) = self.directory.load_all(&user_id).await {
            warn!(error = %error, "directory refresh failed");
            self.publish(
                "system.error",
                EventPayload::ErrorOccurred {
                    component: "directory".into(),
                    message: error.to_string(),
                    recoverable: true,
                },
            );
        }
    }

    async fn finish_send(&mut self, provisional_id: &str) -> Result<Message, SyncError> {
        let result = self.channel.complete_send(provisional_id).await;
        match result {
            Ok((confirmed, outcome)) => {
                debug!(id = %confirmed.id, ?outcome, "send confirmed");

                let self_id = self.session.user.id.clone();
                let active = self.channel.active_chat().map(str::to_string);
                if self
                    .directory
                    .apply_incoming(&confirmed, active.as_deref(), &self_id)
                    == DirectoryUpdate::UnknownConversation
                {
                    self.refresh_directory().await;
                }
                self.publish("ui.conversation.list", EventPayload::ConversationListChanged);

                self.emit(ClientEvent::BroadcastMessage {
                    message: confirmed.clone(),
                })
                .await;
                self.publish(
                    "ui.message.confirmed",
                    EventPayload::MessageConfirmed {
                        provisional_id: provisional_id.to_string(),
                        message: confirmed.clone(),
                    },
                );
                Ok(confirmed)
            }
            Err(error) => {
                warn!(provisional_id, error = %error, "send failed");
                self.publish(
                    "ui.message.failed",
                    EventPayload::MessageFailed {
                        provisional_id: provisional_id.to_string(),
                        reason: error.to_string(),
                    },
                );
                Err(error.into())
            }
        }
    }

    async fn close_active(&mut self) {
        let Some(previous) = self.channel.close() else {
            return;
        };
        self.channel_state = ChannelState::Closed;
        if self.typing.stop_local(&previous) {
            let user_id = self.session.user.id.clone();
            self.emit(ClientEvent::StopTyping {
                chat_id: previous.clone(),
                user_id,
            })
            .await;
        }
        self.publish(
            "ui.conversation.closed",
            EventPayload::ConversationClosed { chat_id: previous },
        );
    }

    async fn recover(&mut self, reason: String) -> Result<(), SyncError> {
        info!(reason = %reason, "push channel lost, reconnecting");
        self.publish(
            "system.connection.lost",
            EventPayload::ConnectionLost {
                reason,
                will_retry: true,
            },
        );

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if attempt > self.config.reconnect.max_attempts {
                self.connection = ConnectionState::Disconnected;
                self.publish(
                    "system.connection.lost",
                    EventPayload::ConnectionLost {
                        reason: "reconnect attempts exhausted".into(),
                        will_retry: false,
                    },
                );
                return Err(SyncError::ReconnectExhausted {
                    attempts: self.config.reconnect.max_attempts,
                });
            }

            self.connection = ConnectionState::Reconnecting { attempt };
            self.publish(
                "system.connection.reconnecting",
                EventPayload::ConnectionReconnecting { attempt },
            );
            tokio::time::sleep(self.config.reconnect.delay_for_attempt(attempt)).await;

            match self.transport.connect().await {
                Ok(()) => break,
                Err(error) => warn!(attempt, error = %error, "reconnect attempt failed"),
            }
        }

        self.connection = ConnectionState::Connected;
        self.publish(
            "system.connection.established",
            EventPayload::ConnectionEstablished,
        );
        self.resync().await
    }

    async fn shutdown(&mut self) {
        self.close_active().await;
        if let Err(error) = self.transport.close().await {
            warn!(error = %error, "transport close failed");
        }
        self.connection = ConnectionState::Disconnected;
    }

    async fn emit(&mut self, event: ClientEvent) {
        if let Err(error) = self.transport.emit(event).await {
            // Degrades to stale-but-consistent; resync repairs later.
            warn!(error = %error, "push emit failed");
        }
    }

    fn publish(&self, channel: &'static str, payload: EventPayload) {
        let event = Event::new(
            Channel::new(channel).unwrap(),
            EventSource::System("sync".into()),
            payload,
        );
        if let Err(error) = self.bus.publish(event) {
            warn!(error = %error, channel, "event publish failed");
        }
    }
}

/// What woke the run loop this iteration.
enum Wake {
    Push(Result<ServerEvent, TransportError>),
    Intent(Option<Intent>),
    Timer,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
