use std::future::Future;

use serde::{Deserialize, Serialize};

use towline_core::model::Message;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("push channel disconnected: {0}")]
    Disconnected(String),

    #[error("failed to establish push channel: {0}")]
    ConnectFailed(String),

    #[error("failed to emit event: {0}")]
    Emit(String),
}

/// Events this client emits to the push service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    /// Subscribe to one conversation's events.
    JoinChannel { chat_id: String },
    /// Ask the server to fan out a just-persisted message.
    BroadcastMessage { message: Message },
    Typing { chat_id: String, user_id: String },
    StopTyping { chat_id: String, user_id: String },
    /// Request a receipt confirmation for a single message.
    MarkMessageRead {
        chat_id: String,
        message_id: String,
        user_id: String,
    },
    /// Request receipt confirmations for every unread message in a chat.
    MarkChatRead { chat_id: String, user_id: String },
}

/// Events the push service delivers to this client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    MessageReceived { message: Message },
    TypingStarted { chat_id: String, user_id: String },
    TypingStopped { chat_id: String, user_id: String },
    /// Server-confirmed receipt for a single message; carries the updated
    /// message so `readBy` can be unioned locally.
    MessageRead { message: Message },
    /// Server-confirmed bulk receipt for a whole conversation.
    ChatRead { chat_id: String, user_id: String },
    PresenceChanged { user_id: String, online: bool },
}

/// The push channel this core consumes. The wire encoding and the
/// concrete client live outside this workspace; the engine only sees
/// typed events.
///
/// `recv` resolving to [`TransportError::Disconnected`] is the signal
/// that drives the coordinator's reconnect-and-resync policy.
pub trait PushTransport: Send + 'static {
    fn connect(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn emit(&mut self, event: ClientEvent)
    -> impl Future<Output = Result<(), TransportError>> + Send;

    fn recv(&mut self) -> impl Future<Output = Result<ServerEvent, TransportError>> + Send;

    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}
