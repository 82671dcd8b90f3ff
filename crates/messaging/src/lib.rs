use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use towline_api::{ApiError, ChatApi};
use towline_core::model::{Message, Participant};

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("failed to load history: {0}")]
    Load(#[from] ApiError),

    #[error("no active conversation")]
    NoActiveConversation,

    #[error("unknown provisional message {0}")]
    UnknownProvisional(String),

    #[error("send failed for {provisional_id}: {source}")]
    SendFailed {
        provisional_id: String,
        source: ApiError,
    },
}

/// Client-side delivery state of an entry in the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Optimistically appended, persist request in flight.
    Pending,
    /// Server-confirmed (or arrived from the server in the first place).
    Confirmed,
    /// Persist request failed; kept visible for explicit retry.
    Failed,
}

#[derive(Debug, Clone)]
pub struct ChannelEntry {
    pub message: Message,
    pub delivery: Delivery,
}

/// How a send confirmation reconciled with the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The provisional entry was swapped to the server identity.
    Swapped,
    /// The broadcast echo landed before the confirmation response; the
    /// provisional entry was dropped in favor of the echo's entry.
    EchoWon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    Inserted,
    /// Already known by final id, from either delivery path.
    Duplicate,
    /// Not the active conversation; the directory handles it instead.
    Inactive,
}

/// Ordered message log of the currently active conversation.
///
/// At most one conversation is open at a time; opening a new one
/// implicitly closes the previous. The `known_ids` set is consulted on
/// every inbound path, so a message can arrive via the send-confirmation
/// response and the broadcast echo in either order without duplicating.
pub struct MessageChannel<A> {
    api: Arc<A>,
    active_chat: Option<String>,
    entries: Vec<ChannelEntry>,
    known_ids: HashSet<String>,
}

impl<A: ChatApi> MessageChannel<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            active_chat: None,
            entries: Vec::new(),
            known_ids: HashSet::new(),
        }
    }

    pub fn active_chat(&self) -> Option<&str> {
        self.active_chat.as_deref()
    }

    pub fn entries(&self) -> &[ChannelEntry] {
        &self.entries
    }

    pub fn get(&self, message_id: &str) -> Option<&ChannelEntry> {
        self.entries.iter().find(|e| e.message.id == message_id)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.known_ids.contains(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all channel state and return the previously active chat id.
    pub fn close(&mut self) -> Option<String> {
        self.entries.clear();
        self.known_ids.clear();
        self.active_chat.take()
    }

    /// Switch the active pointer to `chat_id` and pull its full history.
    /// The previous channel is closed first. On a pull failure the
    /// channel stays open with an empty log; the caller may retry.
    pub async fn open(&mut self, chat_id: &str) -> Result<usize, MessagingError> {
        self.close();
        self.active_chat = Some(chat_id.to_string());
        let history = self.api.fetch_messages(chat_id).await?;
        debug!(chat_id, count = history.len(), "history loaded");
        if !self.install_history(chat_id, history) {
            return Ok(0);
        }
        Ok(self.entries.len())
    }

    /// Install a pulled history. Returns false when `chat_id` no longer
    /// matches the active pointer (the user navigated away before the
    /// response landed); the stale response is discarded.
    pub fn install_history(&mut self, chat_id: &str, mut history: Vec<Message>) -> bool {
        if self.active_chat.as_deref() != Some(chat_id) {
            debug!(chat_id, "discarding history for non-active conversation");
            return false;
        }
        history.sort_by(Message::timeline_order);
        self.entries.clear();
        self.known_ids.clear();
        for message in history {
            if self.known_ids.insert(message.id.clone()) {
                self.entries.push(ChannelEntry {
                    message,
                    delivery: Delivery::Confirmed,
                });
            }
        }
        true
    }

    /// Materialize an optimistic message with a provisional id and append
    /// it. The persist request is issued separately via
    /// [`MessageChannel::complete_send`].
    pub fn begin_send(
        &mut self,
        sender: &Participant,
        content: &str,
    ) -> Result<Message, MessagingError> {
        let chat_id = self
            .active_chat
            .clone()
            .ok_or(MessagingError::NoActiveConversation)?;
        let message = Message::new(
            format!("tmp-{}", Uuid::new_v4()),
            chat_id,
            sender.clone(),
            content,
            Utc::now(),
        );
        self.insert_sorted(message.clone(), Delivery::Pending);
        Ok(message)
    }

    /// Issue the persist request for a pending entry. On success the
    /// provisional entry is replaced in place by the server-confirmed
    /// message and is never appended twice, whichever of the confirmation
    /// response and the broadcast echo arrives first. On failure the
    /// entry is marked failed and stays visible.
    pub async fn complete_send(
        &mut self,
        provisional_id: &str,
    ) -> Result<(Message, ConfirmOutcome), MessagingError> {
        let entry = self
            .get(provisional_id)
            .ok_or_else(|| MessagingError::UnknownProvisional(provisional_id.to_string()))?;
        let chat_id = entry.message.chat_id.clone();
        let sender_id = entry.message.sender.id.clone();
        let content = entry.message.content.clone();

        let result = self.api.send_message(&chat_id, &sender_id, &content).await;
        match result {
            Ok(confirmed) => {
                let outcome = self.confirm_send(provisional_id, confirmed.clone())?;
                Ok((confirmed, outcome))
            }
            Err(source) => {
                self.mark_failed(provisional_id);
                Err(MessagingError::SendFailed {
                    provisional_id: provisional_id.to_string(),
                    source,
                })
            }
        }
    }

    /// Flip a failed entry back to pending so the send can be reissued.
    pub fn prepare_retry(&mut self, provisional_id: &str) -> Result<&Message, MessagingError> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.message.id == provisional_id && e.delivery == Delivery::Failed)
            .ok_or_else(|| MessagingError::UnknownProvisional(provisional_id.to_string()))?;
        entry.delivery = Delivery::Pending;
        Ok(&entry.message)
    }

    /// Feed a pushed message into the channel. Idempotent: a message
    /// already known by its final id is a no-op.
    pub fn receive(&mut self, message: Message) -> ReceiveOutcome {
        if self.active_chat.as_deref() != Some(message.chat_id.as_str()) {
            return ReceiveOutcome::Inactive;
        }
        if self.known_ids.contains(&message.id) {
            debug!(id = %message.id, "duplicate message ignored");
            return ReceiveOutcome::Duplicate;
        }
        self.insert_sorted(message, Delivery::Confirmed);
        ReceiveOutcome::Inserted
    }

    /// Union `user_id` into one message's reader set.
    pub fn apply_read(&mut self, message_id: &str, user_id: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == message_id) {
            Some(entry) => entry.message.mark_read_by(user_id),
            None => false,
        }
    }

    /// Union the reader set of a server-updated message into the local
    /// copy with the same id.
    pub fn apply_read_union(&mut self, updated: &Message) -> bool {
        match self.entries.iter_mut().find(|e| e.message.id == updated.id) {
            Some(entry) => entry
                .message
                .merge_read_by(updated.read_by().iter().cloned()),
            None => false,
        }
    }

    /// Bulk receipt: `reader_id` has seen every message it did not send.
    /// Returns how many messages changed.
    pub fn apply_chat_read(&mut self, chat_id: &str, reader_id: &str) -> usize {
        if self.active_chat.as_deref() != Some(chat_id) {
            return 0;
        }
        self.entries
            .iter_mut()
            .filter(|e| !e.message.is_from(reader_id))
            .map(|e| e.message.mark_read_by(reader_id))
            .filter(|changed| *changed)
            .count()
    }

    fn confirm_send(
        &mut self,
        provisional_id: &str,
        confirmed: Message,
    ) -> Result<ConfirmOutcome, MessagingError> {
        let index = self
            .entries
            .iter()
            .position(|e| e.message.id == provisional_id)
            .ok_or_else(|| MessagingError::UnknownProvisional(provisional_id.to_string()))?;

        self.known_ids.remove(provisional_id);
        self.entries.remove(index);

        if self.known_ids.contains(&confirmed.id) {
            // The broadcast echo beat the confirmation response. Keep the
            // echo's entry and only union any reader state.
            warn!(id = %confirmed.id, "echo arrived before send confirmation");
            self.apply_read_union(&confirmed);
            return Ok(ConfirmOutcome::EchoWon);
        }

        self.insert_sorted(confirmed, Delivery::Confirmed);
        Ok(ConfirmOutcome::Swapped)
    }

    fn mark_failed(&mut self, provisional_id: &str) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.message.id == provisional_id)
        {
            entry.delivery = Delivery::Failed;
        }
    }

    fn insert_sorted(&mut self, message: Message, delivery: Delivery) {
        let index = self
            .entries
            .partition_point(|e| Message::timeline_order(&e.message, &message) == Ordering::Less);
        self.known_ids.insert(message.id.clone());
        self.entries.insert(index, ChannelEntry { message, delivery });
    }
}
