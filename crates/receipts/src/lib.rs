use tracing::debug;

use towline_api::ChatApi;
use towline_core::model::Message;
use towline_directory::ConversationDirectory;
use towline_messaging::MessageChannel;
use towline_transport::ClientEvent;

/// Effect of a confirmed bulk receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatReadOutcome {
    pub messages_changed: usize,
    /// True when the confirmation was for the session user and the
    /// directory's optimistic unread reset was re-asserted.
    pub unread_reconciled: bool,
}

/// Tracks which participants have seen which messages.
///
/// Requests are built here and emitted by the coordinator; only
/// server-confirmed events mutate `read_by`, and every mutation is a
/// union, so duplicated or reordered confirmations cannot regress state.
pub struct ReadReceiptPropagator {
    user_id: String,
}

impl ReadReceiptPropagator {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Request confirmation that the session user has seen one inbound
    /// message (fired while its conversation is active).
    pub fn mark_message_read(&self, chat_id: &str, message_id: &str) -> ClientEvent {
        ClientEvent::MarkMessageRead {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            user_id: self.user_id.clone(),
        }
    }

    /// Request bulk confirmation for every unread message in a
    /// conversation (fired on open).
    pub fn mark_chat_read(&self, chat_id: &str) -> ClientEvent {
        ClientEvent::MarkChatRead {
            chat_id: chat_id.to_string(),
            user_id: self.user_id.clone(),
        }
    }

    /// Apply a confirmed single-message receipt: union the updated
    /// message's reader set into the local copy.
    pub fn apply_message_read<A: ChatApi>(
        &self,
        channel: &mut MessageChannel<A>,
        updated: &Message,
    ) -> bool {
        let changed = channel.apply_read_union(updated);
        if changed {
            debug!(id = %updated.id, "receipt applied");
        }
        changed
    }

    /// Apply a confirmed bulk receipt. When the reader is the session
    /// user this also re-asserts the directory's unread reset, closing
    /// the loop opened by the optimistic `clear_unread` on open.
    pub fn apply_chat_read<A: ChatApi>(
        &self,
        channel: &mut MessageChannel<A>,
        directory: &mut ConversationDirectory<A>,
        chat_id: &str,
        reader_id: &str,
    ) -> ChatReadOutcome {
        let messages_changed = channel.apply_chat_read(chat_id, reader_id);

        let unread_reconciled = if reader_id == self.user_id {
            directory.clear_unread(chat_id);
            true
        } else {
            false
        };

        debug!(
            chat_id,
            reader_id, messages_changed, unread_reconciled, "bulk receipt applied"
        );
        ChatReadOutcome {
            messages_changed,
            unread_reconciled,
        }
    }
}
