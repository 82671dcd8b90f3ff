use std::sync::Arc;

use tracing::{debug, warn};

use towline_api::{ApiError, ChatApi};
use towline_core::model::{Conversation, Message};

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("failed to load conversations: {0}")]
    Load(#[from] ApiError),
}

/// Result of feeding an accepted message into the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryUpdate {
    Applied { unread_incremented: bool },
    /// No loaded conversation owns the message; the caller repairs by
    /// re-pulling the list.
    UnknownConversation,
}

/// The list of conversations for the session user, ordered by
/// `updated_at` descending (ties by id). Refreshed via pull, patched by
/// push events. On a failed refresh the previous contents stay in place
/// so the UI can keep rendering stale state.
pub struct ConversationDirectory<A> {
    api: Arc<A>,
    conversations: Vec<Conversation>,
}

impl<A: ChatApi> ConversationDirectory<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self {
            api,
            conversations: Vec::new(),
        }
    }

    /// Pull the full list for `user_id` and replace local state.
    pub async fn load_all(&mut self, user_id: &str) -> Result<(), DirectoryError> {
        let mut conversations = self.api.fetch_conversations(user_id).await?;
        conversations.sort_by(Conversation::list_order);
        debug!(count = conversations.len(), "conversation list loaded");
        self.conversations = conversations;
        Ok(())
    }

    /// Apply the list-visible effects of an accepted message: preview and
    /// timestamp update, unread increment when the conversation is not
    /// active and the message is not the session user's own, and a resort
    /// that floats the touched conversation to the top.
    pub fn apply_incoming(
        &mut self,
        message: &Message,
        active_chat: Option<&str>,
        self_id: &str,
    ) -> DirectoryUpdate {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| c.id == message.chat_id)
        else {
            warn!(chat_id = %message.chat_id, "message for unknown conversation");
            return DirectoryUpdate::UnknownConversation;
        };

        conversation.touch(&message.content, message.created_at);

        let is_active = active_chat == Some(message.chat_id.as_str());
        let unread_incremented = !is_active && !message.is_from(self_id);
        if unread_incremented {
            conversation.unread_count += 1;
        }

        self.conversations.sort_by(Conversation::list_order);
        DirectoryUpdate::Applied { unread_incremented }
    }

    /// Optimistic local reset when a conversation becomes active. The
    /// server-confirmed receipt event reconciles it later.
    pub fn clear_unread(&mut self, chat_id: &str) -> bool {
        match self.conversations.iter_mut().find(|c| c.id == chat_id) {
            Some(conversation) if conversation.unread_count > 0 => {
                conversation.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    /// Patch the ephemeral online flag for every conversation `user_id`
    /// participates in.
    pub fn set_online(&mut self, user_id: &str, online: bool) -> usize {
        let mut changed = 0;
        for conversation in &mut self.conversations {
            if conversation.has_participant(user_id) && conversation.is_online != online {
                conversation.is_online = online;
                changed += 1;
            }
        }
        changed
    }

    /// Insert or replace a conversation (find-or-create flow, single
    /// conversation repair).
    pub fn upsert(&mut self, conversation: Conversation) {
        match self
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation.id)
        {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        self.conversations.sort_by(Conversation::list_order);
    }

    pub fn get(&self, chat_id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == chat_id)
    }

    /// Conversations in list order, newest activity first.
    pub fn ordered(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn len(&self) -> usize {
        self.conversations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conversations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use chrono::{DateTime, TimeZone, Utc};
    use towline_core::model::Participant;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn conversation(id: &str, updated_secs: i64, unread: u32) -> Conversation {
        Conversation {
            id: id.to_string(),
            participants: vec![
                Participant::new("u1", "Avery"),
                Participant::new("u2", "Blake"),
            ],
            last_message_preview: String::new(),
            updated_at: at(updated_secs),
            unread_count: unread,
            is_online: false,
        }
    }

    fn message(id: &str, chat_id: &str, sender: &str, secs: i64) -> Message {
        Message::new(
            id,
            chat_id,
            Participant::new(sender, sender.to_uppercase()),
            "a message",
            at(secs),
        )
    }

    struct StubApi {
        conversations: Vec<Conversation>,
        fail: bool,
    }

    impl StubApi {
        fn with(conversations: Vec<Conversation>) -> Self {
            Self {
                conversations,
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                conversations: Vec::new(),
                fail: true,
            }
        }

        fn result<T>(&self, value: T) -> Result<T, ApiError> {
            if self.fail {
                Err(ApiError::Status {
                    endpoint: "/api".into(),
                    status: 503,
                })
            } else {
                Ok(value)
            }
        }
    }

    impl ChatApi for StubApi {
        async fn fetch_conversations(&self, _user_id: &str) -> Result<Vec<Conversation>, ApiError> {
            self.result(self.conversations.clone())
        }

        async fn fetch_messages(&self, _chat_id: &str) -> Result<Vec<Message>, ApiError> {
            self.result(Vec::new())
        }

        async fn find_or_create_conversation(
            &self,
            _user_id: &str,
            _peer_id: &str,
        ) -> Result<Conversation, ApiError> {
            unimplemented!("not used by directory tests")
        }

        async fn send_message(
            &self,
            _chat_id: &str,
            _sender_id: &str,
            _content: &str,
        ) -> Result<Message, ApiError> {
            unimplemented!("not used by directory tests")
        }
    }

    fn directory_with(conversations: Vec<Conversation>) -> ConversationDirectory<StubApi> {
        ConversationDirectory::new(Arc::new(StubApi::with(conversations)))
    }

    #[tokio::test]
    async fn load_all_orders_newest_first() {
        let mut directory = directory_with(vec![
            conversation("c1", 10, 0),
            conversation("c2", 30, 0),
            conversation("c3", 20, 0),
        ]);
        directory.load_all("u1").await.unwrap();

        let ids: Vec<&str> = directory.ordered().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c2", "c3", "c1"]);
    }

    #[tokio::test]
    async fn load_all_ties_are_stable_by_id() {
        let mut directory = directory_with(vec![
            conversation("c-b", 10, 0),
            conversation("c-a", 10, 0),
        ]);
        directory.load_all("u1").await.unwrap();

        let ids: Vec<&str> = directory.ordered().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["c-a", "c-b"]);
    }

    #[tokio::test]
    async fn load_failure_keeps_stale_list() {
        let mut directory = directory_with(vec![conversation("c1", 10, 0)]);
        directory.load_all("u1").await.unwrap();

        directory.api = Arc::new(StubApi::failing());
        let error = directory.load_all("u1").await.unwrap_err();
        assert_matches!(error, DirectoryError::Load(ApiError::Status { .. }));
        assert_eq!(directory.len(), 1, "stale contents survive a failed pull");
    }

    #[tokio::test]
    async fn incoming_message_floats_conversation_to_top() {
        let mut directory = directory_with(vec![
            conversation("c1", 10, 0),
            conversation("c2", 20, 0),
        ]);
        directory.load_all("u1").await.unwrap();
        assert_eq!(directory.ordered()[0].id, "c2");

        let update = directory.apply_incoming(&message("m-1", "c1", "u2", 30), None, "u1");

        assert_matches!(
            update,
            DirectoryUpdate::Applied {
                unread_incremented: true
            }
        );
        let top = &directory.ordered()[0];
        assert_eq!(top.id, "c1");
        assert_eq!(top.updated_at, at(30));
        assert_eq!(top.last_message_preview, "a message");
        assert_eq!(top.unread_count, 1);
    }

    #[tokio::test]
    async fn active_conversation_does_not_accumulate_unread() {
        let mut directory = directory_with(vec![conversation("c1", 10, 0)]);
        directory.load_all("u1").await.unwrap();

        let update = directory.apply_incoming(&message("m-1", "c1", "u2", 30), Some("c1"), "u1");

        assert_matches!(
            update,
            DirectoryUpdate::Applied {
                unread_incremented: false
            }
        );
        assert_eq!(directory.get("c1").unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn own_message_does_not_accumulate_unread() {
        let mut directory = directory_with(vec![conversation("c1", 10, 0)]);
        directory.load_all("u1").await.unwrap();

        // Broadcast echo of our own send after navigating away.
        let update = directory.apply_incoming(&message("m-1", "c1", "u1", 30), None, "u1");

        assert_matches!(
            update,
            DirectoryUpdate::Applied {
                unread_incremented: false
            }
        );
        assert_eq!(directory.get("c1").unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn unknown_conversation_is_reported() {
        let mut directory = directory_with(vec![conversation("c1", 10, 0)]);
        directory.load_all("u1").await.unwrap();

        let update = directory.apply_incoming(&message("m-1", "c-new", "u3", 30), None, "u1");
        assert_eq!(update, DirectoryUpdate::UnknownConversation);
    }

    #[tokio::test]
    async fn clear_unread_resets_count_once() {
        let mut directory = directory_with(vec![conversation("c1", 10, 3)]);
        directory.load_all("u1").await.unwrap();

        assert!(directory.clear_unread("c1"));
        assert_eq!(directory.get("c1").unwrap().unread_count, 0);
        assert!(!directory.clear_unread("c1"));
        assert!(!directory.clear_unread("c-missing"));
    }

    #[tokio::test]
    async fn set_online_patches_matching_conversations() {
        let mut directory = directory_with(vec![
            conversation("c1", 10, 0),
            conversation("c2", 20, 0),
        ]);
        directory.load_all("u1").await.unwrap();

        assert_eq!(directory.set_online("u2", true), 2);
        assert!(directory.get("c1").unwrap().is_online);
        assert_eq!(directory.set_online("u2", true), 0, "already online");
        assert_eq!(directory.set_online("u9", true), 0, "unknown participant");
    }

    #[tokio::test]
    async fn upsert_inserts_then_replaces() {
        let mut directory = directory_with(Vec::new());
        directory.load_all("u1").await.unwrap();

        directory.upsert(conversation("c1", 10, 0));
        assert_eq!(directory.len(), 1);

        let mut updated = conversation("c1", 40, 1);
        updated.last_message_preview = "newer".into();
        directory.upsert(updated);

        assert_eq!(directory.len(), 1);
        assert_eq!(directory.get("c1").unwrap().last_message_preview, "newer");
    }
}
