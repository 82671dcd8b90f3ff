//! Test doubles for the pull API and the push transport, plus sample
//! data builders shared across crate tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use towline_api::{ApiError, ChatApi};
use towline_core::model::{Conversation, Message, Participant};
use towline_transport::{ClientEvent, PushTransport, ServerEvent, TransportError};

pub mod sample {
    use chrono::{DateTime, TimeZone, Utc};

    use towline_core::model::{Conversation, Message, Participant};

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    pub fn avery() -> Participant {
        Participant::new("u1", "Avery")
    }

    pub fn blake() -> Participant {
        Participant::new("u2", "Blake")
    }

    pub fn carla() -> Participant {
        Participant::new("u3", "Carla")
    }

    pub fn conversation_between(
        id: &str,
        a: &Participant,
        b: &Participant,
        updated_secs: i64,
    ) -> Conversation {
        Conversation {
            id: id.to_string(),
            participants: vec![a.clone(), b.clone()],
            last_message_preview: String::new(),
            updated_at: at(updated_secs),
            unread_count: 0,
            is_online: false,
        }
    }

    pub fn message(id: &str, chat_id: &str, sender: &Participant, secs: i64) -> Message {
        message_with(id, chat_id, sender, &format!("body of {id}"), secs)
    }

    pub fn message_with(
        id: &str,
        chat_id: &str,
        sender: &Participant,
        content: &str,
        secs: i64,
    ) -> Message {
        Message::new(id, chat_id, sender.clone(), content, at(secs))
    }
}

/// In-memory [`ChatApi`] with programmable responses and a call log.
#[derive(Default)]
pub struct FakeChatApi {
    conversations: Mutex<Vec<Conversation>>,
    histories: Mutex<HashMap<String, Vec<Message>>>,
    send_results: Mutex<VecDeque<Result<Message, ApiError>>>,
    fail_pulls: Mutex<bool>,
    calls: Mutex<Vec<String>>,
}

impl FakeChatApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        *self.conversations.lock().unwrap() = conversations;
    }

    pub fn set_history(&self, chat_id: &str, history: Vec<Message>) {
        self.histories
            .lock()
            .unwrap()
            .insert(chat_id.to_string(), history);
    }

    pub fn push_history(&self, chat_id: &str, message: Message) {
        self.histories
            .lock()
            .unwrap()
            .entry(chat_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn queue_send_result(&self, result: Result<Message, ApiError>) {
        self.send_results.lock().unwrap().push_back(result);
    }

    /// Make every pull endpoint fail until reset.
    pub fn set_fail_pulls(&self, fail: bool) {
        *self.fail_pulls.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn pull_gate(&self) -> Result<(), ApiError> {
        if *self.fail_pulls.lock().unwrap() {
            Err(ApiError::Status {
                endpoint: "/api".into(),
                status: 503,
            })
        } else {
            Ok(())
        }
    }
}

impl ChatApi for FakeChatApi {
    async fn fetch_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, ApiError> {
        self.record(format!("fetch_conversations({user_id})"));
        self.pull_gate()?;
        Ok(self.conversations.lock().unwrap().clone())
    }

    async fn fetch_messages(&self, chat_id: &str) -> Result<Vec<Message>, ApiError> {
        self.record(format!("fetch_messages({chat_id})"));
        self.pull_gate()?;
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(chat_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn find_or_create_conversation(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> Result<Conversation, ApiError> {
        self.record(format!("find_or_create_conversation({user_id}, {peer_id})"));
        self.pull_gate()?;

        let existing = self
            .conversations
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.has_participant(user_id) && c.has_participant(peer_id))
            .cloned();
        if let Some(conversation) = existing {
            return Ok(conversation);
        }

        let conversation = Conversation {
            id: format!("dm-{user_id}-{peer_id}"),
            participants: vec![
                Participant::new(user_id, user_id.to_uppercase()),
                Participant::new(peer_id, peer_id.to_uppercase()),
            ],
            last_message_preview: String::new(),
            updated_at: sample::at(0),
            unread_count: 0,
            is_online: false,
        };
        self.conversations
            .lock()
            .unwrap()
            .push(conversation.clone());
        Ok(conversation)
    }

    async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        _content: &str,
    ) -> Result<Message, ApiError> {
        self.record(format!("send_message({chat_id}, {sender_id})"));
        self.send_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(ApiError::Status {
                endpoint: "/api".into(),
                status: 502,
            }))
    }
}

/// One scripted turn of the fake push channel.
#[derive(Debug)]
pub enum TransportTurn {
    Event(ServerEvent),
    /// `recv` resolves to `TransportError::Disconnected(reason)`.
    Drop(String),
}

/// Scripted [`PushTransport`]. Events are pushed through the paired
/// [`FakeTransportHandle`]; everything the engine emits is recorded.
pub struct FakePushTransport {
    rx: mpsc::UnboundedReceiver<TransportTurn>,
    emitted: Arc<Mutex<Vec<ClientEvent>>>,
    connect_results: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    connects: Arc<Mutex<u32>>,
}

#[derive(Clone)]
pub struct FakeTransportHandle {
    tx: mpsc::UnboundedSender<TransportTurn>,
    emitted: Arc<Mutex<Vec<ClientEvent>>>,
    connect_results: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    connects: Arc<Mutex<u32>>,
}

pub fn fake_transport() -> (FakePushTransport, FakeTransportHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let emitted = Arc::new(Mutex::new(Vec::new()));
    let connect_results = Arc::new(Mutex::new(VecDeque::new()));
    let connects = Arc::new(Mutex::new(0));
    (
        FakePushTransport {
            rx,
            emitted: emitted.clone(),
            connect_results: connect_results.clone(),
            connects: connects.clone(),
        },
        FakeTransportHandle {
            tx,
            emitted,
            connect_results,
            connects,
        },
    )
}

impl FakeTransportHandle {
    pub fn push_event(&self, event: ServerEvent) {
        self.tx
            .send(TransportTurn::Event(event))
            .expect("transport receiver dropped");
    }

    pub fn drop_connection(&self, reason: &str) {
        self.tx
            .send(TransportTurn::Drop(reason.to_string()))
            .expect("transport receiver dropped");
    }

    pub fn fail_next_connect(&self, reason: &str) {
        self.connect_results
            .lock()
            .unwrap()
            .push_back(Err(TransportError::ConnectFailed(reason.to_string())));
    }

    pub fn emitted(&self) -> Vec<ClientEvent> {
        self.emitted.lock().unwrap().clone()
    }

    pub fn clear_emitted(&self) {
        self.emitted.lock().unwrap().clear();
    }

    /// How many times the engine (re)connected.
    pub fn connect_count(&self) -> u32 {
        *self.connects.lock().unwrap()
    }
}

impl PushTransport for FakePushTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        *self.connects.lock().unwrap() += 1;
        self.connect_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn emit(&mut self, event: ClientEvent) -> Result<(), TransportError> {
        self.emitted.lock().unwrap().push(event);
        Ok(())
    }

    async fn recv(&mut self) -> Result<ServerEvent, TransportError> {
        match self.rx.recv().await {
            Some(TransportTurn::Event(event)) => Ok(event),
            Some(TransportTurn::Drop(reason)) => Err(TransportError::Disconnected(reason)),
            None => Err(TransportError::Disconnected(
                "transport handle dropped".to_string(),
            )),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}
