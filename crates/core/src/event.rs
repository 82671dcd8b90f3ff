use chrono::{DateTime, Utc};
use futures::future::select_all;
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::EventBusError;
use crate::model::Message;

/// Hierarchical channel name, e.g. `push.message.received`.
///
/// The first segment is the domain and decides which broadcast channel
/// carries the event.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel(String);

pub const DOMAINS: [&str; 3] = ["system", "push", "ui"];

impl Channel {
    pub fn new(name: impl Into<String>) -> Result<Self, EventBusError> {
        let name = name.into();
        if Self::is_valid(&name) {
            Ok(Self(name))
        } else {
            Err(EventBusError::InvalidChannel(name))
        }
    }

    /// Lowercase dotted segments, no empty segments, known domain first.
    pub fn is_valid(name: &str) -> bool {
        if name.is_empty() || name.starts_with('.') || name.ends_with('.') || name.contains("..") {
            return false;
        }
        if name
            .chars()
            .any(|c| !matches!(c, 'a'..='z' | '0'..='9' | '.'))
        {
            return false;
        }
        match name.split('.').next() {
            Some(first) => DOMAINS.contains(&first),
            None => false,
        }
    }

    pub fn domain(&self) -> &str {
        self.0.split('.').next().unwrap_or("")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Envelope wrapping every notification published by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub id: Uuid,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(channel: Channel, source: EventSource, payload: EventPayload) -> Self {
        Self {
            channel,
            timestamp: Utc::now(),
            id: Uuid::new_v4(),
            source,
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum EventSource {
    /// A named core component (coordinator, directory, ...).
    System(String),
    /// Derived from a push-transport event.
    Push,
    /// User interface layer.
    Ui,
}

/// Everything the UI layer can observe from this core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum EventPayload {
    // ── Connection lifecycle ──────────────────────────────────────
    ConnectionEstablished,
    ConnectionLost {
        reason: String,
        will_retry: bool,
    },
    ConnectionReconnecting {
        attempt: u32,
    },
    SyncStarted,
    SyncCompleted {
        conversations: usize,
        messages: usize,
    },
    ErrorOccurred {
        component: String,
        message: String,
        recoverable: bool,
    },

    // ── Push-derived updates ──────────────────────────────────────
    MessageReceived {
        message: Message,
    },
    TypingStarted {
        chat_id: String,
        user_id: String,
    },
    TypingStopped {
        chat_id: String,
        user_id: String,
    },
    MessageRead {
        chat_id: String,
        message_id: String,
    },
    ChatRead {
        chat_id: String,
        user_id: String,
    },
    PresenceChanged {
        user_id: String,
        online: bool,
    },

    // ── Store / view updates ──────────────────────────────────────
    ConversationListChanged,
    ConversationOpened {
        chat_id: String,
    },
    ConversationClosed {
        chat_id: String,
    },
    MessagePending {
        message: Message,
    },
    MessageConfirmed {
        provisional_id: String,
        message: Message,
    },
    MessageFailed {
        provisional_id: String,
        reason: String,
    },
    UnreadCleared {
        chat_id: String,
    },
}

pub trait EventBus: Send + Sync + 'static {
    fn publish(&self, event: Event) -> Result<(), EventBusError>;
    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError>;
}

/// Broadcast-backed bus with one channel per domain. Subscribers pick a
/// glob pattern; the first pattern segment selects the domains tapped.
#[derive(Clone)]
pub struct BroadcastEventBus {
    system: broadcast::Sender<Event>,
    push: broadcast::Sender<Event>,
    ui: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (system, _) = broadcast::channel(capacity);
        let (push, _) = broadcast::channel(capacity);
        let (ui, _) = broadcast::channel(capacity);
        Self { system, push, ui }
    }

    fn sender(&self, domain: &str) -> Option<&broadcast::Sender<Event>> {
        match domain {
            "system" => Some(&self.system),
            "push" => Some(&self.push),
            "ui" => Some(&self.ui),
            _ => None,
        }
    }

    fn taps(&self, pattern: &str) -> Result<Vec<broadcast::Receiver<Event>>, EventBusError> {
        let first = pattern.split('.').next().unwrap_or_default();
        if first.is_empty() {
            return Err(EventBusError::InvalidPattern(pattern.to_string()));
        }

        if has_glob_meta(first) {
            return Ok(vec![
                self.system.subscribe(),
                self.push.subscribe(),
                self.ui.subscribe(),
            ]);
        }

        match self.sender(first) {
            Some(sender) => Ok(vec![sender.subscribe()]),
            None => Err(EventBusError::InvalidPattern(pattern.to_string())),
        }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CHANNEL_CAPACITY)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) -> Result<(), EventBusError> {
        let sender = self
            .sender(event.channel.domain())
            .ok_or_else(|| EventBusError::InvalidChannel(event.channel.to_string()))?;
        // No receivers is fine; the UI may not be attached yet.
        let _ = sender.send(event);
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<EventSubscription, EventBusError> {
        let matcher = Glob::new(pattern)
            .map_err(|_| EventBusError::InvalidPattern(pattern.to_string()))?
            .compile_matcher();
        let taps = self.taps(pattern)?;
        Ok(EventSubscription { matcher, taps })
    }
}

pub struct EventSubscription {
    matcher: GlobMatcher,
    taps: Vec<broadcast::Receiver<Event>>,
}

impl EventSubscription {
    /// Receive the next event matching the subscription pattern.
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        loop {
            // `taps` is non-empty by construction.
            let (next, _, _) =
                select_all(self.taps.iter_mut().map(|tap| Box::pin(tap.recv()))).await;
            match next {
                Ok(event) if self.matcher.is_match(event.channel.as_str()) => return Ok(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(EventBusError::ChannelClosed);
                }
                Err(broadcast::error::RecvError::Lagged(count)) => {
                    return Err(EventBusError::Lagged(count));
                }
            }
        }
    }
}

fn has_glob_meta(segment: &str) -> bool {
    segment
        .chars()
        .any(|c| matches!(c, '*' | '?' | '[' | ']' | '{' | '}' | '!'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_validation() {
        assert!(Channel::is_valid("system.connection.established"));
        assert!(Channel::is_valid("push.message.received"));
        assert!(Channel::is_valid("ui.conversation.opened"));

        assert!(!Channel::is_valid("xmpp.message.received"));
        assert!(!Channel::is_valid("system..double.dot"));
        assert!(!Channel::is_valid(".leading.dot"));
        assert!(!Channel::is_valid("trailing.dot."));
        assert!(!Channel::is_valid("UpperCase"));
        assert!(!Channel::is_valid("with-hyphen"));
        assert!(!Channel::is_valid(""));
    }

    #[test]
    fn channel_new_rejects_unknown_domain() {
        let result = Channel::new("roster.updated");
        assert!(matches!(result, Err(EventBusError::InvalidChannel(_))));
    }

    #[test]
    fn channel_domain() {
        let channel = Channel::new("push.typing.started").unwrap();
        assert_eq!(channel.domain(), "push");
        assert_eq!(channel.as_str(), "push.typing.started");
    }

    fn make_event(channel: &str, payload: EventPayload) -> Event {
        Event::new(
            Channel::new(channel).unwrap(),
            EventSource::System("test".into()),
            payload,
        )
    }

    #[tokio::test]
    async fn publish_routes_to_domain_subscriber() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("system.**").unwrap();

        bus.publish(make_event(
            "system.connection.established",
            EventPayload::ConnectionEstablished,
        ))
        .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "system.connection.established");
    }

    #[tokio::test]
    async fn domain_subscriber_does_not_see_other_domains() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("ui.**").unwrap();

        bus.publish(make_event(
            "system.sync.started",
            EventPayload::SyncStarted,
        ))
        .unwrap();
        bus.publish(make_event(
            "ui.conversation.opened",
            EventPayload::ConversationOpened {
                chat_id: "c1".into(),
            },
        ))
        .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "ui.conversation.opened");
    }

    #[tokio::test]
    async fn glob_pattern_taps_all_domains() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("**").unwrap();

        bus.publish(make_event(
            "push.presence.changed",
            EventPayload::PresenceChanged {
                user_id: "u2".into(),
                online: true,
            },
        ))
        .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.domain(), "push");
    }

    #[tokio::test]
    async fn narrow_pattern_filters_within_domain() {
        let bus = BroadcastEventBus::default();
        let mut sub = bus.subscribe("ui.message.*").unwrap();

        bus.publish(make_event(
            "ui.unread.cleared",
            EventPayload::UnreadCleared {
                chat_id: "c1".into(),
            },
        ))
        .unwrap();
        bus.publish(make_event(
            "ui.message.failed",
            EventPayload::MessageFailed {
                provisional_id: "tmp-1".into(),
                reason: "offline".into(),
            },
        ))
        .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_millis(100), sub.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(event.channel.as_str(), "ui.message.failed");
    }

    #[test]
    fn subscribe_rejects_unknown_domain_pattern() {
        let bus = BroadcastEventBus::default();
        assert!(matches!(
            bus.subscribe("xmpp.**"),
            Err(EventBusError::InvalidPattern(_))
        ));
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = BroadcastEventBus::default();
        bus.publish(make_event("system.sync.started", EventPayload::SyncStarted))
            .unwrap();
    }
}
