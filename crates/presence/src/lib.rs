use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use towline_core::config::TypingConfig;

/// A deadline that fired in [`TypingTracker::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypingExpiry {
    /// The local idle period elapsed; a stop signal must be emitted.
    LocalIdle { chat_id: String },
    /// A remote indicator passed the hard ceiling without a stop event
    /// and was cleared.
    RemoteStale { chat_id: String, user_id: String },
}

#[derive(Debug, Clone)]
struct RemoteTyping {
    user_id: String,
    expires_at: Instant,
}

/// Ephemeral who-is-typing state, local and remote, with timer-driven
/// expiry. Nothing in here is persisted or part of any durable entity.
///
/// The local side keeps one deadline per chat, re-armed on every
/// keystroke; the start signal is emitted once per idle period. The
/// remote side expires entries at a hard ceiling so a lost stop event
/// cannot leave a permanently stuck indicator.
pub struct TypingTracker {
    idle_timeout: Duration,
    stale_ceiling: Duration,
    local: HashMap<String, Instant>,
    remote: HashMap<String, RemoteTyping>,
}

impl TypingTracker {
    pub fn new(config: &TypingConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            stale_ceiling: config.stale_ceiling(),
            local: HashMap::new(),
            remote: HashMap::new(),
        }
    }

    /// Register a keystroke in `chat_id`. Returns true when a start
    /// signal should be emitted (first keystroke of an idle period);
    /// subsequent keystrokes only re-arm the stop deadline.
    pub fn on_local_keystroke(&mut self, chat_id: &str, now: Instant) -> bool {
        let deadline = now + self.idle_timeout;
        let started = self.local.insert(chat_id.to_string(), deadline).is_none();
        if started {
            debug!(chat_id, "local typing started");
        }
        started
    }

    /// Explicit stop (message sent, conversation closed). Returns true
    /// when a stop signal should be emitted.
    pub fn stop_local(&mut self, chat_id: &str) -> bool {
        self.local.remove(chat_id).is_some()
    }

    pub fn is_local_typing(&self, chat_id: &str) -> bool {
        self.local.contains_key(chat_id)
    }

    /// A remote participant signalled typing. Re-signalling extends the
    /// ceiling.
    pub fn on_remote_typing(&mut self, chat_id: &str, user_id: &str, now: Instant) {
        self.remote.insert(
            chat_id.to_string(),
            RemoteTyping {
                user_id: user_id.to_string(),
                expires_at: now + self.stale_ceiling,
            },
        );
    }

    /// Returns true when the indicator was actually cleared.
    pub fn on_remote_stop(&mut self, chat_id: &str, user_id: &str) -> bool {
        match self.remote.get(chat_id) {
            Some(entry) if entry.user_id == user_id => {
                self.remote.remove(chat_id);
                true
            }
            _ => false,
        }
    }

    /// Who is currently typing in `chat_id`, if anyone.
    pub fn typist(&self, chat_id: &str) -> Option<&str> {
        self.remote.get(chat_id).map(|e| e.user_id.as_str())
    }

    /// The earliest pending deadline, local or remote. Drives the
    /// coordinator's timer arm.
    pub fn next_deadline(&self) -> Option<Instant> {
        let local = self.local.values().min().copied();
        let remote = self.remote.values().map(|e| e.expires_at).min();
        match (local, remote) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Fire every deadline at or before `now` and clear the expired
    /// entries.
    pub fn poll(&mut self, now: Instant) -> Vec<TypingExpiry> {
        let mut fired = Vec::new();

        let idle: Vec<String> = self
            .local
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(chat_id, _)| chat_id.clone())
            .collect();
        for chat_id in idle {
            self.local.remove(&chat_id);
            debug!(chat_id = %chat_id, "local typing idle");
            fired.push(TypingExpiry::LocalIdle { chat_id });
        }

        let stale: Vec<String> = self
            .remote
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(chat_id, _)| chat_id.clone())
            .collect();
        for chat_id in stale {
            if let Some(entry) = self.remote.remove(&chat_id) {
                debug!(chat_id = %chat_id, user_id = %entry.user_id, "remote typing went stale");
                fired.push(TypingExpiry::RemoteStale {
                    chat_id,
                    user_id: entry.user_id,
                });
            }
        }

        fired
    }
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(&TypingConfig::default())
    }
}
