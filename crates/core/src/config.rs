use std::time::Duration;

use serde::Deserialize;

/// Tunable behavior of the sync engine. Every field has a default, so an
/// embedding application can deserialize a partial table or just use
/// `SyncConfig::default()`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default)]
    pub typing: TypingConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub event_bus: EventBusConfig,
}

/// Timing for typing indicators.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingConfig {
    /// Idle period after the last keystroke before a stop signal is
    /// emitted on the local side.
    #[serde(default = "default_typing_idle_ms")]
    pub idle_timeout_ms: u64,

    /// Hard ceiling after which a remote typing indicator is dropped
    /// even if the stop event was lost.
    #[serde(default = "default_typing_ceiling_ms")]
    pub stale_ceiling_ms: u64,
}

impl TypingConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn stale_ceiling(&self) -> Duration {
        Duration::from_millis(self.stale_ceiling_ms)
    }
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_typing_idle_ms(),
            stale_ceiling_ms: default_typing_ceiling_ms(),
        }
    }
}

/// Backoff policy for re-establishing the push channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    #[serde(default = "default_reconnect_initial_secs")]
    pub initial_delay_secs: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub max_delay_secs: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    /// The delay before reconnect attempt `attempt` (1-based): doubles
    /// from the initial delay, capped at the maximum.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let secs = self
            .initial_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_reconnect_initial_secs(),
            max_delay_secs: default_reconnect_max_secs(),
            max_attempts: default_reconnect_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBusConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_typing_idle_ms() -> u64 {
    1_500
}

fn default_typing_ceiling_ms() -> u64 {
    5_000
}

fn default_reconnect_initial_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    60
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_channel_capacity() -> usize {
    1024
}
