use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use towline_core::model::{Conversation, Message};

/// `NetworkError` class: the pull API was unreachable, answered with a
/// non-2xx status, or returned a body this client cannot decode. All of
/// these are retryable by the caller; this crate never retries.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server returned status {status} for {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("invalid response body from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

/// Request/response access to conversation and message state. The server
/// is the source of truth; push events only patch what a pull of these
/// endpoints would return.
pub trait ChatApi: Send + Sync + 'static {
    fn fetch_conversations(
        &self,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Conversation>, ApiError>> + Send;

    fn fetch_messages(
        &self,
        chat_id: &str,
    ) -> impl Future<Output = Result<Vec<Message>, ApiError>> + Send;

    /// Idempotent: an existing conversation for the pair is returned
    /// instead of a new one.
    fn find_or_create_conversation(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> impl Future<Output = Result<Conversation, ApiError>> + Send;

    /// Persist a message; the response is the server-confirmed message
    /// with its final id.
    fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
    ) -> impl Future<Output = Result<Message, ApiError>> + Send;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfig {
    pub base_url: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationBody<'a> {
    user_id: &'a str,
    peer_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody<'a> {
    sender_id: &'a str,
    content: &'a str,
}

/// REST implementation of [`ChatApi`].
#[derive(Debug, Clone)]
pub struct RestChatApi {
    http: reqwest::Client,
    base_url: String,
}

impl RestChatApi {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let endpoint = self.endpoint(path);
        let response = self.http.get(&endpoint).send().await?;
        Self::decode(endpoint, response).await
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let endpoint = self.endpoint(path);
        let response = self.http.post(&endpoint).json(body).send().await?;
        Self::decode(endpoint, response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        endpoint: String,
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }
        response.json().await.map_err(|error| ApiError::Decode {
            endpoint,
            message: error.to_string(),
        })
    }
}

impl ChatApi for RestChatApi {
    async fn fetch_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, ApiError> {
        debug!(user_id, "fetching conversations");
        self.get_json(&format!("/api/users/{user_id}/conversations"))
            .await
    }

    async fn fetch_messages(&self, chat_id: &str) -> Result<Vec<Message>, ApiError> {
        debug!(chat_id, "fetching message history");
        self.get_json(&format!("/api/conversations/{chat_id}/messages"))
            .await
    }

    async fn find_or_create_conversation(
        &self,
        user_id: &str,
        peer_id: &str,
    ) -> Result<Conversation, ApiError> {
        debug!(user_id, peer_id, "finding or creating conversation");
        self.post_json(
            "/api/conversations",
            &CreateConversationBody { user_id, peer_id },
        )
        .await
    }

    async fn send_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, ApiError> {
        debug!(chat_id, sender_id, "persisting message");
        self.post_json(
            &format!("/api/conversations/{chat_id}/messages"),
            &SendMessageBody { sender_id, content },
        )
        .await
    }
}
