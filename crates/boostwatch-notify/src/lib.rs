//! Chat delivery capability and its Telegram Bot API implementation.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "boostwatch-notify";

/// Destination for a message: a chat and, optionally, a forum topic thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatTarget {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The target message no longer exists; callers recreate it.
    #[error("message to edit not found")]
    NotFound,
    /// Edit with byte-identical content; callers treat this as success.
    #[error("message is not modified")]
    NotModified,
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("chat api error: {0}")]
    Api(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Sends a new message and returns its id.
    async fn send(&self, target: ChatTarget, text: &str) -> Result<i64, DeliveryError>;

    /// Edits an existing message in place.
    async fn edit(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), DeliveryError>;

    /// Pins a message. Callers tolerate failure here (missing rights).
    async fn pin(&self, chat_id: i64, message_id: i64) -> Result<(), DeliveryError>;
}

/// Maps a Bot API error description onto the two sub-kinds the reconciler
/// distinguishes; everything else stays an opaque api error.
pub fn classify_api_description(description: &str) -> DeliveryError {
    let lower = description.to_ascii_lowercase();
    if lower.contains("message to edit not found") || lower.contains("message_id_invalid") {
        DeliveryError::NotFound
    } else if lower.contains("message is not modified") {
        DeliveryError::NotModified
    } else {
        DeliveryError::Api(description.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
    result: Option<Value>,
}

/// Telegram Bot API client speaking HTML-formatted messages.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str) -> Self {
        Self::with_api_base(&format!("https://api.telegram.org/bot{bot_token}"))
    }

    pub fn with_api_base(api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    async fn call(&self, method: &str, payload: Value) -> Result<Value, DeliveryError> {
        let url = format!("{}/{}", self.api_base, method);
        let response = self.client.post(&url).json(&payload).send().await?;
        let body: ApiResponse = response.json().await?;
        if body.ok {
            debug!(method, "chat api call succeeded");
            Ok(body.result.unwrap_or(Value::Null))
        } else {
            Err(classify_api_description(
                body.description.as_deref().unwrap_or("unknown error"),
            ))
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send(&self, target: ChatTarget, text: &str) -> Result<i64, DeliveryError> {
        let mut payload = json!({
            "chat_id": target.chat_id,
            "text": text,
            "parse_mode": "HTML",
            "disable_web_page_preview": true,
        });
        if let Some(thread_id) = target.thread_id {
            payload["message_thread_id"] = json!(thread_id);
        }
        let result = self.call("sendMessage", payload).await?;
        result
            .get("message_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| DeliveryError::Api("sendMessage result without message_id".into()))
    }

    async fn edit(&self, chat_id: i64, message_id: i64, text: &str) -> Result<(), DeliveryError> {
        self.call(
            "editMessageText",
            json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": true,
            }),
        )
        .await?;
        Ok(())
    }

    async fn pin(&self, chat_id: i64, message_id: i64) -> Result<(), DeliveryError> {
        self.call(
            "pinChatMessage",
            json!({
                "chat_id": chat_id,
                "message_id": message_id,
                "disable_notification": true,
            }),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleted_message_maps_to_not_found() {
        assert!(matches!(
            classify_api_description("Bad Request: message to edit not found"),
            DeliveryError::NotFound
        ));
        assert!(matches!(
            classify_api_description("MESSAGE_ID_INVALID"),
            DeliveryError::NotFound
        ));
    }

    #[test]
    fn identical_content_maps_to_not_modified() {
        assert!(matches!(
            classify_api_description(
                "Bad Request: message is not modified: specified new message content and \
                 reply markup are exactly the same"
            ),
            DeliveryError::NotModified
        ));
    }

    #[test]
    fn other_descriptions_stay_opaque() {
        let err = classify_api_description("Forbidden: bot was kicked from the group chat");
        match err {
            DeliveryError::Api(description) => {
                assert!(description.contains("kicked"));
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }
}
