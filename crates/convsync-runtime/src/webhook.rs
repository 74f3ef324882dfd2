use chrono::Utc;
use convsync_core::{SendOutcome, SyncError, SyncErrorCategory, Timestamp, classify_http_status};
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::http::status_error;

/// JSON body posted to the outbound webhook.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutboundMessage {
    pub text: String,
    pub conversation_id: String,
    pub reply_to: Option<String>,
    pub timestamp: Timestamp,
    pub message_id: String,
    pub sender: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl OutboundMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        sender: Option<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            text: text.into(),
            conversation_id: conversation_id.into(),
            reply_to: None,
            timestamp: Utc::now(),
            message_id: Uuid::new_v4().to_string(),
            sender,
            metadata: Map::new(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Fire-and-forget HTTP delivery of outbound messages.
///
/// A send never touches the local store; the message shows up only once the
/// upstream writes it back and an ingestion channel picks it up.
#[derive(Debug, Clone)]
pub struct WebhookSender {
    http: reqwest::Client,
    url: Url,
}

impl WebhookSender {
    pub fn new(url: Url) -> Self {
        Self::with_client(reqwest::Client::new(), url)
    }

    pub fn with_client(http: reqwest::Client, url: Url) -> Self {
        Self { http, url }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// One POST of `message`. The response body is ignored.
    #[instrument(skip(self, message), fields(message_id = %message.message_id))]
    pub async fn post(&self, message: &OutboundMessage) -> Result<(), SyncError> {
        let response = self
            .http
            .post(self.url.clone())
            .json(message)
            .send()
            .await
            .map_err(|err| SyncError::send(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok());
            return Err(status_error(
                send_category(status.as_u16()),
                "send_failed",
                format!("webhook responded with HTTP {}", status.as_u16()),
                retry_after,
            ));
        }

        debug!(status = status.as_u16(), "webhook accepted message");
        Ok(())
    }

    /// Post once and log the result.
    pub async fn deliver(&self, message: &OutboundMessage) -> SendOutcome {
        match self.post(message).await {
            Ok(()) => SendOutcome::Delivered,
            Err(error) => {
                warn!(
                    message_id = %message.message_id,
                    code = %error.code,
                    error = %error.message,
                    "outbound message was not delivered"
                );
                SendOutcome::Failed { error }
            }
        }
    }

    /// Deliver in a background task and hand the outcome to `on_done`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch<F>(&self, message: OutboundMessage, on_done: F) -> JoinHandle<()>
    where
        F: FnOnce(SendOutcome) + Send + 'static,
    {
        let sender = self.clone();
        tokio::spawn(async move { on_done(sender.deliver(&message).await) })
    }
}

fn send_category(status: u16) -> SyncErrorCategory {
    match classify_http_status(status) {
        SyncErrorCategory::Internal => SyncErrorCategory::Network,
        category => category,
    }
}
