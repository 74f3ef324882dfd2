use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::StreamState;

/// Broad error category used for logging and retry decisions.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SyncErrorCategory {
    /// Invalid input or configuration.
    Config,
    /// Authentication/authorization failure.
    Auth,
    /// Transient network or transport failure.
    Network,
    /// Rate-limited by the upstream data store.
    RateLimited,
    /// Payload could not be decoded into the message schema.
    Serialization,
    /// Engine bug or lifecycle misuse.
    Internal,
}

/// Stable error payload shared by the ingestion channels and the send path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Error)]
#[error("{category:?}:{code}: {message}")]
pub struct SyncError {
    /// High-level error category.
    pub category: SyncErrorCategory,
    /// Stable machine-readable error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Optional retry hint in milliseconds.
    pub retry_after_ms: Option<u64>,
}

impl SyncError {
    pub fn new(
        category: SyncErrorCategory,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Attach a retry hint to the error.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Change-stream subscribe or delivery failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Network, "transport_error", message)
    }

    /// Subscribe attempt exceeded its deadline.
    pub fn subscribe_timeout(after: Duration) -> Self {
        Self::new(
            SyncErrorCategory::Network,
            "subscribe_timeout",
            format!("subscription not confirmed within {}ms", after.as_millis()),
        )
    }

    /// Polling request failure.
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Network, "fetch_error", message)
    }

    /// Outbound webhook failure.
    pub fn send(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Network, "send_failed", message)
    }

    /// Row that cannot be coerced into the message schema.
    pub fn invalid_row(message: impl Into<String>) -> Self {
        Self::new(SyncErrorCategory::Serialization, "invalid_row", message)
    }

    /// Build a standard invalid-state-transition error.
    pub fn invalid_state(current: StreamState, action: impl Into<String>) -> Self {
        let action = action.into();
        Self::new(
            SyncErrorCategory::Internal,
            "invalid_state_transition",
            format!("cannot run '{action}' while change stream is in state {current:?}"),
        )
    }

    /// Whether trying again later can plausibly succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category,
            SyncErrorCategory::Network | SyncErrorCategory::RateLimited
        )
    }
}

/// Map HTTP status codes to error categories.
pub fn classify_http_status(status: u16) -> SyncErrorCategory {
    match status {
        401 | 403 => SyncErrorCategory::Auth,
        408 | 429 => SyncErrorCategory::RateLimited,
        400..=499 => SyncErrorCategory::Config,
        500..=599 => SyncErrorCategory::Network,
        _ => SyncErrorCategory::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_http_status_categories() {
        assert_eq!(classify_http_status(401), SyncErrorCategory::Auth);
        assert_eq!(classify_http_status(429), SyncErrorCategory::RateLimited);
        assert_eq!(classify_http_status(404), SyncErrorCategory::Config);
        assert_eq!(classify_http_status(503), SyncErrorCategory::Network);
        assert_eq!(classify_http_status(700), SyncErrorCategory::Internal);
    }

    #[test]
    fn keeps_invalid_state_error_code_stable() {
        let err = SyncError::invalid_state(StreamState::Closed, "restart");
        assert_eq!(err.code, "invalid_state_transition");
        assert_eq!(err.category, SyncErrorCategory::Internal);
        assert!(!err.is_recoverable());
    }

    #[test]
    fn channel_failures_are_recoverable() {
        assert!(SyncError::transport("socket closed").is_recoverable());
        assert!(SyncError::fetch("502").is_recoverable());
        assert!(SyncError::subscribe_timeout(Duration::from_secs(10)).is_recoverable());
        assert!(!SyncError::invalid_row("missing id").is_recoverable());
    }

    #[test]
    fn persists_retry_after_in_millis() {
        let err = SyncError::new(SyncErrorCategory::RateLimited, "rate_limited", "wait")
            .with_retry_after(Duration::from_secs(3));
        assert_eq!(err.retry_after_ms, Some(3000));
    }
}
