//! Environment-backed configuration for `convsync-smoke`.

use std::{env, time::Duration};

use convsync_core::SessionConfig;
use thiserror::Error;
use url::Url;

const DEFAULT_TABLE: &str = "messages";
const DEFAULT_RUN_SECS: u64 = 30;

/// Runtime configuration for one smoke run.
#[derive(Debug, Clone, PartialEq)]
pub struct SmokeConfig {
    /// Conversation to synchronize.
    pub conversation_id: String,
    /// PostgREST base url. Without it the run uses in-memory demo transports.
    pub rest_url: Option<Url>,
    pub api_key: Option<String>,
    /// Table polled through `rest_url`.
    pub table: String,
    /// Subscribe to the realtime socket next to `rest_url`. Off means polling only.
    pub realtime: bool,
    /// Outbound webhook. Sends are skipped when unset.
    pub webhook_url: Option<Url>,
    /// Sender id stamped on outbound messages.
    pub sender: Option<String>,
    /// Session tuning forwarded to `SyncSession::open`.
    pub session: SessionConfig,
    /// How long to keep the session open before closing it.
    pub run_for: Duration,
}

impl SmokeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let conversation_id = optional_trimmed_env("CONVSYNC_CONVERSATION_ID", &mut lookup)
            .ok_or(ConfigError::Missing {
                key: "CONVSYNC_CONVERSATION_ID",
            })?;
        let rest_url = parse_optional_url("CONVSYNC_REST_URL", &mut lookup)?;
        let api_key = optional_trimmed_env("CONVSYNC_API_KEY", &mut lookup);
        let table = optional_trimmed_env("CONVSYNC_TABLE", &mut lookup)
            .unwrap_or_else(|| DEFAULT_TABLE.to_owned());
        let realtime = parse_or("CONVSYNC_REALTIME", true, &mut lookup)?;
        let webhook_url = parse_optional_url("CONVSYNC_WEBHOOK_URL", &mut lookup)?;
        let sender = optional_trimmed_env("CONVSYNC_SENDER", &mut lookup);

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            poll_interval_ms: parse_or(
                "CONVSYNC_POLL_INTERVAL_MS",
                defaults.poll_interval_ms,
                &mut lookup,
            )?,
            initial_load_limit: parse_or(
                "CONVSYNC_INITIAL_LOAD_LIMIT",
                defaults.initial_load_limit,
                &mut lookup,
            )?,
            subscribe_timeout_ms: parse_or(
                "CONVSYNC_SUBSCRIBE_TIMEOUT_MS",
                defaults.subscribe_timeout_ms,
                &mut lookup,
            )?,
            ..defaults
        };
        let run_secs: u64 = parse_or("CONVSYNC_RUN_SECS", DEFAULT_RUN_SECS, &mut lookup)?;

        if session.poll_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONVSYNC_POLL_INTERVAL_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if session.subscribe_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONVSYNC_SUBSCRIBE_TIMEOUT_MS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }
        if run_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "CONVSYNC_RUN_SECS",
                value: "0".to_owned(),
                reason: "must be at least 1".to_owned(),
            });
        }

        Ok(Self {
            conversation_id,
            rest_url,
            api_key,
            table,
            realtime,
            webhook_url,
            sender,
            session,
            run_for: Duration::from_secs(run_secs),
        })
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} is required")]
    Missing { key: &'static str },
    /// An environment variable could not be parsed.
    #[error("invalid {key}='{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_url<F>(key: &'static str, lookup: &mut F) -> Result<Option<Url>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    Url::parse(&value)
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_or<T, F>(key: &'static str, default: T, lookup: &mut F) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(default);
    };
    value.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value,
        reason: err.to_string(),
    })
}
