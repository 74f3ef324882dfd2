//! Coercion of loosely-typed feed and poll payloads into [`MessageRow`].
//!
//! This is the only place raw JSON is inspected; everything downstream works
//! on validated rows.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value};

use crate::{
    error::SyncError,
    types::{ChangeEvent, ChangeKind, MessageRow, RawChange, SessionEvent, Timestamp},
};

/// Decode one row object into the message schema.
pub fn normalize_row(value: &Value) -> Result<MessageRow, SyncError> {
    let Some(object) = value.as_object() else {
        return Err(SyncError::invalid_row(format!(
            "expected row object, got {}",
            json_kind(value)
        )));
    };

    let id = string_field(object, "id")?
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| SyncError::invalid_row("row has no usable 'id'"))?;

    Ok(MessageRow {
        id,
        conversation_id: string_field(object, "conversation_id")?,
        text: text_field(object, "text")?,
        content: text_field(object, "content")?,
        sender_id: string_field(object, "sender_id")?,
        metadata: metadata_field(object)?,
        reply_to: string_field(object, "reply_to")?,
        created_at: timestamp_field(object, "created_at")?,
        platform_timestamp: timestamp_field(object, "platform_timestamp")?,
    })
}

/// Decode a wire change into a typed change event.
pub fn normalize_change(raw: &RawChange) -> Result<ChangeEvent, SyncError> {
    match raw.kind {
        ChangeKind::Insert => Ok(ChangeEvent::Insert(normalize_row(required_image(
            raw.new.as_ref(),
            "new",
        )?)?)),
        ChangeKind::Update => Ok(ChangeEvent::Update(normalize_row(required_image(
            raw.new.as_ref(),
            "new",
        )?)?)),
        ChangeKind::Delete => {
            let old = required_image(raw.old.as_ref(), "old")?;
            let id = old
                .as_object()
                .map(|object| string_field(object, "id"))
                .transpose()?
                .flatten()
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| SyncError::invalid_row("delete payload has no usable 'id'"))?;
            Ok(ChangeEvent::Delete { id })
        }
    }
}

/// Parse a timestamp given as RFC 3339, Postgres text, or epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Result<Option<Timestamp>, SyncError> {
    match value {
        Value::Null => Ok(None),
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .map(Some)
            .ok_or_else(|| SyncError::invalid_row(format!("timestamp out of range: {number}"))),
        Value::String(text) => parse_timestamp_text(text.trim()).map(Some),
        other => Err(SyncError::invalid_row(format!(
            "expected timestamp, got {}",
            json_kind(other)
        ))),
    }
}

/// Result of one outbound send attempt before normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    Failed { error: SyncError },
}

/// Convert a send outcome into the session event observers see, if any.
///
/// Successful sends are silent: the message only becomes visible when it
/// comes back through an ingestion channel.
pub fn normalize_send_outcome(
    message_id: impl Into<String>,
    outcome: SendOutcome,
) -> Option<SessionEvent> {
    match outcome {
        SendOutcome::Delivered => None,
        SendOutcome::Failed { error } => Some(SessionEvent::SendFailed {
            message_id: message_id.into(),
            code: error.code,
            message: error.message,
        }),
    }
}

fn parse_timestamp_text(text: &str) -> Result<Timestamp, SyncError> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    // Postgres text output, e.g. `2024-05-01 10:00:00.123+00`.
    if let Ok(parsed) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(SyncError::invalid_row(format!("unparseable timestamp '{text}'")))
}

fn required_image<'a>(image: Option<&'a Value>, name: &str) -> Result<&'a Value, SyncError> {
    image
        .filter(|value| !value.is_null())
        .ok_or_else(|| SyncError::invalid_row(format!("change payload is missing '{name}'")))
}

fn string_field(object: &Map<String, Value>, key: &str) -> Result<Option<String>, SyncError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(Value::Number(value)) => Ok(Some(value.to_string())),
        Some(other) => Err(SyncError::invalid_row(format!(
            "field '{key}' must be a string, got {}",
            json_kind(other)
        ))),
    }
}

fn text_field(object: &Map<String, Value>, key: &str) -> Result<Option<String>, SyncError> {
    match object.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(other) => Err(SyncError::invalid_row(format!(
            "field '{key}' must be text, got {}",
            json_kind(other)
        ))),
    }
}

fn metadata_field(object: &Map<String, Value>) -> Result<Option<Map<String, Value>>, SyncError> {
    match object.get("metadata") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(metadata)) => Ok(Some(metadata.clone())),
        Some(other) => Err(SyncError::invalid_row(format!(
            "field 'metadata' must be an object, got {}",
            json_kind(other)
        ))),
    }
}

fn timestamp_field(object: &Map<String, Value>, key: &str) -> Result<Option<Timestamp>, SyncError> {
    match object.get(key) {
        None => Ok(None),
        Some(value) => parse_timestamp(value).map_err(|err| {
            SyncError::invalid_row(format!("field '{key}': {}", err.message))
        }),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
