use std::time::Duration;

use async_trait::async_trait;
use convsync_core::{ChangeKind, RawChange, SyncError, SyncErrorCategory, classify_http_status};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::Instant};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as WsMessage},
};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::{
    feed::{ChangeFeed, FeedMessage, FeedSubscription},
    http::status_error,
    rest::{DEFAULT_TABLE, as_directory},
};

const SCHEMA: &str = "public";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const PROTOCOL_VERSION: &str = "1.0.0";
const JOIN_REF: &str = "1";
const HEARTBEAT_TOPIC: &str = "phoenix";
const SUBSCRIPTION_BUFFER: usize = 256;

/// [`ChangeFeed`] over a Supabase-style realtime websocket.
///
/// Each subscription opens its own socket, joins one channel filtered to the
/// conversation and streams `postgres_changes` rows until the subscription is
/// dropped or the server reports a channel error.
#[derive(Debug, Clone)]
pub struct RealtimeChangeFeed {
    endpoint: Url,
    api_key: Option<String>,
    table: String,
}

impl RealtimeChangeFeed {
    /// `base_url` is the project root, the same one given to the REST fetcher.
    pub fn new(base_url: Url) -> Result<Self, SyncError> {
        let mut endpoint = as_directory(base_url)
            .join("realtime/v1/websocket")
            .map_err(|err| invalid_endpoint(format!("cannot build realtime url: {err}")))?;
        let scheme = match endpoint.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => return Err(invalid_endpoint(format!("unsupported url scheme '{other}'"))),
        };
        endpoint
            .set_scheme(scheme)
            .map_err(|()| invalid_endpoint(format!("cannot switch url scheme to {scheme}")))?;

        Ok(Self {
            endpoint,
            api_key: None,
            table: DEFAULT_TABLE.to_owned(),
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    fn socket_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            if let Some(api_key) = &self.api_key {
                query.append_pair("apikey", api_key);
            }
            query.append_pair("vsn", PROTOCOL_VERSION);
        }
        url
    }

    fn topic(&self, conversation_id: &str) -> String {
        format!("realtime:{SCHEMA}:{}:{conversation_id}", self.table)
    }

    fn join_frame(&self, topic: &str, conversation_id: &str) -> Frame {
        let mut payload = json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "*",
                    "schema": SCHEMA,
                    "table": self.table,
                    "filter": format!("conversation_id=eq.{conversation_id}"),
                }],
            },
        });
        if let Some(api_key) = &self.api_key {
            payload["access_token"] = json!(api_key);
        }

        Frame {
            topic: topic.to_owned(),
            event: "phx_join".to_owned(),
            payload,
            reference: Some(JOIN_REF.to_owned()),
            join_ref: Some(JOIN_REF.to_owned()),
        }
    }
}

#[async_trait]
impl ChangeFeed for RealtimeChangeFeed {
    #[instrument(skip(self), fields(table = %self.table))]
    async fn subscribe(&self, conversation_id: &str) -> Result<FeedSubscription, SyncError> {
        let (mut socket, _) = connect_async(self.socket_url().as_str())
            .await
            .map_err(connect_error)?;

        let topic = self.topic(conversation_id);
        send_frame(&mut socket, &self.join_frame(&topic, conversation_id)).await?;
        await_join(&mut socket, &topic).await?;
        info!(%topic, "realtime channel joined");

        let (tx, subscription) = FeedSubscription::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(pump(socket, topic, tx));
        Ok(subscription)
    }
}

/// Phoenix channel envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct Frame {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

impl Frame {
    fn heartbeat(sequence: u64) -> Self {
        Self {
            topic: HEARTBEAT_TOPIC.to_owned(),
            event: "heartbeat".to_owned(),
            payload: json!({}),
            reference: Some(sequence.to_string()),
            join_ref: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChangeData {
    #[serde(rename = "type")]
    kind: ChangeKind,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
}

/// What one server frame means for the subscription.
#[derive(Debug, PartialEq)]
enum Inbound {
    Joined,
    Change(RawChange),
    Failed(SyncError),
    TimedOut,
    Unreadable(String),
    Ignored,
}

fn classify(topic: &str, text: &str) -> Inbound {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => return Inbound::Unreadable(err.to_string()),
    };
    if frame.topic != topic {
        return Inbound::Ignored;
    }

    match frame.event.as_str() {
        "phx_reply" if frame.reference.as_deref() == Some(JOIN_REF) => {
            match frame.payload.get("status").and_then(Value::as_str) {
                Some("ok") => Inbound::Joined,
                Some("timeout") => Inbound::TimedOut,
                _ => Inbound::Failed(SyncError::transport(format!(
                    "realtime channel join rejected: {}",
                    reason(&frame.payload)
                ))),
            }
        }
        "postgres_changes" => match decode_change(&frame.payload) {
            Ok(change) => Inbound::Change(change),
            Err(err) => Inbound::Unreadable(err),
        },
        "phx_error" => Inbound::Failed(SyncError::transport("realtime channel error")),
        "phx_close" => Inbound::Failed(SyncError::transport("realtime channel closed by server")),
        "system" if frame.payload.get("status").and_then(Value::as_str) == Some("error") => {
            Inbound::Failed(SyncError::transport(format!(
                "realtime channel error: {}",
                reason(&frame.payload)
            )))
        }
        _ => Inbound::Ignored,
    }
}

fn decode_change(payload: &Value) -> Result<RawChange, String> {
    let data = payload
        .get("data")
        .cloned()
        .ok_or_else(|| "postgres_changes frame without data".to_owned())?;
    let data: ChangeData = serde_json::from_value(data).map_err(|err| err.to_string())?;

    Ok(RawChange {
        kind: data.kind,
        new: data.record.filter(has_fields),
        old: data.old_record.filter(has_fields),
    })
}

fn has_fields(row: &Value) -> bool {
    row.as_object().is_some_and(|fields| !fields.is_empty())
}

fn reason(payload: &Value) -> String {
    payload
        .pointer("/response/reason")
        .or_else(|| payload.get("message"))
        .and_then(Value::as_str)
        .unwrap_or("no reason given")
        .to_owned()
}

async fn send_frame<S>(socket: &mut S, frame: &Frame) -> Result<(), SyncError>
where
    S: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(frame).map_err(|err| {
        SyncError::new(
            SyncErrorCategory::Serialization,
            "transport_error",
            format!("cannot encode realtime frame: {err}"),
        )
    })?;
    socket
        .send(WsMessage::text(text))
        .await
        .map_err(|err| SyncError::transport(format!("realtime send failed: {err}")))
}

/// Read until the server answers the join.
async fn await_join<S>(socket: &mut S, topic: &str) -> Result<(), SyncError>
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
{
    loop {
        let text = match socket.next().await {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(SyncError::transport("realtime socket closed during join"));
            }
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                return Err(SyncError::transport(format!("realtime read failed: {err}")));
            }
        };

        match classify(topic, text.as_str()) {
            Inbound::Joined => return Ok(()),
            Inbound::Failed(err) => return Err(err),
            Inbound::TimedOut => {
                return Err(SyncError::new(
                    SyncErrorCategory::Network,
                    "subscribe_timeout",
                    "realtime server timed out the channel join",
                ));
            }
            Inbound::Unreadable(err) => warn!(%topic, error = %err, "unreadable frame during join"),
            Inbound::Change(_) | Inbound::Ignored => {}
        }
    }
}

/// Forward changes until the subscription is dropped or the channel fails.
async fn pump<S>(mut socket: S, topic: String, tx: mpsc::Sender<FeedMessage>)
where
    S: Stream<Item = Result<WsMessage, tungstenite::Error>>
        + Sink<WsMessage, Error = tungstenite::Error>
        + Unpin,
{
    let mut ticker =
        tokio::time::interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
    let mut sequence: u64 = 1;

    loop {
        let inbound = tokio::select! {
            _ = tx.closed() => {
                debug!(%topic, "realtime subscription dropped");
                break;
            }
            _ = ticker.tick() => {
                sequence += 1;
                match send_frame(&mut socket, &Frame::heartbeat(sequence)).await {
                    Ok(()) => Inbound::Ignored,
                    Err(err) => Inbound::Failed(err),
                }
            }
            message = socket.next() => match message {
                Some(Ok(WsMessage::Text(text))) => classify(&topic, text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => {
                    Inbound::Failed(SyncError::transport("realtime socket closed"))
                }
                Some(Ok(_)) => Inbound::Ignored,
                Some(Err(err)) => {
                    Inbound::Failed(SyncError::transport(format!("realtime read failed: {err}")))
                }
            },
        };

        match inbound {
            Inbound::Change(change) => {
                if tx.send(FeedMessage::Change(change)).await.is_err() {
                    break;
                }
            }
            Inbound::Failed(err) => {
                warn!(%topic, code = %err.code, error = %err.message, "realtime channel failed");
                let _ = tx.send(FeedMessage::Error(err)).await;
                break;
            }
            Inbound::TimedOut => {
                let _ = tx.send(FeedMessage::TimedOut).await;
                break;
            }
            Inbound::Unreadable(err) => warn!(%topic, error = %err, "skipping unreadable frame"),
            Inbound::Joined | Inbound::Ignored => {}
        }
    }

    let _ = socket.close().await;
}

fn connect_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|value| value.to_str().ok());
            status_error(
                classify_http_status(status),
                "transport_error",
                format!("realtime handshake failed with HTTP {status}"),
                retry_after,
            )
        }
        other => SyncError::transport(format!("realtime connect failed: {other}")),
    }
}

fn invalid_endpoint(message: String) -> SyncError {
    SyncError::new(SyncErrorCategory::Config, "invalid_config", message)
}
