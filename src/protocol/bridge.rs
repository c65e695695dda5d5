//! JSON-over-WebSocket client for a protocol sidecar.
//!
//! One socket per account at `{bridge_url}/sessions/{number}`. The first
//! frame we send is `hello` carrying the stored credential blob; the sidecar
//! answers `ready` and from then on streams event frames (`creds`, `open`,
//! `close`, `message`) and answers our `request` frames by id.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{
    About, Connected, Connection, ConnectionEvent, Connector, DisconnectReason, InboundMessage,
    MessageKey, Presence,
};
use crate::store::CredentialBlob;

const READY_TIMEOUT_MS: u64 = 15_000;
const REQUEST_TIMEOUT_MS: u64 = 30_000;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundFrame<'a> {
    Hello {
        number: &'a str,
        creds: Option<&'a Value>,
    },
    Request {
        id: &'a str,
        op: &'a str,
        args: Value,
    },
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum InboundFrame {
    Ready {
        #[serde(default)]
        registered: bool,
    },
    Response {
        id: String,
        #[serde(default)]
        ok: bool,
        #[serde(default)]
        result: Value,
        #[serde(default)]
        error: Option<String>,
    },
    Creds {
        creds: Value,
    },
    Open {
        jid: String,
    },
    Close {
        reason: DisconnectReason,
    },
    Message {
        message: InboundMessage,
    },
}

impl InboundFrame {
    fn into_event(self) -> Option<ConnectionEvent> {
        match self {
            InboundFrame::Creds { creds } => Some(ConnectionEvent::CredsUpdate(creds)),
            InboundFrame::Open { jid } => Some(ConnectionEvent::Open { jid }),
            InboundFrame::Close { reason } => Some(ConnectionEvent::Close(reason)),
            InboundFrame::Message { message } => Some(ConnectionEvent::Message(message)),
            InboundFrame::Ready { .. } | InboundFrame::Response { .. } => None,
        }
    }
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, String>>>;

/// Opens [`BridgeConnection`]s against a sidecar base URL.
pub struct BridgeConnector {
    base_url: String,
}

impl BridgeConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = if base_url.starts_with("ws://") || base_url.starts_with("wss://") {
            base_url
        } else {
            format!("ws://{base_url}")
        };
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn session_url(&self, number: &str) -> String {
        format!("{}/sessions/{}", self.base_url, number)
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, number: &str, creds: Option<CredentialBlob>) -> Result<Connected> {
        let url = self.session_url(number);
        tracing::debug!("Bridge: connecting {} via {}", number, url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to protocol bridge at {url}"))?;
        let (mut write, mut read) = ws_stream.split();

        let hello = serde_json::to_string(&OutboundFrame::Hello {
            number,
            creds: creds.as_ref(),
        })?;
        write.send(Message::Text(hello.into())).await?;

        let registered = timeout(Duration::from_millis(READY_TIMEOUT_MS), async {
            while let Some(msg) = read.next().await {
                if let Message::Text(text) = msg? {
                    match serde_json::from_str::<InboundFrame>(&text)? {
                        InboundFrame::Ready { registered } => return Ok(registered),
                        other => tracing::debug!("Bridge: ignoring pre-ready frame {:?}", other),
                    }
                }
            }
            Err::<bool, anyhow::Error>(anyhow!("bridge closed before ready"))
        })
        .await
        .map_err(|_| anyhow!("bridge did not become ready for {number}"))??;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    tracing::debug!("Bridge: write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_closed = closed.clone();
        let reader_number = number.to_string();
        let reader = tokio::spawn(async move {
            let mut close_seen = false;
            let end_reason = loop {
                let msg = match read.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => break format!("websocket error: {e}"),
                    None => break "bridge closed the socket".to_string(),
                };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break "bridge sent close".to_string(),
                    _ => continue,
                };
                let frame = match serde_json::from_str::<InboundFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::warn!("Bridge: unparseable frame for {}: {}", reader_number, e);
                        continue;
                    }
                };
                if let InboundFrame::Response {
                    id,
                    ok,
                    result,
                    error,
                } = frame
                {
                    if let Some(tx) = reader_pending.lock().remove(&id) {
                        let outcome = if ok {
                            Ok(result)
                        } else {
                            Err(error.unwrap_or_else(|| "bridge request failed".into()))
                        };
                        let _ = tx.send(outcome);
                    }
                    continue;
                }
                if let Some(event) = frame.into_event() {
                    close_seen |= matches!(event, ConnectionEvent::Close(_));
                    if event_tx.send(event).await.is_err() {
                        break "event receiver dropped".to_string();
                    }
                }
            };

            // Fail in-flight requests instead of letting them hit the timeout.
            for (_, tx) in reader_pending.lock().drain() {
                let _ = tx.send(Err(end_reason.clone()));
            }

            if !close_seen && !reader_closed.load(Ordering::SeqCst) {
                let _ = event_tx
                    .send(ConnectionEvent::Close(DisconnectReason::connection_lost(
                        end_reason,
                    )))
                    .await;
            }
        });

        let connection = BridgeConnection {
            number: number.to_string(),
            registered,
            outbound: out_tx,
            pending,
            closed,
            tasks: Mutex::new(vec![writer, reader]),
        };

        Ok(Connected {
            connection: Arc::new(connection),
            events: event_rx,
        })
    }
}

pub struct BridgeConnection {
    number: String,
    registered: bool,
    outbound: mpsc::UnboundedSender<Message>,
    pending: Arc<Mutex<PendingMap>>,
    closed: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeConnection {
    async fn request(&self, op: &str, args: Value) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            anyhow::bail!("connection for {} is closed", self.number);
        }

        let id = uuid::Uuid::new_v4().to_string();
        let frame = serde_json::to_string(&OutboundFrame::Request {
            id: &id,
            op,
            args,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        if self.outbound.send(Message::Text(frame.into())).is_err() {
            self.pending.lock().remove(&id);
            anyhow::bail!("connection for {} is gone", self.number);
        }

        match timeout(Duration::from_millis(REQUEST_TIMEOUT_MS), rx).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(message))) => Err(anyhow!("{op} failed: {message}")),
            Ok(Err(_)) => Err(anyhow!("{op} aborted: connection dropped")),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(anyhow!("{op} timed out after {REQUEST_TIMEOUT_MS}ms"))
            }
        }
    }
}

fn string_field(value: &Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl Connection for BridgeConnection {
    fn is_registered(&self) -> bool {
        self.registered
    }

    async fn request_pairing_code(&self, number: &str) -> Result<String> {
        let result = self
            .request("pairing_code", json!({ "number": number }))
            .await?;
        string_field(&result, "code")
            .or_else(|| result.as_str().map(str::to_string))
            .filter(|code| !code.trim().is_empty())
            .ok_or_else(|| anyhow!("bridge returned no pairing code"))
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<String> {
        let result = self
            .request("send_text", json!({ "to": to, "text": text }))
            .await?;
        Ok(string_field(&result, "id").unwrap_or_default())
    }

    async fn react(&self, key: &MessageKey, emoji: &str) -> Result<()> {
        self.request("react", json!({ "key": key, "emoji": emoji }))
            .await
            .map(|_| ())
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        self.request("read", json!({ "keys": keys })).await.map(|_| ())
    }

    async fn send_presence(&self, chat: &str, presence: Presence) -> Result<()> {
        self.request("presence", json!({ "chat": chat, "presence": presence }))
            .await
            .map(|_| ())
    }

    async fn join_group(&self, invite_code: &str) -> Result<String> {
        let result = self
            .request("join_group", json!({ "invite": invite_code }))
            .await?;
        string_field(&result, "jid").ok_or_else(|| anyhow!("bridge returned no group jid"))
    }

    async fn follow_newsletter(&self, jid: &str) -> Result<()> {
        self.request("follow_newsletter", json!({ "jid": jid }))
            .await
            .map(|_| ())
    }

    async fn fetch_about(&self, jid: &str) -> Result<Option<About>> {
        let result = self.request("fetch_status", json!({ "jid": jid })).await?;
        if result.is_null() {
            return Ok(None);
        }
        Ok(Some(About {
            status: string_field(&result, "status"),
            set_at: result.get("set_at").and_then(Value::as_i64),
        }))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(frame) = serde_json::to_string(&OutboundFrame::Close) {
            let _ = self.outbound.send(Message::Text(frame.into()));
        }
        let _ = self.outbound.send(Message::Close(None));

        // The writer exits after flushing the close frame; the reader is no
        // longer needed once we stop caring about events.
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks.into_iter().skip(1) {
            task.abort();
        }
        for (_, tx) in self.pending.lock().drain() {
            let _ = tx.send(Err("connection closed".into()));
        }
        tracing::debug!("Bridge: closed connection for {}", self.number);
    }
}
