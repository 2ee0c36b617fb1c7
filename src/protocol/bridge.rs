//! WebSocket client for the protocol bridge.
//!
//! The messaging library runs in a sidecar process next to this server. Each
//! login attempt opens its own WebSocket to the sidecar, which drives one
//! library socket whose auth state lives in the session's credential
//! directory (the sidecar shares the filesystem).
//!
//! ## Wire format
//!
//! All frames are JSON text frames.
//!
//! ```text
//! server ─▸ bridge   {"type":"connect","authDir":..,"browser":[..],"connectTimeoutMs":..,..}
//!                    {"type":"request-pairing-code","phoneNumber":"2347012345678"}
//!                    {"type":"close"}
//! bridge ─▸ server   {"type":"connection.update","update":{ connection?, qr?, lastDisconnect? }}
//!                    {"type":"pairing.ready"}
//!                    {"type":"creds.update"}
//!                    {"type":"pairing-code","code":"ABCD-EFGH"}
//!                    {"type":"pairing-error","reason":"invalid-number","message":".."}
//! ```

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};

use super::update::decode_connection_update;
use super::{
    CloseReason, ConnectOptions, PairingCodeError, ProtocolClient, ProtocolConnection,
    ProtocolEvent, ProtocolLink, EVENT_CHANNEL_CAPACITY,
};
use crate::session::SessionId;

type BridgeStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

type PendingPairing = Arc<Mutex<Option<oneshot::Sender<Result<String, PairingCodeError>>>>>;

// ── Frames ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum OutboundFrame {
    #[serde(rename = "connect")]
    Connect {
        #[serde(rename = "sessionId")]
        session_id: String,
        #[serde(rename = "authDir")]
        auth_dir: String,
        browser: [String; 3],
        #[serde(rename = "connectTimeoutMs")]
        connect_timeout_ms: u64,
        #[serde(rename = "defaultQueryTimeoutMs")]
        query_timeout_ms: u64,
        #[serde(rename = "keepAliveIntervalMs")]
        keep_alive_ms: u64,
    },
    #[serde(rename = "request-pairing-code")]
    RequestPairingCode {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
    },
    #[serde(rename = "close")]
    Close,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum InboundFrame {
    #[serde(rename = "connection.update")]
    ConnectionUpdate { update: serde_json::Value },
    #[serde(rename = "pairing.ready")]
    PairingReady,
    #[serde(rename = "creds.update")]
    CredsUpdate,
    #[serde(rename = "pairing-code")]
    PairingCode { code: String },
    #[serde(rename = "pairing-error")]
    PairingError {
        #[serde(default)]
        reason: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ── Client ──────────────────────────────────────────────────────

/// [`ProtocolClient`] that talks to the sidecar bridge.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    url: String,
}

impl BridgeClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn connect(
        &self,
        session_id: &SessionId,
        auth_dir: &Path,
        options: &ConnectOptions,
    ) -> anyhow::Result<ProtocolLink> {
        tracing::debug!(session_id = %session_id, url = %self.url, "Connecting to protocol bridge");

        let (mut ws_stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| anyhow::anyhow!("Failed to reach protocol bridge at {}: {e}", self.url))?;

        let hello = OutboundFrame::Connect {
            session_id: session_id.to_string(),
            auth_dir: auth_dir.to_string_lossy().into_owned(),
            browser: options.browser.clone(),
            connect_timeout_ms: duration_ms(options.connect_timeout),
            query_timeout_ms: duration_ms(options.query_timeout),
            keep_alive_ms: duration_ms(options.keep_alive),
        };
        ws_stream
            .send(WsMessage::Text(serde_json::to_string(&hello)?.into()))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to send connect frame: {e}"))?;

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (event_tx, event_rx) = mpsc::channel::<ProtocolEvent>(EVENT_CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(16);
        let pending: PendingPairing = Arc::new(Mutex::new(None));

        let sid_out = *session_id;
        tokio::spawn(async move {
            outbound_loop(out_rx, ws_sender, sid_out).await;
        });

        spawn_event_pipeline(ws_receiver, event_tx, Arc::clone(&pending), *session_id);

        Ok(ProtocolLink {
            connection: Arc::new(BridgeConnection {
                out_tx,
                pending,
                query_timeout: options.query_timeout,
                closed: AtomicBool::new(false),
            }),
            events: event_rx,
        })
    }
}

// ── Connection handle ───────────────────────────────────────────

struct BridgeConnection {
    out_tx: mpsc::Sender<OutboundFrame>,
    pending: PendingPairing,
    query_timeout: Duration,
    closed: AtomicBool,
}

#[async_trait]
impl ProtocolConnection for BridgeConnection {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingCodeError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.is_some() {
                return Err(PairingCodeError::Other("pairing code request already pending".into()));
            }
            *pending = Some(tx);
        }

        let frame = OutboundFrame::RequestPairingCode {
            phone_number: phone_number.to_string(),
        };
        if self.out_tx.send(frame).await.is_err() {
            self.pending.lock().take();
            return Err(PairingCodeError::Other("bridge connection closed".into()));
        }

        match tokio::time::timeout(self.query_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PairingCodeError::Other("bridge connection closed".into())),
            Err(_) => {
                self.pending.lock().take();
                Err(PairingCodeError::Other(format!(
                    "no pairing code within {}s",
                    self.query_timeout.as_secs()
                )))
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.out_tx.send(OutboundFrame::Close).await;
    }
}

// ── Internal loops ──────────────────────────────────────────────

async fn outbound_loop(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut ws_sender: futures_util::stream::SplitSink<BridgeStream, WsMessage>,
    session_id: SessionId,
) {
    while let Some(frame) = rx.recv().await {
        let is_close = matches!(frame, OutboundFrame::Close);
        let json = match serde_json::to_string(&frame) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to encode bridge frame");
                continue;
            }
        };
        if let Err(e) = ws_sender.send(WsMessage::Text(json.into())).await {
            tracing::debug!(session_id = %session_id, error = %e, "Bridge send failed");
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = ws_sender.close().await;
    tracing::debug!(session_id = %session_id, "Bridge outbound loop ended");
}

/// Read bridge frames on one task and hand their events to the bounded
/// `event_tx` on another. Pairing replies are resolved by the reader, so a
/// consumer that is busy awaiting one never stalls it.
fn spawn_event_pipeline<S>(
    ws_receiver: S,
    event_tx: mpsc::Sender<ProtocolEvent>,
    pending: PendingPairing,
    session_id: SessionId,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Send + Unpin + 'static,
{
    let (staged_tx, staged_rx) = mpsc::unbounded_channel();
    tokio::spawn(inbound_loop(ws_receiver, staged_tx, pending, session_id));
    tokio::spawn(forward_loop(staged_rx, event_tx, session_id));
}

async fn forward_loop(
    mut staged_rx: mpsc::UnboundedReceiver<ProtocolEvent>,
    event_tx: mpsc::Sender<ProtocolEvent>,
    session_id: SessionId,
) {
    while let Some(event) = staged_rx.recv().await {
        if event_tx.send(event).await.is_err() {
            tracing::debug!(session_id = %session_id, "Event receiver dropped, stopping forwarder");
            return;
        }
    }
}

async fn inbound_loop<S>(
    mut ws_receiver: S,
    event_tx: mpsc::UnboundedSender<ProtocolEvent>,
    pending: PendingPairing,
    session_id: SessionId,
) where
    S: Stream<Item = Result<WsMessage, WsError>> + Unpin,
{
    let mut close_seen = false;

    while let Some(msg_result) = ws_receiver.next().await {
        let text = match msg_result {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(frame)) => {
                tracing::debug!(session_id = %session_id, frame = ?frame, "Bridge closed the socket");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Bridge socket error");
                break;
            }
        };

        let frame: InboundFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(session_id = %session_id, error = %e, "Ignoring unknown bridge frame");
                continue;
            }
        };

        let events = match frame {
            InboundFrame::ConnectionUpdate { update } => decode_connection_update(&update),
            InboundFrame::PairingReady => vec![ProtocolEvent::PairingCodeRequested],
            InboundFrame::CredsUpdate => vec![ProtocolEvent::CredentialsUpdated],
            InboundFrame::PairingCode { code } => {
                resolve_pairing(&pending, Ok(code), &session_id);
                continue;
            }
            InboundFrame::PairingError { reason, message } => {
                let message = message.unwrap_or_else(|| "pairing code request failed".into());
                let err = match reason.as_deref() {
                    Some("invalid-number") => PairingCodeError::InvalidNumber(message),
                    _ => PairingCodeError::Other(message),
                };
                resolve_pairing(&pending, Err(err), &session_id);
                continue;
            }
        };

        for event in events {
            close_seen |= matches!(event, ProtocolEvent::Close(_));
            if event_tx.send(event).is_err() {
                tracing::debug!(session_id = %session_id, "Event receiver dropped, closing inbound loop");
                return;
            }
        }
    }

    if !close_seen {
        let _ = event_tx.send(ProtocolEvent::Close(CloseReason::Other { status_code: None }));
    }
}

fn resolve_pairing(
    pending: &PendingPairing,
    result: Result<String, PairingCodeError>,
    session_id: &SessionId,
) {
    match pending.lock().take() {
        Some(tx) => {
            let _ = tx.send(result);
        }
        None => {
            tracing::warn!(session_id = %session_id, "Pairing response without a pending request");
        }
    }
}
