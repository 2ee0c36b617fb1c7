//! Decoding of the library's loosely-typed `connection.update` payload.
//!
//! A single update may carry several facts at once (a QR payload and a
//! connection state, for instance). They are flattened into an ordered list
//! of [`ProtocolEvent`]s: QR first, then the connection transition.

use serde::Deserialize;

use super::{CloseReason, ProtocolEvent};

/// Disconnect status code the library uses for an explicit logout.
pub const LOGGED_OUT_STATUS: u16 = 401;

#[derive(Debug, Default, Deserialize)]
struct ConnectionUpdate {
    #[serde(default)]
    connection: Option<String>,
    #[serde(default)]
    qr: Option<String>,
    #[serde(default, rename = "lastDisconnect")]
    last_disconnect: Option<LastDisconnect>,
}

#[derive(Debug, Default, Deserialize)]
struct LastDisconnect {
    #[serde(default)]
    error: Option<DisconnectError>,
}

#[derive(Debug, Default, Deserialize)]
struct DisconnectError {
    #[serde(default)]
    output: Option<DisconnectOutput>,
}

#[derive(Debug, Default, Deserialize)]
struct DisconnectOutput {
    #[serde(default, rename = "statusCode")]
    status_code: Option<u16>,
}

impl ConnectionUpdate {
    fn status_code(&self) -> Option<u16> {
        self.last_disconnect
            .as_ref()?
            .error
            .as_ref()?
            .output
            .as_ref()?
            .status_code
    }
}

/// Map a close status code to a [`CloseReason`].
pub fn close_reason(status_code: Option<u16>) -> CloseReason {
    if status_code == Some(LOGGED_OUT_STATUS) {
        CloseReason::LoggedOut
    } else {
        CloseReason::Other { status_code }
    }
}

/// Decode one raw update into zero or more events.
pub fn decode_connection_update(raw: &serde_json::Value) -> Vec<ProtocolEvent> {
    let update: ConnectionUpdate = match serde_json::from_value(raw.clone()) {
        Ok(u) => u,
        Err(e) => {
            tracing::warn!(error = %e, "Ignoring malformed connection update");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    if let Some(qr) = update.qr.as_deref().filter(|qr| !qr.is_empty()) {
        events.push(ProtocolEvent::Qr(qr.to_string()));
    }
    match update.connection.as_deref() {
        Some("open") => events.push(ProtocolEvent::Open),
        Some("close") => events.push(ProtocolEvent::Close(close_reason(update.status_code()))),
        Some("connecting") | None => {}
        Some(other) => tracing::debug!(state = other, "Unknown connection state"),
    }
    events
}
