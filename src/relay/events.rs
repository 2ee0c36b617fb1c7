//! Wire messages exchanged with browser clients over `/ws`.
//!
//! Every frame is a JSON text message of the form
//! `{"event": "<name>", "data": {...}}`.

use serde::{Deserialize, Serialize};

use crate::login::LoginEvent;
use crate::session::{FailureReason, SessionId};

/// Reply to frames that cannot be parsed or name an unknown event.
pub const UNSUPPORTED_REQUEST: &str = "Unsupported request.";

// ── Client → Server ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Start a QR login.
    CreateSession,
    /// Start a phone-number pairing login.
    CreatePairingSession {
        #[serde(rename = "phoneNumber")]
        phone_number: String,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }
}

// ── Server → Client ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    SessionCreated {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    QrUpdate {
        qr: String,
    },
    PairingCode {
        code: String,
    },
    /// The finished session string. The field keeps the name clients
    /// already read it from.
    SessionGenerated {
        #[serde(rename = "sessionId")]
        session: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn failure(reason: FailureReason) -> Self {
        Self::error(reason.user_message())
    }

    pub fn to_json(&self) -> String {
        // Every variant holds only strings and ids.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":"error","data":{"message":"Unsupported request."}}"#.to_string()
        })
    }
}

impl From<LoginEvent> for ServerMessage {
    fn from(event: LoginEvent) -> Self {
        match event {
            LoginEvent::QrReady { data_url } => Self::QrUpdate { qr: data_url },
            LoginEvent::PairingCodeReady { code } => Self::PairingCode { code },
            LoginEvent::Completed { session_string } => Self::SessionGenerated {
                session: session_string,
            },
            LoginEvent::Failed(reason) => Self::failure(reason),
        }
    }
}
