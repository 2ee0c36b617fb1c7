//! Boundary to the external messaging-protocol library.
//!
//! The library itself is a black box. The core needs exactly this from it:
//!
//! - `connect(authDir)` → a connection handle plus a stream of events
//! - events: QR text, pairing-code-ready, open, close(reason), creds updated
//! - `request_pairing_code(phone)` and `close()` on the handle
//!
//! Library payloads are loosely typed; they are decoded once, here, into
//! the closed [`ProtocolEvent`] enum so nothing downstream inspects raw JSON.

pub mod bridge;
#[cfg(test)]
pub mod testing;
pub mod update;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::session::SessionId;

pub use bridge::BridgeClient;
pub use update::{decode_connection_update, LOGGED_OUT_STATUS};

/// Buffer size of a connection's event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Why the protocol connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The account explicitly revoked the link.
    LoggedOut,
    /// Anything else; the status code is kept for logs.
    Other { status_code: Option<u16> },
}

/// Closed set of events a protocol connection emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolEvent {
    /// A (new) QR payload to render.
    Qr(String),
    /// The connection is ready for a pairing-code request.
    PairingCodeRequested,
    /// Handshake succeeded.
    Open,
    /// Connection closed.
    Close(CloseReason),
    /// The library persisted updated credentials to the auth directory.
    CredentialsUpdated,
}

/// Errors from a pairing-code request.
#[derive(Debug, thiserror::Error)]
pub enum PairingCodeError {
    #[error("phone number rejected: {0}")]
    InvalidNumber(String),
    #[error("pairing code request failed: {0}")]
    Other(String),
}

/// Connection settings handed to the library. All timeouts are bounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Browser triple announced to the server (name, agent, version).
    pub browser: [String; 3],
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub keep_alive: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            browser: [
                "Mark Sumo Session Generator".into(),
                "Chrome".into(),
                "1.0.0".into(),
            ],
            connect_timeout: Duration::from_secs(60),
            query_timeout: Duration::from_secs(60),
            keep_alive: Duration::from_secs(10),
        }
    }
}

/// A live protocol connection handle.
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    /// Ask the library for a pairing code for `phone_number` (digits only).
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingCodeError>;

    /// Close the connection. Must be safe to call more than once.
    async fn close(&self);
}

/// A freshly opened connection together with its event stream.
pub struct ProtocolLink {
    pub connection: Arc<dyn ProtocolConnection>,
    pub events: mpsc::Receiver<ProtocolEvent>,
}

/// Factory for protocol connections.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn name(&self) -> &str;

    /// Open a connection whose auth state lives in `auth_dir`. Partially
    /// saved credentials in the directory are resumed by the library.
    async fn connect(
        &self,
        session_id: &SessionId,
        auth_dir: &Path,
        options: &ConnectOptions,
    ) -> anyhow::Result<ProtocolLink>;
}
