//! Scripted in-memory protocol client for tests.
//!
//! Every `connect` hands the test a [`ScriptedHandle`] through
//! [`ScriptedClient::next_connection`]; the test then pushes protocol events
//! and writes credential files exactly as the real library would.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    ConnectOptions, PairingCodeError, ProtocolClient, ProtocolConnection, ProtocolEvent,
    ProtocolLink, EVENT_CHANNEL_CAPACITY,
};
use crate::credentials::CREDS_FILE;
use crate::session::SessionId;

#[derive(Debug, Clone)]
pub enum PairingBehavior {
    Code(String),
    InvalidNumber,
}

#[derive(Default)]
pub struct ScriptedConnection {
    pairing: Mutex<Option<PairingBehavior>>,
    pairing_requests: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedConnection {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn pairing_requests(&self) -> Vec<String> {
        self.pairing_requests.lock().clone()
    }
}

#[async_trait]
impl ProtocolConnection for ScriptedConnection {
    async fn request_pairing_code(&self, phone_number: &str) -> Result<String, PairingCodeError> {
        self.pairing_requests.lock().push(phone_number.to_string());
        match self.pairing.lock().clone() {
            Some(PairingBehavior::Code(code)) => Ok(code),
            Some(PairingBehavior::InvalidNumber) => {
                Err(PairingCodeError::InvalidNumber(phone_number.to_string()))
            }
            None => Err(PairingCodeError::Other("no pairing behavior scripted".into())),
        }
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Test-side view of one opened connection.
pub struct ScriptedHandle {
    pub session_id: SessionId,
    pub auth_dir: PathBuf,
    pub connection: Arc<ScriptedConnection>,
    events: mpsc::Sender<ProtocolEvent>,
}

impl ScriptedHandle {
    /// Push an event as if the library emitted it. `false` once the driver
    /// stopped listening.
    pub async fn emit(&self, event: ProtocolEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Persist credentials the way the library does before reporting `open`.
    pub fn write_credentials(&self, value: &serde_json::Value) {
        std::fs::write(
            self.auth_dir.join(CREDS_FILE),
            serde_json::to_vec(value).unwrap(),
        )
        .unwrap();
    }
}

pub struct ScriptedClient {
    handles_tx: mpsc::UnboundedSender<ScriptedHandle>,
    handles_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ScriptedHandle>>,
    pairing: Mutex<Option<PairingBehavior>>,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Option<Duration>>,
    connects: AtomicUsize,
}

impl Default for ScriptedClient {
    fn default() -> Self {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        Self {
            handles_tx,
            handles_rx: tokio::sync::Mutex::new(handles_rx),
            pairing: Mutex::new(None),
            fail_connect: AtomicBool::new(false),
            connect_delay: Mutex::new(None),
            connects: AtomicUsize::new(0),
        }
    }
}

impl ScriptedClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_pairing(&self, behavior: PairingBehavior) {
        *self.pairing.lock() = Some(behavior);
    }

    pub fn fail_connects(&self) {
        self.fail_connect.store(true, Ordering::SeqCst);
    }

    pub fn delay_connects(&self, delay: Duration) {
        *self.connect_delay.lock() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Wait for the next opened connection.
    pub async fn next_connection(&self) -> ScriptedHandle {
        tokio::time::timeout(Duration::from_secs(5), self.handles_rx.lock().await.recv())
            .await
            .expect("timed out waiting for a protocol connection")
            .expect("scripted client dropped")
    }

    /// Like [`next_connection`](Self::next_connection), but `None` if no
    /// connection is opened within `within`.
    pub async fn try_next_connection(&self, within: Duration) -> Option<ScriptedHandle> {
        tokio::time::timeout(within, self.handles_rx.lock().await.recv())
            .await
            .ok()
            .flatten()
    }
}

#[async_trait]
impl ProtocolClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(
        &self,
        session_id: &SessionId,
        auth_dir: &Path,
        _options: &ConnectOptions,
    ) -> anyhow::Result<ProtocolLink> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            anyhow::bail!("scripted connect failure");
        }
        // The library creates its auth directory on connect.
        std::fs::create_dir_all(auth_dir)?;

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connection = Arc::new(ScriptedConnection {
            pairing: Mutex::new(self.pairing.lock().clone()),
            ..ScriptedConnection::default()
        });
        let _ = self.handles_tx.send(ScriptedHandle {
            session_id: *session_id,
            auth_dir: auth_dir.to_path_buf(),
            connection: Arc::clone(&connection),
            events: events_tx,
        });

        Ok(ProtocolLink {
            connection,
            events: events_rx,
        })
    }
}
