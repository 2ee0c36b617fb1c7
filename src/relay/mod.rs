//! Event relay: routes a session's events to the one client channel that
//! owns it.
//!
//! Each connected client registers an unbounded outbound queue. A session is
//! bound to its channel at creation and unbound at teardown; sends for an
//! unbound session, or to a channel that has gone away, are dropped and
//! reported as undeliverable.

pub mod events;

use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::mpsc;

use crate::session::{ChannelId, SessionId};

pub use events::{ClientMessage, ServerMessage, UNSUPPORTED_REQUEST};

#[derive(Default)]
pub struct EventRelay {
    channels: RwLock<HashMap<ChannelId, mpsc::UnboundedSender<ServerMessage>>>,
    bindings: RwLock<HashMap<SessionId, ChannelId>>,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected client. Messages for it arrive, in send order,
    /// on the returned receiver.
    pub fn register_channel(&self, channel_id: ChannelId) -> mpsc::UnboundedReceiver<ServerMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.write().insert(channel_id, tx);
        rx
    }

    /// Forget a disconnected client. Later sends to it are dropped.
    pub fn unregister_channel(&self, channel_id: &ChannelId) {
        self.channels.write().remove(channel_id);
    }

    pub fn bind(&self, session_id: SessionId, channel_id: ChannelId) {
        self.bindings.write().insert(session_id, channel_id);
    }

    pub fn unbind(&self, session_id: &SessionId) {
        self.bindings.write().remove(session_id);
    }

    /// Deliver `message` to the channel bound to `session_id`.
    /// `false` when there is no binding or the channel is gone.
    pub fn send(&self, session_id: &SessionId, message: ServerMessage) -> bool {
        let Some(channel_id) = self.bindings.read().get(session_id).copied() else {
            tracing::debug!(session_id = %session_id, "Dropping event for unbound session");
            return false;
        };
        self.send_to_channel(&channel_id, message)
    }

    /// Deliver `message` to a channel directly (replies not tied to a session).
    pub fn send_to_channel(&self, channel_id: &ChannelId, message: ServerMessage) -> bool {
        let channels = self.channels.read();
        match channels.get(channel_id) {
            Some(tx) => tx.send(message).is_ok(),
            None => {
                tracing::debug!(channel_id = %channel_id, "Dropping event for disconnected channel");
                false
            }
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

// ── Tests ───────────────────────────────────────────────────────
