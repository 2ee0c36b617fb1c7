//! In-memory session registry with a per-channel index.
//!
//! The registry's map is the only shared mutable structure in the service.
//! Reads (`get`, `count`) take a read lock and never wait behind network or
//! filesystem work: no lock is held across an `.await`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

use super::error::SessionError;

/// Shortest accepted pairing number (country code included).
const MIN_PHONE_DIGITS: usize = 10;

/// Longest accepted pairing number (E.164 limit).
const MAX_PHONE_DIGITS: usize = 15;

// ── Identifiers ─────────────────────────────────────────────────

/// Opaque session identifier (random 128-bit UUID, never reused).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier of one real-time client channel (one WebSocket connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// ── Session record ──────────────────────────────────────────────

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Record created, nothing opened yet.
    Pending,
    /// Credential directory open, protocol connection being established.
    Connecting,
    /// QR code or pairing code shown to the user.
    AwaitingUserAction,
    /// Session string delivered.
    Completed,
    /// Terminal failure.
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// How the user links the device. Fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LoginMode {
    Qr,
    PhonePairing { phone_number: String },
}

impl LoginMode {
    /// Pairing mode for a raw, user-typed phone number.
    pub fn phone_pairing(raw: &str) -> Result<Self, SessionError> {
        Ok(Self::PhonePairing {
            phone_number: normalize_phone_number(raw)?,
        })
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Qr => "qr",
            Self::PhonePairing { .. } => "phone_pairing",
        }
    }
}

/// Strip everything but digits and check the length (10–15 digits).
pub fn normalize_phone_number(raw: &str) -> Result<String, SessionError> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if (MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits.len()) {
        Ok(digits)
    } else {
        Err(SessionError::InvalidPhoneNumber(raw.to_string()))
    }
}

/// A lightweight session record.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: SessionId,
    pub channel_id: ChannelId,
    pub status: SessionStatus,
    pub login_mode: LoginMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Whether the session is at least `max_age` old at `now`.
    pub fn is_expired(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age.to_std().is_ok_and(|age| age >= max_age)
    }
}

// ── Registry ────────────────────────────────────────────────────

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, Session>,
    by_channel: HashMap<ChannelId, SessionId>,
}

/// Thread-safe store of live session records.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a `Pending` session owned by `channel_id`.
    ///
    /// Fails with [`SessionError::DuplicateChannel`] when the channel already
    /// owns a live session; the caller must tear that one down first.
    pub fn create(&self, channel_id: ChannelId, login_mode: LoginMode) -> Result<Session, SessionError> {
        self.create_at(channel_id, login_mode, Utc::now())
    }

    pub(crate) fn create_at(
        &self,
        channel_id: ChannelId,
        login_mode: LoginMode,
        now: DateTime<Utc>,
    ) -> Result<Session, SessionError> {
        let mut inner = self.inner.write();
        if inner.by_channel.contains_key(&channel_id) {
            return Err(SessionError::DuplicateChannel(channel_id));
        }

        let session = Session {
            id: SessionId::new(),
            channel_id,
            status: SessionStatus::Pending,
            login_mode,
            created_at: now,
            updated_at: now,
        };
        inner.by_channel.insert(channel_id, session.id);
        inner.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    pub fn get(&self, id: &SessionId) -> Result<Session, SessionError> {
        self.inner
            .read()
            .sessions
            .get(id)
            .cloned()
            .ok_or(SessionError::NotFound(*id))
    }

    pub fn get_by_channel(&self, channel_id: &ChannelId) -> Option<Session> {
        let inner = self.inner.read();
        inner
            .by_channel
            .get(channel_id)
            .and_then(|id| inner.sessions.get(id))
            .cloned()
    }

    /// Update a session's status. Returns `false` when the session is gone
    /// or already terminal (terminal statuses are never left).
    pub fn set_status(&self, id: &SessionId, status: SessionStatus) -> bool {
        let mut inner = self.inner.write();
        let Some(session) = inner.sessions.get_mut(id) else {
            return false;
        };
        if session.status.is_terminal() {
            tracing::debug!(
                session_id = %id,
                current = ?session.status,
                requested = ?status,
                "Ignoring status change on terminal session"
            );
            return false;
        }
        session.status = status;
        session.updated_at = Utc::now();
        true
    }

    /// Remove a session and its channel-index entry. Idempotent.
    pub fn delete(&self, id: &SessionId) -> Option<Session> {
        let mut inner = self.inner.write();
        let session = inner.sessions.remove(id)?;
        if inner.by_channel.get(&session.channel_id) == Some(id) {
            inner.by_channel.remove(&session.channel_id);
        }
        Some(session)
    }

    /// IDs of sessions at least `max_age` old at `now`.
    pub fn expired(&self, max_age: Duration, now: DateTime<Utc>) -> Vec<SessionId> {
        self.inner
            .read()
            .sessions
            .values()
            .filter(|s| s.is_expired(max_age, now))
            .map(|s| s.id)
            .collect()
    }

    /// IDs of every live session.
    pub fn ids(&self) -> Vec<SessionId> {
        self.inner.read().sessions.keys().copied().collect()
    }

    pub fn count(&self) -> usize {
        self.inner.read().sessions.len()
    }
}
