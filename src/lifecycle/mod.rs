//! Session lifecycle: creation, event forwarding and teardown.
//!
//! [`SessionManager`] ties the registry, credential store, login driver and
//! relay together. Every way a session can end (completion, failure, channel
//! disconnect, replacement, expiry, shutdown) converges on
//! [`SessionManager::teardown`], which runs at most once per session:
//!
//! 1. claim the session's resources (the first caller wins, later calls are no-ops)
//! 2. cancel a pending completion timer
//! 3. unbind the session from its channel
//! 4. stop the login driver (closes the protocol connection)
//! 5. destroy the credential directory
//! 6. delete the registry record, last, so lookups fail closed
//!
//! Teardown never returns an error; failures in individual steps are logged.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credentials::{CredentialHandle, CredentialStore};
use crate::login::{LoginDriver, LoginEvent};
use crate::metrics::{Metrics, TeardownCause};
use crate::protocol::{ConnectOptions, ProtocolClient, EVENT_CHANNEL_CAPACITY};
use crate::relay::{EventRelay, ServerMessage};
use crate::session::{
    ChannelId, FailureReason, LoginMode, SessionError, SessionId, SessionRegistry,
};

/// Live resources owned by one session until teardown claims them.
struct SessionResources {
    credentials: Option<CredentialHandle>,
    /// Cancels the delayed teardown scheduled after completion.
    completion: CancellationToken,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    credentials: Arc<CredentialStore>,
    driver: LoginDriver,
    relay: Arc<EventRelay>,
    metrics: Arc<Metrics>,
    resources: Mutex<HashMap<SessionId, SessionResources>>,
    completion_grace: Duration,
}

impl SessionManager {
    pub fn new(
        protocol: Arc<dyn ProtocolClient>,
        credentials: CredentialStore,
        connect_options: ConnectOptions,
        completion_grace: Duration,
        relay: Arc<EventRelay>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        let registry = Arc::new(SessionRegistry::new());
        let credentials = Arc::new(credentials);
        let driver = LoginDriver::new(
            protocol,
            Arc::clone(&credentials),
            Arc::clone(&registry),
            connect_options,
        );
        Arc::new(Self {
            registry,
            credentials,
            driver,
            relay,
            metrics,
            resources: Mutex::new(HashMap::new()),
            completion_grace,
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn relay(&self) -> &EventRelay {
        &self.relay
    }

    /// Live session count, for health reporting.
    pub fn count(&self) -> usize {
        self.registry.count()
    }

    /// Create a session for `channel_id` and start its login.
    ///
    /// A session the channel already owns is torn down first. On success the
    /// channel has been sent `session-created`; login events follow
    /// asynchronously. On failure the channel has been sent an `error`.
    pub async fn create_session(
        self: &Arc<Self>,
        channel_id: ChannelId,
        login_mode: LoginMode,
    ) -> Result<SessionId, SessionError> {
        if let Some(existing) = self.registry.get_by_channel(&channel_id) {
            tracing::info!(
                channel_id = %channel_id,
                session_id = %existing.id,
                "Replacing the channel's existing session"
            );
            self.teardown(&existing.id, TeardownCause::Replaced).await;
        }

        let session = match self.registry.create(channel_id, login_mode) {
            Ok(session) => session,
            Err(e) => {
                tracing::warn!(channel_id = %channel_id, error = %e, "Session creation rejected");
                self.relay
                    .send_to_channel(&channel_id, ServerMessage::failure(e.failure_reason()));
                return Err(e);
            }
        };
        let session_id = session.id;

        self.resources.lock().insert(
            session_id,
            SessionResources {
                credentials: None,
                completion: CancellationToken::new(),
            },
        );
        self.relay.bind(session_id, channel_id);
        self.metrics.session_created();
        tracing::info!(
            session_id = %session_id,
            channel_id = %channel_id,
            mode = session.login_mode.label(),
            "Session created"
        );

        let handle = match self.credentials.open(&session_id).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to open credential directory");
                self.fail(&session_id, e.failure_reason()).await;
                return Err(e);
            }
        };

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let started = {
            let mut resources = self.resources.lock();
            resources.get_mut(&session_id).map(|entry| {
                entry.credentials = Some(handle.clone());
                self.driver.start(&session, handle.clone(), events_tx)
            })
        };

        match started {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                tracing::error!(session_id = %session_id, error = %e, "Login driver refused to start");
                self.fail(&session_id, e.failure_reason()).await;
                return Err(e);
            }
            None => {
                // Torn down while the directory was being created.
                self.credentials.destroy(&handle).await;
                return Err(SessionError::NotFound(session_id));
            }
        }

        if !self
            .relay
            .send(&session_id, ServerMessage::SessionCreated { session_id })
        {
            tracing::info!(session_id = %session_id, "Channel gone before session-created");
            self.teardown(&session_id, TeardownCause::Undeliverable).await;
            return Err(SessionError::ChannelGone(channel_id));
        }
        tokio::spawn(Arc::clone(self).forward_events(session_id, events_rx));
        Ok(session_id)
    }

    /// The transport saw `channel_id` disconnect.
    pub async fn channel_closed(&self, channel_id: &ChannelId) {
        self.relay.unregister_channel(channel_id);
        if let Some(session) = self.registry.get_by_channel(channel_id) {
            tracing::info!(
                channel_id = %channel_id,
                session_id = %session.id,
                status = ?session.status,
                "Channel closed, tearing down its session"
            );
            self.teardown(&session.id, TeardownCause::ChannelClosed).await;
        }
    }

    /// Tear down every session at least `max_age` old. Returns how many
    /// were removed.
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        self.sweep_expired_at(max_age, Utc::now()).await
    }

    pub async fn sweep_expired_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        for session_id in self.registry.expired(max_age, now) {
            tracing::info!(session_id = %session_id, "Session expired");
            if self.teardown(&session_id, TeardownCause::Expired).await {
                removed += 1;
            }
        }
        removed
    }

    /// Tear down every live session.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<SessionId> = self.resources.lock().keys().copied().collect();
        let mut removed = 0;
        for session_id in ids {
            if self.teardown(&session_id, TeardownCause::Shutdown).await {
                removed += 1;
            }
        }
        tracing::info!(removed, "All sessions torn down");
        removed
    }

    /// Release everything the session owns. Returns `false` when another
    /// caller already did (or is doing) it.
    pub async fn teardown(&self, session_id: &SessionId, cause: TeardownCause) -> bool {
        let Some(resources) = self.resources.lock().remove(session_id) else {
            return false;
        };

        resources.completion.cancel();
        self.relay.unbind(session_id);
        self.driver.stop(session_id).await;
        if let Some(handle) = &resources.credentials {
            self.credentials.destroy(handle).await;
        }
        self.registry.delete(session_id);
        self.metrics.session_torn_down(cause);

        tracing::info!(session_id = %session_id, cause = %cause, "Session torn down");
        true
    }

    /// Report a terminal failure to the client, then tear down.
    async fn fail(&self, session_id: &SessionId, reason: FailureReason) {
        self.metrics.session_failed(reason);
        self.relay.send(session_id, ServerMessage::failure(reason));
        self.teardown(session_id, TeardownCause::Failed).await;
    }

    /// Relay the driver's events, in order, and react to terminal ones.
    async fn forward_events(self: Arc<Self>, session_id: SessionId, mut events: mpsc::Receiver<LoginEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LoginEvent::Failed(reason) => {
                    tracing::warn!(session_id = %session_id, reason = %reason, "Login failed");
                    self.fail(&session_id, reason).await;
                    return;
                }
                LoginEvent::Completed { .. } => {
                    self.metrics.session_completed();
                    let delivered = self.relay.send(&session_id, event.into());
                    tracing::info!(session_id = %session_id, delivered, "Session string generated");
                    if delivered {
                        self.finish_after_grace(&session_id).await;
                    } else {
                        self.teardown(&session_id, TeardownCause::Undeliverable).await;
                    }
                    return;
                }
                LoginEvent::QrReady { .. } | LoginEvent::PairingCodeReady { .. } => {
                    if !self.relay.send(&session_id, event.into()) {
                        tracing::info!(session_id = %session_id, "Client gone, abandoning login");
                        self.teardown(&session_id, TeardownCause::Undeliverable).await;
                        return;
                    }
                }
            }
        }
    }

    /// Give the client time to receive the session string, then tear down.
    /// Any earlier teardown cancels the wait.
    async fn finish_after_grace(&self, session_id: &SessionId) {
        let Some(token) = self
            .resources
            .lock()
            .get(session_id)
            .map(|r| r.completion.clone())
        else {
            return;
        };

        tokio::select! {
            () = token.cancelled() => {}
            () = tokio::time::sleep(self.completion_grace) => {
                self.teardown(session_id, TeardownCause::Completed).await;
            }
        }
    }
}

/// Periodically tear down sessions older than `session_timeout` until
/// `shutdown` is cancelled.
pub fn spawn_cleanup_scheduler(
    manager: Arc<SessionManager>,
    interval: Duration,
    session_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let removed = manager.sweep_expired(session_timeout).await;
                    if removed > 0 {
                        tracing::info!(removed, active = manager.count(), "Swept expired sessions");
                    }
                }
            }
        }
        tracing::debug!("Cleanup scheduler stopped");
    })
}

// ── Tests ───────────────────────────────────────────────────────
