//! Login driver: one protocol connection per session, driven through the
//! login handshake.
//!
//! ## State machine
//!
//! ```text
//! Pending ─▸ Connecting ─▸ AwaitingUserAction ─▸ Completed
//!                │                 │
//!                └────────┬────────┘
//!                         ▼
//!                       Failed
//! ```
//!
//! Every protocol event is translated into at most one [`LoginEvent`] on the
//! session's sink. The first terminal event (`Completed` or `Failed`) ends
//! the event pump, so nothing is emitted for a session after it.
//!
//! The driver never reconnects. A closed connection is a failed login; the
//! user starts over with a new session.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::credentials::{encode_session_string, CredentialHandle, CredentialStore};
use crate::protocol::{
    CloseReason, ConnectOptions, PairingCodeError, ProtocolClient, ProtocolConnection,
    ProtocolEvent, ProtocolLink,
};
use crate::session::{
    FailureReason, LoginMode, Session, SessionError, SessionId, SessionRegistry, SessionStatus,
};

/// Upper bound on closing a protocol connection during teardown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Normalized login event, in the core's vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginEvent {
    QrReady { data_url: String },
    PairingCodeReady { code: String },
    Completed { session_string: String },
    Failed(FailureReason),
}

impl LoginEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed(_))
    }

    fn status(&self) -> SessionStatus {
        match self {
            Self::QrReady { .. } | Self::PairingCodeReady { .. } => {
                SessionStatus::AwaitingUserAction
            }
            Self::Completed { .. } => SessionStatus::Completed,
            Self::Failed(_) => SessionStatus::Failed,
        }
    }
}

/// Ordered outbound queue for one session's login events.
pub type EventSink = mpsc::Sender<LoginEvent>;

enum Slot {
    /// `connect` in flight; no handle yet.
    Connecting {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    Live {
        connection: Arc<dyn ProtocolConnection>,
        pump: JoinHandle<()>,
    },
}

struct PumpContext {
    session_id: SessionId,
    login_mode: LoginMode,
    handle: CredentialHandle,
    credentials: Arc<CredentialStore>,
    registry: Arc<SessionRegistry>,
}

type Slots = Arc<Mutex<HashMap<SessionId, Slot>>>;

/// Owns every live protocol connection, at most one per session.
pub struct LoginDriver {
    protocol: Arc<dyn ProtocolClient>,
    credentials: Arc<CredentialStore>,
    registry: Arc<SessionRegistry>,
    options: ConnectOptions,
    slots: Slots,
}

impl LoginDriver {
    pub fn new(
        protocol: Arc<dyn ProtocolClient>,
        credentials: Arc<CredentialStore>,
        registry: Arc<SessionRegistry>,
        options: ConnectOptions,
    ) -> Self {
        Self {
            protocol,
            credentials,
            registry,
            options,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of sessions with a connection open or opening.
    pub fn active_connections(&self) -> usize {
        self.slots.lock().len()
    }

    /// Claim the session's slot and open its protocol connection in the
    /// background, translating its events onto `emit`.
    ///
    /// The slot is taken before this returns, so a `stop` issued right after
    /// always wins over the connect still in flight. Setup failures are
    /// reported as `Failed(SetupError)` on `emit`, not as an `Err`; the only
    /// error is starting a session twice.
    pub fn start(
        &self,
        session: &Session,
        handle: CredentialHandle,
        emit: EventSink,
    ) -> Result<(), SessionError> {
        let session_id = session.id;
        let mut slots = self.slots.lock();
        if slots.contains_key(&session_id) {
            return Err(SessionError::AlreadyStarted(session_id));
        }

        self.registry
            .set_status(&session_id, SessionStatus::Connecting);
        tracing::info!(
            session_id = %session_id,
            mode = session.login_mode.label(),
            protocol = self.protocol.name(),
            "Opening protocol connection"
        );

        let ctx = PumpContext {
            session_id,
            login_mode: session.login_mode.clone(),
            handle,
            credentials: Arc::clone(&self.credentials),
            registry: Arc::clone(&self.registry),
        };
        let cancel = CancellationToken::new();
        // Spawned under the lock: the task cannot look at its slot before
        // the slot exists.
        let task = tokio::spawn(connect_and_pump(
            Arc::clone(&self.protocol),
            self.options.clone(),
            Arc::clone(&self.slots),
            cancel.clone(),
            ctx,
            emit,
        ));
        slots.insert(session_id, Slot::Connecting { cancel, task });
        Ok(())
    }

    /// Close the session's connection (if any) and drop its event bindings.
    /// Idempotent; safe before the connection ever opened.
    pub async fn stop(&self, session_id: &SessionId) {
        let slot = self.slots.lock().remove(session_id);
        match slot {
            Some(Slot::Live { connection, pump }) => {
                pump.abort();
                close_bounded(session_id, connection.as_ref()).await;
                tracing::debug!(session_id = %session_id, "Protocol connection stopped");
            }
            Some(Slot::Connecting { cancel, task }) => {
                // Either the connect is dropped unfinished, or the task sees
                // its slot gone and closes the new handle. Both happen before
                // this returns.
                cancel.cancel();
                if tokio::time::timeout(CLOSE_TIMEOUT * 2, task).await.is_err() {
                    tracing::warn!(session_id = %session_id, "Connect task did not stop in time");
                }
                tracing::debug!(session_id = %session_id, "Stop requested while connecting");
            }
            None => {}
        }
    }
}

async fn connect_and_pump(
    protocol: Arc<dyn ProtocolClient>,
    options: ConnectOptions,
    slots: Slots,
    cancel: CancellationToken,
    ctx: PumpContext,
    emit: EventSink,
) {
    let session_id = ctx.session_id;
    let connect = tokio::time::timeout(
        options.connect_timeout,
        protocol.connect(&session_id, ctx.handle.dir(), &options),
    );
    let connected = tokio::select! {
        biased;
        () = cancel.cancelled() => {
            tracing::debug!(session_id = %session_id, "Connect abandoned");
            return;
        }
        result = connect => result.unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "connect timed out after {}ms",
                options.connect_timeout.as_millis()
            ))
        }),
    };

    let link = match connected {
        Ok(link) => link,
        Err(e) => {
            let still_wanted = matches!(
                slots.lock().remove(&session_id),
                Some(Slot::Connecting { .. })
            );
            if still_wanted {
                tracing::warn!(session_id = %session_id, error = %e, "Protocol connection setup failed");
                ctx.registry.set_status(&session_id, SessionStatus::Failed);
                let _ = emit.send(LoginEvent::Failed(FailureReason::SetupError)).await;
            }
            return;
        }
    };

    let ProtocolLink { connection, events } = link;
    let installed = {
        let mut slots = slots.lock();
        if matches!(slots.get(&session_id), Some(Slot::Connecting { .. })) {
            let pump = tokio::spawn(run_pump(ctx, Arc::clone(&connection), events, emit));
            slots.insert(
                session_id,
                Slot::Live {
                    connection: Arc::clone(&connection),
                    pump,
                },
            );
            true
        } else {
            false
        }
    };

    if !installed {
        // Stopped while connecting: the handle must not outlive the session.
        tracing::debug!(session_id = %session_id, "Session stopped during connect, closing new connection");
        close_bounded(&session_id, connection.as_ref()).await;
    }
}

async fn close_bounded(session_id: &SessionId, connection: &dyn ProtocolConnection) {
    if tokio::time::timeout(CLOSE_TIMEOUT, connection.close())
        .await
        .is_err()
    {
        tracing::warn!(session_id = %session_id, "Protocol connection did not close in time");
    }
}

async fn run_pump(
    ctx: PumpContext,
    connection: Arc<dyn ProtocolConnection>,
    mut events: mpsc::Receiver<ProtocolEvent>,
    emit: EventSink,
) {
    let mut pairing_requested = false;

    while let Some(event) = events.recv().await {
        let translated =
            translate(&ctx, connection.as_ref(), event, &mut pairing_requested).await;
        let Some(login_event) = translated else {
            continue;
        };

        let terminal = login_event.is_terminal();
        ctx.registry
            .set_status(&ctx.session_id, login_event.status());
        if emit.send(login_event).await.is_err() {
            tracing::debug!(session_id = %ctx.session_id, "Event sink dropped, ending pump");
            return;
        }
        if terminal {
            return;
        }
    }

    // Event stream ended without a close or open.
    tracing::warn!(session_id = %ctx.session_id, "Protocol event stream ended unexpectedly");
    ctx.registry
        .set_status(&ctx.session_id, SessionStatus::Failed);
    let _ = emit
        .send(LoginEvent::Failed(FailureReason::ConnectionLost))
        .await;
}

async fn translate(
    ctx: &PumpContext,
    connection: &dyn ProtocolConnection,
    event: ProtocolEvent,
    pairing_requested: &mut bool,
) -> Option<LoginEvent> {
    let session_id = &ctx.session_id;
    match event {
        ProtocolEvent::Qr(text) => {
            if !matches!(ctx.login_mode, LoginMode::Qr) {
                tracing::debug!(session_id = %session_id, "Ignoring QR in pairing mode");
                return None;
            }
            let rendered =
                tokio::task::spawn_blocking(move || crate::qr::render_data_url(&text)).await;
            match rendered {
                Ok(Ok(data_url)) => {
                    tracing::info!(session_id = %session_id, "QR code generated");
                    Some(LoginEvent::QrReady { data_url })
                }
                Ok(Err(e)) => {
                    tracing::error!(session_id = %session_id, error = %e, "QR rendering failed");
                    Some(LoginEvent::Failed(FailureReason::SetupError))
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "QR rendering task failed");
                    Some(LoginEvent::Failed(FailureReason::SetupError))
                }
            }
        }

        ProtocolEvent::PairingCodeRequested => {
            let LoginMode::PhonePairing { phone_number } = &ctx.login_mode else {
                tracing::debug!(session_id = %session_id, "Ignoring pairing prompt in QR mode");
                return None;
            };
            if *pairing_requested {
                return None;
            }
            *pairing_requested = true;

            match connection.request_pairing_code(phone_number).await {
                Ok(code) => {
                    tracing::info!(session_id = %session_id, "Pairing code generated");
                    Some(LoginEvent::PairingCodeReady { code })
                }
                Err(PairingCodeError::InvalidNumber(detail)) => {
                    tracing::info!(session_id = %session_id, detail = %detail, "Phone number rejected");
                    Some(LoginEvent::Failed(FailureReason::InvalidPhoneNumber))
                }
                Err(e) => {
                    tracing::warn!(session_id = %session_id, error = %e, "Pairing code request failed");
                    Some(LoginEvent::Failed(FailureReason::SetupError))
                }
            }
        }

        ProtocolEvent::Open => {
            tracing::info!(session_id = %session_id, "Handshake complete, reading credentials");
            Some(match ctx.credentials.read_back(&ctx.handle).await {
                Ok(Some(creds)) => match encode_session_string(&creds) {
                    Ok(session_string) => LoginEvent::Completed { session_string },
                    Err(e) => {
                        tracing::error!(session_id = %session_id, error = %e, "Failed to encode session string");
                        LoginEvent::Failed(FailureReason::CredentialReadError)
                    }
                },
                Ok(None) => {
                    tracing::error!(session_id = %session_id, "Handshake reported open but no credentials were saved");
                    LoginEvent::Failed(FailureReason::CredentialReadError)
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "Failed to read credentials");
                    LoginEvent::Failed(FailureReason::CredentialReadError)
                }
            })
        }

        ProtocolEvent::Close(reason) => {
            tracing::info!(session_id = %session_id, reason = ?reason, "Protocol connection closed");
            Some(LoginEvent::Failed(match reason {
                CloseReason::LoggedOut => FailureReason::LoggedOut,
                CloseReason::Other { .. } => FailureReason::ConnectionLost,
            }))
        }

        ProtocolEvent::CredentialsUpdated => {
            tracing::trace!(session_id = %session_id, "Credentials persisted by protocol library");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::decode_session_string;
    use crate::protocol::testing::{PairingBehavior, ScriptedClient};
    use crate::session::ChannelId;
    use serde_json::json;

    struct Fixture {
        _tmp: tempfile::TempDir,
        client: Arc<ScriptedClient>,
        credentials: Arc<CredentialStore>,
        registry: Arc<SessionRegistry>,
        driver: LoginDriver,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let client = ScriptedClient::new();
        let credentials = Arc::new(CredentialStore::new(tmp.path()));
        let registry = Arc::new(SessionRegistry::new());
        let driver = LoginDriver::new(
            client.clone(),
            Arc::clone(&credentials),
            Arc::clone(&registry),
            ConnectOptions {
                connect_timeout: Duration::from_millis(500),
                ..ConnectOptions::default()
            },
        );
        Fixture {
            _tmp: tmp,
            client,
            credentials,
            registry,
            driver,
        }
    }

    async fn started(
        f: &Fixture,
        mode: LoginMode,
    ) -> (Session, mpsc::Receiver<LoginEvent>) {
        let session = f.registry.create(ChannelId::new(), mode).unwrap();
        let handle = f.credentials.open(&session.id).await.unwrap();
        let (tx, rx) = mpsc::channel(16);
        f.driver.start(&session, handle, tx).unwrap();
        (session, rx)
    }

    async fn recv(rx: &mut mpsc::Receiver<LoginEvent>) -> LoginEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for login event")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn qr_refreshes_are_emitted_in_order() {
        let f = fixture();
        let (session, mut rx) = started(&f, LoginMode::Qr).await;
        let conn = f.client.next_connection().await;
        assert_eq!(conn.session_id, session.id);

        assert!(conn.emit(ProtocolEvent::Qr("first".into())).await);
        assert!(conn.emit(ProtocolEvent::Qr("second".into())).await);

        let first = recv(&mut rx).await;
        let second = recv(&mut rx).await;
        assert_eq!(
            first,
            LoginEvent::QrReady {
                data_url: crate::qr::render_data_url("first").unwrap()
            }
        );
        assert_eq!(
            second,
            LoginEvent::QrReady {
                data_url: crate::qr::render_data_url("second").unwrap()
            }
        );
        assert_eq!(
            f.registry.get(&session.id).unwrap().status,
            SessionStatus::AwaitingUserAction
        );
    }

    #[tokio::test]
    async fn pairing_code_is_passed_through_verbatim() {
        let f = fixture();
        f.client.set_pairing(PairingBehavior::Code("K7QP-2XWM".into()));
        let (_session, mut rx) = started(
            &f,
            LoginMode::PhonePairing {
                phone_number: "2347012345678".into(),
            },
        )
        .await;
        let conn = f.client.next_connection().await;

        conn.emit(ProtocolEvent::PairingCodeRequested).await;
        assert_eq!(
            recv(&mut rx).await,
            LoginEvent::PairingCodeReady {
                code: "K7QP-2XWM".into()
            }
        );
        assert_eq!(conn.connection.pairing_requests(), vec!["2347012345678"]);
    }

    #[tokio::test]
    async fn pairing_code_is_requested_once() {
        let f = fixture();
        f.client.set_pairing(PairingBehavior::Code("AAAA-BBBB".into()));
        let (_session, mut rx) = started(
            &f,
            LoginMode::PhonePairing {
                phone_number: "2347012345678".into(),
            },
        )
        .await;
        let conn = f.client.next_connection().await;

        conn.emit(ProtocolEvent::PairingCodeRequested).await;
        conn.emit(ProtocolEvent::PairingCodeRequested).await;
        conn.emit(ProtocolEvent::Close(CloseReason::Other { status_code: Some(408) }))
            .await;

        assert!(matches!(recv(&mut rx).await, LoginEvent::PairingCodeReady { .. }));
        assert_eq!(
            recv(&mut rx).await,
            LoginEvent::Failed(FailureReason::ConnectionLost)
        );
        assert_eq!(conn.connection.pairing_requests().len(), 1);
    }

    #[tokio::test]
    async fn rejected_number_fails_without_retry() {
        let f = fixture();
        f.client.set_pairing(PairingBehavior::InvalidNumber);
        let (session, mut rx) = started(
            &f,
            LoginMode::PhonePairing {
                phone_number: "0000000000".into(),
            },
        )
        .await;
        let conn = f.client.next_connection().await;

        conn.emit(ProtocolEvent::PairingCodeRequested).await;
        assert_eq!(
            recv(&mut rx).await,
            LoginEvent::Failed(FailureReason::InvalidPhoneNumber)
        );
        assert_eq!(
            f.registry.get(&session.id).unwrap().status,
            SessionStatus::Failed
        );
        // Pump is done: the sink is closed once the pump exits.
        assert!(rx.recv().await.is_none());
        assert_eq!(conn.connection.pairing_requests().len(), 1);
    }

    #[tokio::test]
    async fn qr_ignored_in_pairing_mode_and_pairing_ignored_in_qr_mode() {
        let f = fixture();
        let (_s, mut rx) = started(&f, LoginMode::Qr).await;
        let conn = f.client.next_connection().await;
        conn.emit(ProtocolEvent::PairingCodeRequested).await;
        conn.emit(ProtocolEvent::CredentialsUpdated).await;
        conn.emit(ProtocolEvent::Close(CloseReason::LoggedOut)).await;
        assert_eq!(recv(&mut rx).await, LoginEvent::Failed(FailureReason::LoggedOut));

        f.client.set_pairing(PairingBehavior::Code("X".into()));
        let (_s, mut rx) = started(
            &f,
            LoginMode::PhonePairing {
                phone_number: "2347012345678".into(),
            },
        )
        .await;
        let conn = f.client.next_connection().await;
        conn.emit(ProtocolEvent::Qr("ignored".into())).await;
        conn.emit(ProtocolEvent::PairingCodeRequested).await;
        assert_eq!(
            recv(&mut rx).await,
            LoginEvent::PairingCodeReady { code: "X".into() }
        );
    }

    #[tokio::test]
    async fn open_reads_back_and_encodes_credentials() {
        let f = fixture();
        let (session, mut rx) = started(&f, LoginMode::Qr).await;
        let conn = f.client.next_connection().await;

        let creds = json!({ "me": { "id": "2347012345678:3@s.whatsapp.net" }, "registered": true });
        conn.write_credentials(&creds);
        conn.emit(ProtocolEvent::Open).await;

        match recv(&mut rx).await {
            LoginEvent::Completed { session_string } => {
                assert_eq!(decode_session_string(&session_string).unwrap().0, creds);
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(
            f.registry.get(&session.id).unwrap().status,
            SessionStatus::Completed
        );

        // Terminal: a late close is not emitted.
        conn.emit(ProtocolEvent::Close(CloseReason::Other { status_code: Some(515) }))
            .await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn open_without_credentials_fails() {
        let f = fixture();
        let (_session, mut rx) = started(&f, LoginMode::Qr).await;
        let conn = f.client.next_connection().await;

        conn.emit(ProtocolEvent::Open).await;
        assert_eq!(
            recv(&mut rx).await,
            LoginEvent::Failed(FailureReason::CredentialReadError)
        );
    }

    #[tokio::test]
    async fn connect_failure_is_setup_error() {
        let f = fixture();
        f.client.fail_connects();
        let (session, mut rx) = started(&f, LoginMode::Qr).await;

        assert_eq!(
            recv(&mut rx).await,
            LoginEvent::Failed(FailureReason::SetupError)
        );
        assert_eq!(f.driver.active_connections(), 0);
        assert_eq!(
            f.registry.get(&session.id).unwrap().status,
            SessionStatus::Failed
        );
    }

    #[tokio::test]
    async fn connect_timeout_is_setup_error() {
        let f = fixture();
        f.client.delay_connects(Duration::from_secs(5));
        let (_session, mut rx) = started(&f, LoginMode::Qr).await;

        assert_eq!(
            recv(&mut rx).await,
            LoginEvent::Failed(FailureReason::SetupError)
        );
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let f = fixture();
        let (session, _rx) = started(&f, LoginMode::Qr).await;
        let _conn = f.client.next_connection().await;

        let handle = f.credentials.open(&session.id).await.unwrap();
        let (tx, _rx2) = mpsc::channel(1);
        assert!(matches!(
            f.driver.start(&session, handle, tx),
            Err(SessionError::AlreadyStarted(_))
        ));
        assert_eq!(f.client.connect_count(), 1);
    }

    #[tokio::test]
    async fn stop_closes_connection_and_silences_events() {
        let f = fixture();
        let (session, mut rx) = started(&f, LoginMode::Qr).await;
        let conn = f.client.next_connection().await;
        conn.emit(ProtocolEvent::Qr("live".into())).await;
        assert!(matches!(recv(&mut rx).await, LoginEvent::QrReady { .. }));
        assert_eq!(f.driver.active_connections(), 1);

        f.driver.stop(&session.id).await;
        assert!(conn.connection.is_closed());
        assert_eq!(f.driver.active_connections(), 0);

        // Handlers are released: further events go nowhere.
        conn.emit(ProtocolEvent::Qr("late".into())).await;
        assert!(rx.recv().await.is_none());

        // Idempotent.
        f.driver.stop(&session.id).await;
        assert_eq!(conn.connection.close_calls(), 1);
    }

    #[tokio::test]
    async fn stop_during_connect_abandons_the_connect() {
        let f = fixture();
        f.client.delay_connects(Duration::from_millis(300));
        let session = f.registry.create(ChannelId::new(), LoginMode::Qr).unwrap();
        let handle = f.credentials.open(&session.id).await.unwrap();
        let (tx, mut rx) = mpsc::channel(4);

        f.driver.start(&session, handle, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.client.connect_count(), 1);

        f.driver.stop(&session.id).await;
        assert_eq!(f.driver.active_connections(), 0);
        // The connect task is gone once stop returns.
        assert!(rx.recv().await.is_none());
        // No connection is ever handed out for the stopped session.
        assert!(f
            .client
            .try_next_connection(Duration::from_millis(600))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn stop_right_after_connect_closes_the_new_handle() {
        let f = fixture();
        let session = f.registry.create(ChannelId::new(), LoginMode::Qr).unwrap();
        let handle = f.credentials.open(&session.id).await.unwrap();
        let (tx, _rx) = mpsc::channel(4);

        f.driver.start(&session, handle, tx).unwrap();
        f.driver.stop(&session.id).await;
        assert_eq!(f.driver.active_connections(), 0);

        // Whether or not the connect finished first, nothing stays open.
        if let Some(conn) = f.client.try_next_connection(Duration::from_millis(100)).await {
            assert!(conn.connection.is_closed());
        }
    }
}
