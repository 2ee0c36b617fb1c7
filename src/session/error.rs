use std::path::PathBuf;

use serde::Serialize;

use super::registry::{ChannelId, SessionId};

/// Errors returned by session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("channel {0} already owns a live session")]
    DuplicateChannel(ChannelId),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("channel {0} is no longer connected")]
    ChannelGone(ChannelId),

    #[error("invalid phone number: {0:?}")]
    InvalidPhoneNumber(String),

    #[error("login already started for session {0}")]
    AlreadyStarted(SessionId),

    #[error("credential directory {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    /// Terminal failure this error surfaces as on the client channel.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::InvalidPhoneNumber(_) => FailureReason::InvalidPhoneNumber,
            Self::Io { .. } => FailureReason::IoError,
            Self::DuplicateChannel(_)
            | Self::NotFound(_)
            | Self::ChannelGone(_)
            | Self::AlreadyStarted(_) => FailureReason::SetupError,
        }
    }
}

/// Why a session ended without producing a session string.
///
/// Every variant is terminal. Nothing is retried: the client has to go back
/// to method selection and start a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The pairing number was malformed or rejected by the protocol library.
    InvalidPhoneNumber,
    /// The account explicitly revoked the link.
    LoggedOut,
    /// Any other closure of the protocol connection.
    ConnectionLost,
    /// The handshake succeeded but no credentials could be read back.
    CredentialReadError,
    /// Connection setup failed (exception, timeout, QR rendering).
    SetupError,
    /// Local filesystem failure.
    IoError,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidPhoneNumber => "invalid_phone_number",
            Self::LoggedOut => "logged_out",
            Self::ConnectionLost => "connection_lost",
            Self::CredentialReadError => "credential_read_error",
            Self::SetupError => "setup_error",
            Self::IoError => "io_error",
        }
    }

    /// Short, non-technical message shown to the user.
    pub fn user_message(self) -> &'static str {
        match self {
            Self::InvalidPhoneNumber => {
                "Invalid phone number. Include your country code (e.g., 2347012345678) and try again."
            }
            Self::LoggedOut => "Logged out. Please start again.",
            Self::ConnectionLost => "Connection failed. Please try again.",
            Self::CredentialReadError => "Failed to generate session. Please try again.",
            Self::SetupError | Self::IoError => "Failed to create session. Please try again.",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
