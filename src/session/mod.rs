//! Session records for the login relay.
//!
//! A session is the unit of lifecycle management: it is created when a
//! client asks for a login, carries the login mode and status, and is
//! removed for good when the session is torn down. The registry here only
//! tracks records; live resources (credential directory, protocol
//! connection) are owned by [`crate::lifecycle::SessionManager`].

pub mod error;
pub mod registry;

pub use error::{FailureReason, SessionError};
pub use registry::{
    normalize_phone_number, ChannelId, LoginMode, Session, SessionId, SessionRegistry,
    SessionStatus,
};
