//! Relay server that drives a WhatsApp multi-device login over a WebSocket
//! channel and hands the browser back a reusable, base64-encoded session
//! string.

pub mod config;
pub mod credentials;
pub mod gateway;
pub mod lifecycle;
pub mod login;
pub mod metrics;
pub mod protocol;
pub mod qr;
pub mod relay;
pub mod session;
