//! Prometheus counters for the session lifecycle, served at `GET /metrics`.

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::session::FailureReason;

/// Why a session was torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownCause {
    Completed,
    Failed,
    ChannelClosed,
    Replaced,
    Expired,
    Undeliverable,
    Shutdown,
}

impl TeardownCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::ChannelClosed => "channel_closed",
            Self::Replaced => "replaced",
            Self::Expired => "expired",
            Self::Undeliverable => "undeliverable",
            Self::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct Metrics {
    registry: Registry,
    active: IntGauge,
    created: IntCounter,
    completed: IntCounter,
    failed: IntCounterVec,
    teardowns: IntCounterVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let active = IntGauge::new("sumo_sessions_active", "Sessions currently live")?;
        let created = IntCounter::new("sumo_sessions_created_total", "Sessions created")?;
        let completed = IntCounter::new(
            "sumo_sessions_completed_total",
            "Sessions that delivered a session string",
        )?;
        let failed = IntCounterVec::new(
            Opts::new("sumo_sessions_failed_total", "Sessions that ended in failure"),
            &["reason"],
        )?;
        let teardowns = IntCounterVec::new(
            Opts::new("sumo_session_teardowns_total", "Session teardowns by cause"),
            &["cause"],
        )?;

        registry.register(Box::new(active.clone()))?;
        registry.register(Box::new(created.clone()))?;
        registry.register(Box::new(completed.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(teardowns.clone()))?;

        Ok(Self {
            registry,
            active,
            created,
            completed,
            failed,
            teardowns,
        })
    }

    pub fn session_created(&self) {
        self.created.inc();
        self.active.inc();
    }

    pub fn session_completed(&self) {
        self.completed.inc();
    }

    pub fn session_failed(&self, reason: FailureReason) {
        self.failed.with_label_values(&[reason.as_str()]).inc();
    }

    pub fn session_torn_down(&self, cause: TeardownCause) {
        self.teardowns.with_label_values(&[cause.as_str()]).inc();
        self.active.dec();
    }

    pub fn active_sessions(&self) -> i64 {
        self.active.get()
    }

    /// Text exposition format.
    pub fn render(&self) -> String {
        TextEncoder::new()
            .encode_to_string(&self.registry.gather())
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Failed to encode metrics");
                String::new()
            })
    }
}
