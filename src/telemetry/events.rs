//! Audit event types for structured logging.
//!
//! These events are logged to syslog with the `SHADOW_SHIELD` tag. They
//! never carry request or response bodies.

use crate::intercept::{ProtectionMode, StatsSnapshot};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Audit events emitted by the interception pipeline and its host.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// Host started.
    SessionStart {
        /// User running the host.
        user: String,
        /// Address the proxy listens on.
        listen: String,
        /// Default protection mode.
        mode: ProtectionMode,
        /// Process ID.
        pid: u32,
    },

    /// Host stopped.
    SessionEnd {
        /// User who ran the host.
        user: String,
        /// Duration of the session in seconds.
        duration_sec: u64,
        /// Totals across every context of the session.
        totals: StatsSnapshot,
    },

    /// Hooks installed into a browsing context.
    ContextInstalled {
        /// Context identity.
        context_id: Uuid,
        /// Context label.
        label: String,
        /// Mode read at install time.
        mode: ProtectionMode,
        /// Whether responses are rehydrated.
        rehydrate: bool,
    },

    /// A sanitized body replaced the original.
    BodySanitized {
        /// Context identity.
        context_id: Uuid,
        /// HTTP method.
        method: String,
        /// Target URL.
        url: String,
    },

    /// The user kept the original body.
    ConsentDeclined {
        /// Context identity.
        context_id: Uuid,
        /// HTTP method.
        method: String,
        /// Target URL.
        url: String,
    },

    /// The classifier could not be used; the original body was sent.
    ScanUnavailable {
        /// Context identity.
        context_id: Uuid,
        /// Target URL.
        url: String,
        /// What went wrong.
        reason: String,
    },

    /// Tokens in a response were replaced with real values.
    Rehydrated {
        /// Context identity.
        context_id: Uuid,
        /// URL the response came from.
        url: String,
        /// Number of tokens replaced.
        replaced: u64,
    },

    /// The vault could not be used; the original response was returned.
    RehydrationUnavailable {
        /// Context identity.
        context_id: Uuid,
        /// URL the response came from.
        url: String,
        /// What went wrong.
        reason: String,
    },
}

/// Wrapper for serializing events with timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct TimestampedEvent<'a> {
    /// ISO8601 timestamp.
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,

    /// The actual event (flattened into this struct).
    #[serde(flatten)]
    pub event: &'a AuditEvent,
}

impl AuditEvent {
    /// Wrap this event with a timestamp for serialization.
    pub fn with_timestamp(&self) -> TimestampedEvent<'_> {
        TimestampedEvent {
            timestamp: Utc::now(),
            event: self,
        }
    }
}
