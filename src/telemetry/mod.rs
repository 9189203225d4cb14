//! Audit logging for shadow-shield.
//!
//! - **Audit logging** (syslog): what the pipeline did to user traffic, as
//!   JSON events tagged `SHADOW_SHIELD`
//! - **Debug logging** (tracing): diagnostics on stderr
//!
//! The two are separate. Audit events never contain bodies.
//!
//! # Event Format
//!
//! ```json
//! {"ts":"2026-01-07T14:32:01Z","event":"body_sanitized","context_id":"...","method":"POST","url":"http://chat.example.com/api"}
//! ```

mod error;
mod events;
mod syslog;

pub use error::TelemetryError;
pub use events::{AuditEvent, TimestampedEvent};
pub use syslog::{
    AuditLogger, SYSLOG_TAG, audit, init_logger, init_null_logger, record, try_audit,
};
