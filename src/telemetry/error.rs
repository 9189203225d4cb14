//! Telemetry error types.

use thiserror::Error;

/// Errors that can occur during telemetry operations.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to connect to syslog.
    #[error("Failed to connect to syslog: {0}")]
    SyslogConnection(String),

    /// Logger not initialized.
    #[error("Audit logger not initialized")]
    NotInitialized,

    /// Logger already initialized.
    #[error("Audit logger already initialized")]
    AlreadyInitialized,
}
