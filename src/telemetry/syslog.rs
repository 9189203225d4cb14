//! Syslog integration for audit logging.

use std::sync::{Mutex, OnceLock};

use syslog::{Facility, Formatter3164};
use tracing::{debug, error};

use super::error::TelemetryError;
use super::events::AuditEvent;

/// Syslog tag for all audit events.
pub const SYSLOG_TAG: &str = "SHADOW_SHIELD";

/// Global audit logger instance.
static AUDIT_LOGGER: OnceLock<AuditLogger> = OnceLock::new();

/// Audit logger that writes JSON events to syslog.
///
/// The writer sits behind a mutex so the logger can live in a global and be
/// used from shared references.
pub struct AuditLogger {
    /// None for a null logger.
    writer: Option<Mutex<syslog::Logger<syslog::LoggerBackend, Formatter3164>>>,
}

impl AuditLogger {
    /// Connect to the local syslog daemon over its Unix socket.
    pub fn new() -> Result<Self, TelemetryError> {
        let formatter = Formatter3164 {
            facility: Facility::LOG_USER,
            hostname: None,
            process: SYSLOG_TAG.to_string(),
            pid: std::process::id(),
        };

        let writer = syslog::unix(formatter)
            .map_err(|e| TelemetryError::SyslogConnection(e.to_string()))?;

        debug!("Connected to syslog with tag '{}'", SYSLOG_TAG);
        Ok(Self {
            writer: Some(Mutex::new(writer)),
        })
    }

    /// Create a logger that discards all events.
    pub fn new_null() -> Self {
        Self { writer: None }
    }

    /// Log an audit event.
    pub fn log(&self, event: AuditEvent) {
        let Some(ref writer) = self.writer else {
            return;
        };

        let json = match serde_json::to_string(&event.with_timestamp()) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize audit event: {}", e);
                return;
            }
        };

        match writer.lock() {
            Ok(mut writer) => {
                if let Err(e) = writer.info(&json) {
                    error!("Failed to write to syslog: {}", e);
                }
            }
            Err(e) => error!("Failed to acquire syslog writer lock: {}", e),
        }
        debug!("Logged audit event: {}", json);
    }

    /// Check if this is a null logger.
    pub fn is_null(&self) -> bool {
        self.writer.is_none()
    }
}

/// Initialize the global audit logger with a syslog connection.
///
/// Returns an error if syslog is unreachable or if already initialized.
pub fn init_logger() -> Result<(), TelemetryError> {
    install(AuditLogger::new()?)
}

/// Initialize the global audit logger with a null logger.
pub fn init_null_logger() -> Result<(), TelemetryError> {
    install(AuditLogger::new_null())
}

fn install(logger: AuditLogger) -> Result<(), TelemetryError> {
    AUDIT_LOGGER
        .set(logger)
        .map_err(|_| TelemetryError::AlreadyInitialized)
}

/// Get the global audit logger.
///
/// # Errors
///
/// Returns error if no logger was initialized.
pub fn audit() -> Result<&'static AuditLogger, TelemetryError> {
    AUDIT_LOGGER.get().ok_or(TelemetryError::NotInitialized)
}

/// Get the global audit logger, if initialized.
pub fn try_audit() -> Option<&'static AuditLogger> {
    AUDIT_LOGGER.get()
}

/// Log an event through the global logger; a no-op before initialization.
pub fn record(event: AuditEvent) {
    if let Some(logger) = try_audit() {
        logger.log(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_syslog_tag() {
        assert_eq!(SYSLOG_TAG, "SHADOW_SHIELD");
    }

    #[test]
    fn test_null_logger_discards() {
        let logger = AuditLogger::new_null();
        assert!(logger.is_null());
        logger.log(AuditEvent::ConsentDeclined {
            context_id: Uuid::nil(),
            method: "POST".to_string(),
            url: "http://example.com/".to_string(),
        });
    }

    #[test]
    #[ignore = "Requires running syslog daemon"]
    fn test_logger_creation() {
        let logger = AuditLogger::new();
        assert!(logger.is_ok());
    }
}
