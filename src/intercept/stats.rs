//! Per-installation interception counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by the pipeline of one context.
#[derive(Debug, Default)]
pub struct InterceptStats {
    intercepted: AtomicU64,
    bypassed: AtomicU64,
    scanned: AtomicU64,
    sanitized: AtomicU64,
    declined: AtomicU64,
    scan_failures: AtomicU64,
    rehydrated: AtomicU64,
    rehydration_failures: AtomicU64,
}

/// Point-in-time copy of [`InterceptStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Calls that entered a wrapped primitive.
    pub intercepted: u64,
    /// Calls that skipped scanning for any reason.
    pub bypassed: u64,
    /// Bodies sent to the classifier.
    pub scanned: u64,
    /// Bodies dispatched in sanitized form.
    pub sanitized: u64,
    /// Sanitized bodies the user declined.
    pub declined: u64,
    /// Scans that failed open.
    pub scan_failures: u64,
    /// Responses rebuilt with real values.
    pub rehydrated: u64,
    /// Rehydration attempts where the vault was unavailable.
    pub rehydration_failures: u64,
}

impl StatsSnapshot {
    /// Add another snapshot into this one.
    pub fn merge(&mut self, other: &StatsSnapshot) {
        self.intercepted += other.intercepted;
        self.bypassed += other.bypassed;
        self.scanned += other.scanned;
        self.sanitized += other.sanitized;
        self.declined += other.declined;
        self.scan_failures += other.scan_failures;
        self.rehydrated += other.rehydrated;
        self.rehydration_failures += other.rehydration_failures;
    }
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl InterceptStats {
            $(
                pub(crate) fn $name(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    record_intercepted => intercepted,
    record_bypassed => bypassed,
    record_scanned => scanned,
    record_sanitized => sanitized,
    record_declined => declined,
    record_scan_failure => scan_failures,
    record_rehydrated => rehydrated,
    record_rehydration_failure => rehydration_failures,
}

impl InterceptStats {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy the current values.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            intercepted: self.intercepted.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            sanitized: self.sanitized.load(Ordering::Relaxed),
            declined: self.declined.load(Ordering::Relaxed),
            scan_failures: self.scan_failures.load(Ordering::Relaxed),
            rehydrated: self.rehydrated.load(Ordering::Relaxed),
            rehydration_failures: self.rehydration_failures.load(Ordering::Relaxed),
        }
    }
}
