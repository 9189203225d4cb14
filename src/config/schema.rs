//! Configuration schema definitions.
//!
//! Every section can be partially specified in any layer. Fields left unset
//! fall back to the defaults exposed through the accessor methods, so a
//! layer only needs to name what it changes.

use crate::intercept::{ConsentDecision, ContextSettings, ProtectionMode, ScanStrategy};
use hyper::Method;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default base URL of the local classification/vault service.
pub const DEFAULT_SERVICE_URL: &str = "http://127.0.0.1:9000/";

/// Default proxy listen address.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8899";

const DEFAULT_SERVICE_TIMEOUT_MS: u32 = 5_000;
const DEFAULT_MAX_SCAN_BYTES: usize = 50_000;
const DEFAULT_MIN_SCAN_CHARS: usize = 6;
const DEFAULT_MAX_REHYDRATE_BYTES: usize = 4 * 1024 * 1024;
const DEFAULT_SENTINEL: &str = "[RS-";
const DEFAULT_PROMPT_TIMEOUT_SECS: u32 = 30;

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// General settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Local classification/vault service.
    #[serde(default)]
    pub service: ServiceConfig,

    /// Interception behavior.
    #[serde(default)]
    pub interception: InterceptionConfig,

    /// Calls that are never scanned.
    #[serde(default)]
    pub exclusions: ExclusionsConfig,

    /// Consent prompts.
    #[serde(default)]
    pub consent: ConsentConfig,

    /// Proxy host.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Per-context overrides, keyed by context name.
    #[serde(default)]
    pub contexts: HashMap<String, ContextOverride>,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Lists are appended, scalars are overridden when set, and contexts
    /// are merged by key.
    pub fn merge(&mut self, other: Config) {
        self.general.merge(other.general);
        self.service.merge(other.service);
        self.interception.merge(other.interception);
        self.exclusions.merge(other.exclusions);
        self.consent.merge(other.consent);
        self.proxy.merge(other.proxy);

        for (name, other_context) in other.contexts {
            if let Some(existing) = self.contexts.get_mut(&name) {
                existing.merge(other_context);
            } else {
                self.contexts.insert(name, other_context);
            }
        }
    }

    /// Settings for a named context: global interception settings with the
    /// context's overrides applied.
    pub fn resolve_context(&self, name: &str) -> ContextSettings {
        let mut settings = ContextSettings {
            mode: self.interception.mode(),
            rehydrate: self.interception.rehydrate(),
        };
        if let Some(overrides) = self.contexts.get(name) {
            if let Some(mode) = overrides.mode {
                settings.mode = mode;
            }
            if let Some(rehydrate) = overrides.rehydrate {
                settings.rehydrate = rehydrate;
            }
        }
        settings
    }
}

/// General application settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub log_level: String,
}

impl GeneralConfig {
    fn merge(&mut self, other: GeneralConfig) {
        if !other.log_level.is_empty() {
            self.log_level = other.log_level;
        }
    }
}

/// Local classification/vault service.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ServiceConfig {
    /// Base URL of the service.
    #[serde(default)]
    pub url: String,

    /// Timeout for one service call in milliseconds.
    #[serde(default)]
    pub timeout_ms: u32,
}

impl ServiceConfig {
    fn merge(&mut self, other: ServiceConfig) {
        if !other.url.is_empty() {
            self.url = other.url;
        }
        if other.timeout_ms != 0 {
            self.timeout_ms = other.timeout_ms;
        }
    }

    /// Base URL, falling back to the default.
    pub fn url_or_default(&self) -> &str {
        if self.url.is_empty() {
            DEFAULT_SERVICE_URL
        } else {
            &self.url
        }
    }

    /// Per-call timeout.
    pub fn timeout(&self) -> Duration {
        let ms = if self.timeout_ms == 0 {
            DEFAULT_SERVICE_TIMEOUT_MS
        } else {
            self.timeout_ms
        };
        Duration::from_millis(u64::from(ms))
    }
}

/// Interception behavior.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct InterceptionConfig {
    /// Default protection mode.
    #[serde(default)]
    pub mode: Option<ProtectionMode>,

    /// Whether responses are rehydrated by default.
    #[serde(default)]
    pub rehydrate: Option<bool>,

    /// Scan strategy.
    #[serde(default)]
    pub strategy: Option<ScanStrategy>,

    /// Bodies larger than this (bytes) are not scanned.
    #[serde(default)]
    pub max_scan_bytes: usize,

    /// Bodies shorter than this (characters) are not scanned.
    #[serde(default)]
    pub min_scan_chars: Option<usize>,

    /// Response bodies larger than this (bytes) are not rehydrated.
    #[serde(default)]
    pub max_rehydrate_bytes: usize,

    /// Methods whose bodies are scanned.
    #[serde(default)]
    pub scan_methods: Vec<String>,

    /// Substring every shadow token starts with.
    #[serde(default)]
    pub token_sentinel: String,
}

impl InterceptionConfig {
    fn merge(&mut self, other: InterceptionConfig) {
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        if other.rehydrate.is_some() {
            self.rehydrate = other.rehydrate;
        }
        if other.strategy.is_some() {
            self.strategy = other.strategy;
        }
        if other.max_scan_bytes != 0 {
            self.max_scan_bytes = other.max_scan_bytes;
        }
        if other.min_scan_chars.is_some() {
            self.min_scan_chars = other.min_scan_chars;
        }
        if other.max_rehydrate_bytes != 0 {
            self.max_rehydrate_bytes = other.max_rehydrate_bytes;
        }
        self.scan_methods.extend(other.scan_methods);
        if !other.token_sentinel.is_empty() {
            self.token_sentinel = other.token_sentinel;
        }
    }

    /// Default protection mode.
    pub fn mode(&self) -> ProtectionMode {
        self.mode.unwrap_or_default()
    }

    /// Whether responses are rehydrated by default.
    pub fn rehydrate(&self) -> bool {
        self.rehydrate.unwrap_or(true)
    }

    /// Scan size cap in bytes.
    pub fn max_scan_bytes(&self) -> usize {
        if self.max_scan_bytes == 0 {
            DEFAULT_MAX_SCAN_BYTES
        } else {
            self.max_scan_bytes
        }
    }

    /// Minimum scanned length in characters.
    pub fn min_scan_chars(&self) -> usize {
        self.min_scan_chars.unwrap_or(DEFAULT_MIN_SCAN_CHARS)
    }

    /// Rehydration size cap in bytes.
    pub fn max_rehydrate_bytes(&self) -> usize {
        if self.max_rehydrate_bytes == 0 {
            DEFAULT_MAX_REHYDRATE_BYTES
        } else {
            self.max_rehydrate_bytes
        }
    }

    /// Scanned methods, deduplicated. Falls back to POST/PUT/PATCH when none
    /// are configured. Invalid names are skipped (validation reports them).
    pub fn methods(&self) -> Vec<Method> {
        let mut methods: Vec<Method> = Vec::new();
        for name in &self.scan_methods {
            if let Ok(method) = Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
                && !methods.contains(&method)
            {
                methods.push(method);
            }
        }
        if methods.is_empty() {
            methods = vec![Method::POST, Method::PUT, Method::PATCH];
        }
        methods
    }

    /// Token sentinel.
    pub fn sentinel(&self) -> &str {
        if self.token_sentinel.is_empty() {
            DEFAULT_SENTINEL
        } else {
            &self.token_sentinel
        }
    }
}

/// Calls that are never scanned.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ExclusionsConfig {
    /// Hosts to exclude.
    ///
    /// Supports wildcards: `*.sentry.io` matches `o1.ingest.sentry.io`.
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Path fragments to exclude (analytics, telemetry, health checks).
    #[serde(default)]
    pub paths: Vec<String>,
}

impl ExclusionsConfig {
    fn merge(&mut self, other: ExclusionsConfig) {
        self.hosts.extend(other.hosts);
        self.paths.extend(other.paths);
    }
}

/// Consent prompts.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConsentConfig {
    /// Seconds a prompt waits for an answer.
    #[serde(default)]
    pub prompt_timeout: u32,

    /// Answer used when a prompt times out.
    #[serde(default)]
    pub timeout_decision: Option<ConsentDecision>,
}

impl ConsentConfig {
    fn merge(&mut self, other: ConsentConfig) {
        if other.prompt_timeout != 0 {
            self.prompt_timeout = other.prompt_timeout;
        }
        if other.timeout_decision.is_some() {
            self.timeout_decision = other.timeout_decision;
        }
    }

    /// Prompt timeout.
    pub fn timeout(&self) -> Duration {
        let secs = if self.prompt_timeout == 0 {
            DEFAULT_PROMPT_TIMEOUT_SECS
        } else {
            self.prompt_timeout
        };
        Duration::from_secs(u64::from(secs))
    }

    /// Answer used on timeout.
    pub fn timeout_decision(&self) -> ConsentDecision {
        self.timeout_decision.unwrap_or_default()
    }
}

/// Proxy host.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProxyConfig {
    /// Listen address.
    #[serde(default)]
    pub listen: String,
}

impl ProxyConfig {
    fn merge(&mut self, other: ProxyConfig) {
        if !other.listen.is_empty() {
            self.listen = other.listen;
        }
    }

    /// Listen address, falling back to the default.
    pub fn listen_or_default(&self) -> &str {
        if self.listen.is_empty() {
            DEFAULT_LISTEN
        } else {
            &self.listen
        }
    }
}

/// Overrides for one named context.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ContextOverride {
    /// Protection mode for this context.
    #[serde(default)]
    pub mode: Option<ProtectionMode>,

    /// Rehydration flag for this context.
    #[serde(default)]
    pub rehydrate: Option<bool>,
}

impl ContextOverride {
    /// Merge another override into this one; set values win.
    pub fn merge(&mut self, other: ContextOverride) {
        if other.mode.is_some() {
            self.mode = other.mode;
        }
        if other.rehydrate.is_some() {
            self.rehydrate = other.rehydrate;
        }
    }
}
