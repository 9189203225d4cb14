//! Installs interception into a browsing context.
//!
//! Installation is explicit dependency injection: the host passes the
//! context, the original primitives and the pipeline configuration, and gets
//! wrapped primitives back. Nothing global is patched. The host decides
//! where the wrapped primitives replace the originals.
//!
//! A context can be installed into once. The installed marker lives on the
//! context itself, so a second attempt is detected no matter who makes it.

use super::consent::{ConsentPolicy, ProtectionMode};
use super::error::InstallError;
use super::gateway::Classifier;
use super::guard::ExclusionGuard;
use super::hook::{Pipeline, WrappedFetch, WrappedXhr};
use super::rehydrate::{DEFAULT_MAX_REHYDRATE_BYTES, DEFAULT_SENTINEL, RehydrationMatcher};
use super::stats::StatsSnapshot;
use super::transport::{Fetch, Primitives, XhrSend};
use crate::config::Config;
use crate::telemetry::{self, AuditEvent};
use hyper::Method;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;
use uuid::Uuid;

/// How concurrent writes from one context are scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStrategy {
    /// Each write scans independently.
    #[default]
    Async,
    /// Writes from one context queue behind a single in-flight scan.
    Blocking,
}

impl fmt::Display for ScanStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanStrategy::Async => write!(f, "async"),
            ScanStrategy::Blocking => write!(f, "blocking"),
        }
    }
}

impl FromStr for ScanStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "async" => Ok(ScanStrategy::Async),
            "blocking" => Ok(ScanStrategy::Blocking),
            other => Err(format!(
                "unknown strategy '{}' (expected async or blocking)",
                other
            )),
        }
    }
}

/// Per-context flags, read once at install time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSettings {
    /// Protection mode.
    pub mode: ProtectionMode,
    /// Whether responses are rehydrated.
    pub rehydrate: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            mode: ProtectionMode::Auto,
            rehydrate: true,
        }
    }
}

/// Which bodies are worth scanning.
#[derive(Debug, Clone)]
pub struct ScanLimits {
    /// Bodies with fewer characters are not scanned.
    pub min_chars: usize,
    /// Bodies with more bytes are not scanned.
    pub max_bytes: usize,
    /// Methods whose bodies are scanned.
    pub methods: Vec<Method>,
}

impl ScanLimits {
    /// Whether a method's body is scanned.
    pub fn is_write(&self, method: &Method) -> bool {
        self.methods.contains(method)
    }
}

impl Default for ScanLimits {
    fn default() -> Self {
        Self {
            min_chars: 6,
            max_bytes: 50_000,
            methods: vec![Method::POST, Method::PUT, Method::PATCH],
        }
    }
}

/// One page or frame the pipeline can be installed into.
///
/// Owned by the host. The pipeline keeps only a weak reference; once the
/// host drops the context, its wrapped primitives pass everything through.
#[derive(Debug)]
pub struct BrowsingContext {
    id: Uuid,
    label: String,
    origin: Option<String>,
    settings: ContextSettings,
    installed: AtomicBool,
}

impl BrowsingContext {
    /// Create a context with a fresh identity.
    pub fn new(label: impl Into<String>, settings: ContextSettings) -> Self {
        Self {
            id: Uuid::new_v4(),
            label: label.into(),
            origin: None,
            settings,
            installed: AtomicBool::new(false),
        }
    }

    /// Set the origin relative URLs resolve against.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Context identity.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Human-readable label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Origin, if any.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Configured flags.
    pub fn settings(&self) -> ContextSettings {
        self.settings
    }

    /// Whether hooks are active in this context.
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Set the installed marker. Returns false if it was already set.
    fn mark_installed(&self) -> bool {
        self.installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Everything a pipeline needs besides the context and the originals.
#[derive(Clone)]
pub struct InterceptConfig {
    /// Scanner and vault.
    pub classifier: Arc<dyn Classifier>,
    /// Bypass rules.
    pub guard: Arc<ExclusionGuard>,
    /// Consent handling for consent-mode contexts.
    pub consent: ConsentPolicy,
    /// Scan strategy.
    pub strategy: ScanStrategy,
    /// Scan limits.
    pub limits: ScanLimits,
    /// Substring every shadow token starts with.
    pub sentinel: String,
    /// Largest response body buffered for rehydration.
    pub max_rehydrate_bytes: usize,
}

impl InterceptConfig {
    /// Create a configuration with default limits, async scanning and
    /// automatic consent.
    pub fn new(classifier: Arc<dyn Classifier>, guard: ExclusionGuard) -> Self {
        Self {
            classifier,
            guard: Arc::new(guard),
            consent: ConsentPolicy::default(),
            strategy: ScanStrategy::default(),
            limits: ScanLimits::default(),
            sentinel: DEFAULT_SENTINEL.to_string(),
            max_rehydrate_bytes: DEFAULT_MAX_REHYDRATE_BYTES,
        }
    }

    /// Build from loaded configuration.
    pub fn from_config(
        config: &Config,
        classifier: Arc<dyn Classifier>,
        consent: ConsentPolicy,
    ) -> Self {
        let interception = &config.interception;
        Self {
            classifier,
            guard: Arc::new(ExclusionGuard::from_config(config)),
            consent,
            strategy: interception.strategy.unwrap_or_default(),
            limits: ScanLimits {
                min_chars: interception.min_scan_chars(),
                max_bytes: interception.max_scan_bytes(),
                methods: interception.methods(),
            },
            sentinel: interception.sentinel().to_string(),
            max_rehydrate_bytes: interception.max_rehydrate_bytes(),
        }
    }

    /// Use a consent policy.
    pub fn with_consent(mut self, consent: ConsentPolicy) -> Self {
        self.consent = consent;
        self
    }

    /// Use a scan strategy.
    pub fn with_strategy(mut self, strategy: ScanStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Use scan limits.
    pub fn with_limits(mut self, limits: ScanLimits) -> Self {
        self.limits = limits;
        self
    }

    pub(crate) fn matcher(&self) -> RehydrationMatcher {
        RehydrationMatcher::new(self.classifier.clone())
            .with_sentinel(self.sentinel.clone())
            .with_max_bytes(self.max_rehydrate_bytes)
    }
}

/// Wrapped primitives of one installed context.
pub struct Interception {
    pipeline: Arc<Pipeline>,
    fetch: Arc<WrappedFetch>,
    xhr: Arc<WrappedXhr>,
}

impl Interception {
    /// Wrapped one-shot primitive.
    pub fn fetch(&self) -> Arc<dyn Fetch> {
        self.fetch.clone()
    }

    /// Wrapped open/send primitive.
    pub fn xhr(&self) -> Arc<dyn XhrSend> {
        self.xhr.clone()
    }

    /// Both wrapped primitives.
    pub fn primitives(&self) -> Primitives {
        Primitives::new(self.fetch(), self.xhr())
    }

    /// Identity of the context these primitives belong to.
    pub fn context_id(&self) -> Uuid {
        self.pipeline.context_id()
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.pipeline.stats()
    }
}

/// Install interception into a context.
///
/// Both wrapped primitives delegate actual dispatch to `originals`.
///
/// # Errors
///
/// Returns [`InstallError::AlreadyInstalled`] if the context already has
/// hooks; the context is left as it was.
pub fn install_interception(
    context: &Arc<BrowsingContext>,
    originals: Primitives,
    config: InterceptConfig,
) -> Result<Interception, InstallError> {
    if !context.mark_installed() {
        return Err(InstallError::AlreadyInstalled(context.id()));
    }

    let settings = context.settings();
    let pipeline = Arc::new(Pipeline::new(context, config));

    info!(
        "Interception installed in {} ({}): mode={}, rehydrate={}",
        context.label(),
        context.id(),
        settings.mode,
        settings.rehydrate
    );
    telemetry::record(AuditEvent::ContextInstalled {
        context_id: context.id(),
        label: context.label().to_string(),
        mode: settings.mode,
        rehydrate: settings.rehydrate,
    });

    Ok(Interception {
        fetch: Arc::new(WrappedFetch::new(pipeline.clone(), originals.fetch)),
        xhr: Arc::new(WrappedXhr::new(pipeline.clone(), originals.xhr)),
        pipeline,
    })
}
