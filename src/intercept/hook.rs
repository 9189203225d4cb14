//! Outbound hook: the per-call sanitize/dispatch/rehydrate flow.
//!
//! Both wrapped primitives funnel into [`Pipeline::prepare`] before dispatch
//! and [`Pipeline::finish`] after it, so the one-shot and open/send paths
//! cannot drift apart.
//!
//! # Request Flow
//!
//! ```text
//! received ──bypass?──────────────────────────────────────┐
//!    │                                                    │
//!    ├─not a write / not text / too short / too large─────┤ passthrough
//!    │                                                    │
//!  scan ──clean / failed──────────────────────────────────┤
//!    │ sanitized                                          │
//!  consent ──declined─────────────────────────────────────┤ (original body)
//!    │ approved                                           │
//!  replace body ───────────────────────────────────────> dispatch ─> rehydrate ─> return
//! ```
//!
//! The real call never starts before the decision is final. Aborting during
//! the scan or the prompt drops the result and nothing is dispatched.

use super::consent::{ConsentPolicy, ConsentRequest};
use super::error::{TransportError, TransportResult};
use super::gateway::Classifier;
use super::guard::{BypassReason, ExclusionGuard};
use super::install::{BrowsingContext, ContextSettings, InterceptConfig, ScanLimits, ScanStrategy};
use super::rehydrate::{RehydrationMatcher, RehydrationOutcome};
use super::stats::{InterceptStats, StatsSnapshot};
use super::transport::{
    AbortSignal, Fetch, OutboundBody, OutboundRequest, ShieldBody, XhrOpened, XhrSend,
};
use crate::telemetry::{self, AuditEvent};
use async_trait::async_trait;
use hyper::header::CONTENT_LENGTH;
use hyper::Response;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// What the pipeline did with one request before dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The context was torn down; nothing is inspected any more.
    ContextGone,
    /// The exclusion guard let the call through.
    Bypassed(BypassReason),
    /// Method is not write-style.
    NotWrite,
    /// Body is empty, binary or streamed.
    NotText,
    /// Body is below the minimum scan length.
    TooShort,
    /// Body is above the scan size cap.
    TooLarge,
    /// Scanned; nothing sensitive.
    Clean,
    /// The classifier failed; the original body was kept.
    ScanFailed,
    /// Sanitized, but the user kept the original body.
    Declined,
    /// The sanitized body replaced the original.
    Sanitized,
}

impl Outcome {
    /// Whether the request body was replaced.
    pub fn is_sanitized(&self) -> bool {
        matches!(self, Outcome::Sanitized)
    }

    /// Whether the response of this call may be rehydrated.
    fn allows_rehydration(&self) -> bool {
        !matches!(
            self,
            Outcome::ContextGone
                | Outcome::Bypassed(BypassReason::Internal)
                | Outcome::Bypassed(BypassReason::ServiceEndpoint)
        )
    }
}

/// Text carrying serialized binary data: embedded NULs, a gzip header
/// rendered as a decimal byte list, or a host object stringified as
/// `[object ...]`.
fn looks_binary(text: &str) -> bool {
    text.contains('\0') || text.contains("31,139,8,0") || text.contains("[object")
}

/// Race a future against the caller's abort signal.
async fn abortable<F: Future>(
    signal: Option<&AbortSignal>,
    future: F,
) -> Result<F::Output, TransportError> {
    match signal {
        Some(signal) => tokio::select! {
            biased;
            _ = signal.aborted() => Err(TransportError::Aborted),
            output = future => Ok(output),
        },
        None => Ok(future.await),
    }
}

/// Interception state of one installed context.
pub struct Pipeline {
    context: Weak<BrowsingContext>,
    context_id: Uuid,
    label: String,
    origin: Option<String>,
    settings: ContextSettings,
    classifier: Arc<dyn Classifier>,
    guard: Arc<ExclusionGuard>,
    consent: ConsentPolicy,
    strategy: ScanStrategy,
    limits: ScanLimits,
    matcher: RehydrationMatcher,
    /// Held across scan and consent under the blocking strategy.
    serial: Mutex<()>,
    stats: InterceptStats,
}

impl Pipeline {
    pub(crate) fn new(context: &Arc<BrowsingContext>, config: InterceptConfig) -> Self {
        let matcher = config.matcher();
        Self {
            context: Arc::downgrade(context),
            context_id: context.id(),
            label: context.label().to_string(),
            origin: context.origin().map(str::to_string),
            settings: context.settings(),
            classifier: config.classifier,
            guard: config.guard,
            consent: config.consent,
            strategy: config.strategy,
            limits: config.limits,
            matcher,
            serial: Mutex::new(()),
            stats: InterceptStats::new(),
        }
    }

    /// Identity of the owning context.
    pub fn context_id(&self) -> Uuid {
        self.context_id
    }

    /// Current counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the pre-dispatch steps on a request, replacing its body if the
    /// sanitized version is to be sent.
    ///
    /// # Errors
    ///
    /// Only [`TransportError::Aborted`], when the caller aborts before the
    /// decision is final.
    pub async fn prepare(&self, request: &mut OutboundRequest) -> Result<Outcome, TransportError> {
        self.stats.record_intercepted();

        let outcome = self.inspect(request).await?;
        match &outcome {
            Outcome::Sanitized => {}
            Outcome::Bypassed(reason) => {
                debug!("Bypassing {} {}: {}", request.method, request.url, reason);
                self.stats.record_bypassed();
            }
            other => {
                trace!("Passing through {} {}: {:?}", request.method, request.url, other);
                self.stats.record_bypassed();
            }
        }
        Ok(outcome)
    }

    async fn inspect(&self, request: &mut OutboundRequest) -> Result<Outcome, TransportError> {
        if self.context.upgrade().is_none() {
            return Ok(Outcome::ContextGone);
        }

        if let Some(reason) =
            self.guard
                .evaluate(&request.url, self.origin.as_deref(), request.is_internal())
        {
            return Ok(Outcome::Bypassed(reason));
        }

        if !self.limits.is_write(&request.method) {
            return Ok(Outcome::NotWrite);
        }

        let sanitized = {
            let Some(text) = request.body.as_text() else {
                return Ok(Outcome::NotText);
            };
            if looks_binary(text) {
                return Ok(Outcome::NotText);
            }
            if text.chars().count() < self.limits.min_chars {
                return Ok(Outcome::TooShort);
            }
            if text.len() > self.limits.max_bytes {
                return Ok(Outcome::TooLarge);
            }

            let signal = request.signal.as_ref();
            let _turn = match self.strategy {
                ScanStrategy::Blocking => Some(abortable(signal, self.serial.lock()).await?),
                ScanStrategy::Async => None,
            };

            self.stats.record_scanned();
            let scan = match abortable(signal, self.classifier.try_scan(text)).await? {
                Ok(scan) => scan,
                Err(e) => {
                    warn!("Scan unavailable for {} {}: {}", request.method, request.url, e);
                    self.stats.record_scan_failure();
                    telemetry::record(AuditEvent::ScanUnavailable {
                        context_id: self.context_id,
                        url: request.url.clone(),
                        reason: e.to_string(),
                    });
                    return Ok(Outcome::ScanFailed);
                }
            };

            let Some(replacement) = scan.replacement() else {
                return Ok(Outcome::Clean);
            };

            let question = ConsentRequest::new(
                self.context_id,
                self.label.clone(),
                request.url.clone(),
                request.method.to_string(),
                replacement,
            );
            let approved = abortable(
                signal,
                self.consent.should_apply(self.settings.mode, &question),
            )
            .await?;

            if !approved {
                self.stats.record_declined();
                telemetry::record(AuditEvent::ConsentDeclined {
                    context_id: self.context_id,
                    method: request.method.to_string(),
                    url: request.url.clone(),
                });
                return Ok(Outcome::Declined);
            }
            replacement.to_string()
        };

        if request.is_aborted() {
            return Err(TransportError::Aborted);
        }

        request.body = OutboundBody::Text(sanitized);
        request.headers.remove(CONTENT_LENGTH);

        self.stats.record_sanitized();
        debug!("Sanitized body of {} {}", request.method, request.url);
        telemetry::record(AuditEvent::BodySanitized {
            context_id: self.context_id,
            method: request.method.to_string(),
            url: request.url.clone(),
        });

        Ok(Outcome::Sanitized)
    }

    /// Apply rehydration to the response of a dispatched call.
    ///
    /// # Errors
    ///
    /// Only when reading the original response body fails.
    pub async fn finish(
        &self,
        url: &str,
        outcome: &Outcome,
        response: Response<ShieldBody>,
    ) -> TransportResult<Response<ShieldBody>> {
        if !self.settings.rehydrate
            || !outcome.allows_rehydration()
            || self.guard.targets_service(url)
        {
            return Ok(response);
        }

        let (response, result) = self.matcher.apply(response).await?;
        match result {
            RehydrationOutcome::Rehydrated(replaced) => {
                self.stats.record_rehydrated();
                telemetry::record(AuditEvent::Rehydrated {
                    context_id: self.context_id,
                    url: url.to_string(),
                    replaced,
                });
            }
            RehydrationOutcome::Unavailable(reason) => {
                warn!("Rehydration unavailable for {}: {}", url, reason);
                self.stats.record_rehydration_failure();
                telemetry::record(AuditEvent::RehydrationUnavailable {
                    context_id: self.context_id,
                    url: url.to_string(),
                    reason,
                });
            }
            _ => {}
        }
        Ok(response)
    }
}

/// One-shot primitive wrapped with the pipeline.
pub struct WrappedFetch {
    pipeline: Arc<Pipeline>,
    original: Arc<dyn Fetch>,
}

impl WrappedFetch {
    pub(crate) fn new(pipeline: Arc<Pipeline>, original: Arc<dyn Fetch>) -> Self {
        Self { pipeline, original }
    }
}

#[async_trait]
impl Fetch for WrappedFetch {
    async fn fetch(&self, mut request: OutboundRequest) -> TransportResult<Response<ShieldBody>> {
        let outcome = self.pipeline.prepare(&mut request).await?;
        let url = request.url.clone();
        let response = self.original.fetch(request).await?;
        self.pipeline.finish(&url, &outcome, response).await
    }
}

/// Open/send primitive wrapped with the pipeline.
pub struct WrappedXhr {
    pipeline: Arc<Pipeline>,
    original: Arc<dyn XhrSend>,
}

impl WrappedXhr {
    pub(crate) fn new(pipeline: Arc<Pipeline>, original: Arc<dyn XhrSend>) -> Self {
        Self { pipeline, original }
    }
}

#[async_trait]
impl XhrSend for WrappedXhr {
    async fn send(
        &self,
        opened: XhrOpened,
        body: OutboundBody,
    ) -> TransportResult<Response<ShieldBody>> {
        let mut request = opened.into_request(body);
        let outcome = self.pipeline.prepare(&mut request).await?;
        let url = request.url.clone();
        let (opened, body) = request.into_xhr();
        let response = self.original.send(opened, body).await?;
        self.pipeline.finish(&url, &outcome, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::consent::{ConsentDecision, FixedPrompt, ProtectionMode};
    use crate::intercept::testing::{FakeClassifier, ScriptedFetch};
    use crate::intercept::transport::abort_pair;
    use hyper::Method;
    use hyper::header::HeaderValue;
    use std::time::Duration;

    const SERVICE: &str = "http://127.0.0.1:9000/";

    fn context(mode: ProtectionMode) -> Arc<BrowsingContext> {
        Arc::new(BrowsingContext::new(
            "tab-1",
            ContextSettings {
                mode,
                rehydrate: true,
            },
        ))
    }

    fn pipeline(
        context: &Arc<BrowsingContext>,
        classifier: Arc<FakeClassifier>,
        decision: ConsentDecision,
    ) -> Pipeline {
        let guard = ExclusionGuard::new(SERVICE, &[], &["/analytics".to_string()]);
        let config = InterceptConfig::new(classifier, guard)
            .with_consent(ConsentPolicy::new(Arc::new(FixedPrompt(decision))));
        Pipeline::new(context, config)
    }

    fn email_classifier() -> Arc<FakeClassifier> {
        Arc::new(FakeClassifier::new().replacing("a@b.com", "[RS-MAIL-001]"))
    }

    #[tokio::test]
    async fn test_get_is_never_scanned() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = email_classifier();
        let p = pipeline(&ctx, classifier.clone(), ConsentDecision::Apply);

        let mut request = OutboundRequest::get("http://chat.example.com/?q=a@b.com")
            .body("contact me at a@b.com");
        assert_eq!(p.prepare(&mut request).await.unwrap(), Outcome::NotWrite);
        assert_eq!(classifier.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_auto_mode_replaces_body_and_drops_length() {
        let ctx = context(ProtectionMode::Auto);
        let p = pipeline(&ctx, email_classifier(), ConsentDecision::Decline);

        let mut request = OutboundRequest::post("http://chat.example.com/send", "contact me at a@b.com")
            .header(CONTENT_LENGTH, HeaderValue::from(21usize));
        assert_eq!(p.prepare(&mut request).await.unwrap(), Outcome::Sanitized);
        assert_eq!(request.body.as_text(), Some("contact me at [RS-MAIL-001]"));
        assert!(!request.headers.contains_key(CONTENT_LENGTH));
        assert_eq!(p.stats().sanitized, 1);
    }

    #[tokio::test]
    async fn test_consent_decline_keeps_original() {
        let ctx = context(ProtectionMode::Consent);
        let p = pipeline(&ctx, email_classifier(), ConsentDecision::Decline);

        let mut request = OutboundRequest::post("http://chat.example.com/send", "contact me at a@b.com");
        assert_eq!(p.prepare(&mut request).await.unwrap(), Outcome::Declined);
        assert_eq!(request.body.as_text(), Some("contact me at a@b.com"));
        assert_eq!(p.stats().declined, 1);
    }

    #[tokio::test]
    async fn test_scan_failure_keeps_original() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = Arc::new(FakeClassifier::new().failing());
        let p = pipeline(&ctx, classifier, ConsentDecision::Apply);

        let mut request = OutboundRequest::post("http://chat.example.com/send", "contact me at a@b.com");
        assert_eq!(p.prepare(&mut request).await.unwrap(), Outcome::ScanFailed);
        assert_eq!(request.body.as_text(), Some("contact me at a@b.com"));
        assert_eq!(p.stats().scan_failures, 1);
    }

    #[tokio::test]
    async fn test_short_binary_and_excluded_bodies_skip_scan() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = email_classifier();
        let p = pipeline(&ctx, classifier.clone(), ConsentDecision::Apply);

        let mut short = OutboundRequest::post("http://chat.example.com/send", "hi");
        assert_eq!(p.prepare(&mut short).await.unwrap(), Outcome::TooShort);

        let mut binary = OutboundRequest::post("http://chat.example.com/upload", vec![0u8; 64]);
        assert_eq!(p.prepare(&mut binary).await.unwrap(), Outcome::NotText);

        let mut packed = OutboundRequest::post("http://chat.example.com/upload", "[31,139,8,0,0,0,0,0]");
        assert_eq!(p.prepare(&mut packed).await.unwrap(), Outcome::NotText);

        let mut excluded = OutboundRequest::post("http://chat.example.com/analytics/v1", "contact me at a@b.com");
        assert!(matches!(
            p.prepare(&mut excluded).await.unwrap(),
            Outcome::Bypassed(BypassReason::ExcludedPath(_))
        ));

        assert_eq!(classifier.scan_count(), 0);
        assert_eq!(p.stats().bypassed, 4);
    }

    #[tokio::test]
    async fn test_stringified_object_body_skips_scan() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = email_classifier();
        let p = pipeline(&ctx, classifier.clone(), ConsentDecision::Apply);

        let mut request = OutboundRequest::post("http://chat.example.com/send", "[object FormData]");
        assert_eq!(p.prepare(&mut request).await.unwrap(), Outcome::NotText);
        assert_eq!(request.body.as_text(), Some("[object FormData]"));
        assert_eq!(classifier.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_service_calls_are_not_scanned() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = email_classifier();
        let p = pipeline(&ctx, classifier.clone(), ConsentDecision::Apply);

        let mut request = OutboundRequest::post(
            "http://127.0.0.1:9000/process_text",
            r#"{"text":"contact me at a@b.com"}"#,
        );
        assert_eq!(
            p.prepare(&mut request).await.unwrap(),
            Outcome::Bypassed(BypassReason::ServiceEndpoint)
        );
        assert_eq!(classifier.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_context_passes_through() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = email_classifier();
        let p = pipeline(&ctx, classifier.clone(), ConsentDecision::Apply);
        drop(ctx);

        let mut request = OutboundRequest::post("http://chat.example.com/send", "contact me at a@b.com");
        assert_eq!(p.prepare(&mut request).await.unwrap(), Outcome::ContextGone);
        assert_eq!(classifier.scan_count(), 0);
    }

    #[tokio::test]
    async fn test_abort_during_scan_dispatches_nothing() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = Arc::new(
            FakeClassifier::new()
                .replacing("a@b.com", "[RS-MAIL-001]")
                .delayed(Duration::from_millis(200)),
        );
        let p = Arc::new(pipeline(&ctx, classifier, ConsentDecision::Apply));
        let original = Arc::new(ScriptedFetch::ok("{}"));
        let wrapped = WrappedFetch::new(p.clone(), original.clone());

        let (handle, signal) = abort_pair();
        let request = OutboundRequest::post("http://chat.example.com/send", "contact me at a@b.com")
            .with_signal(signal);

        let call = tokio::spawn(async move { wrapped.fetch(request).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.abort();

        let result = call.await.unwrap();
        assert!(matches!(result, Err(TransportError::Aborted)));
        assert!(original.calls().is_empty());
        assert_eq!(p.stats().sanitized, 0);
    }

    #[tokio::test]
    async fn test_blocking_strategy_serializes_scans() {
        let ctx = context(ProtectionMode::Auto);
        let classifier = Arc::new(FakeClassifier::new().delayed(Duration::from_millis(50)));
        let guard = ExclusionGuard::new(SERVICE, &[], &[]);
        let config = InterceptConfig::new(classifier, guard).with_strategy(ScanStrategy::Blocking);
        let p = Arc::new(Pipeline::new(&ctx, config));

        let started = tokio::time::Instant::now();
        let a = tokio::spawn({
            let p = p.clone();
            async move {
                let mut r = OutboundRequest::post("http://a.example.com/", "first body");
                p.prepare(&mut r).await
            }
        });
        let b = tokio::spawn({
            let p = p.clone();
            async move {
                let mut r = OutboundRequest::post("http://b.example.com/", "second body");
                p.prepare(&mut r).await
            }
        });
        assert_eq!(a.await.unwrap().unwrap(), Outcome::Clean);
        assert_eq!(b.await.unwrap().unwrap(), Outcome::Clean);
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_xhr_and_fetch_dispatch_same_body() {
        let ctx = context(ProtectionMode::Auto);
        let p = Arc::new(pipeline(&ctx, email_classifier(), ConsentDecision::Apply));
        let original = Arc::new(ScriptedFetch::ok("{}"));

        let fetch = WrappedFetch::new(p.clone(), original.clone());
        let xhr = WrappedXhr::new(p.clone(), original.clone());

        fetch
            .fetch(OutboundRequest::post("http://chat.example.com/send", "contact me at a@b.com"))
            .await
            .unwrap();
        xhr.send(
            XhrOpened::open(Method::POST, "http://chat.example.com/send"),
            OutboundBody::from("contact me at a@b.com"),
        )
        .await
        .unwrap();

        let calls = original.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].via, "fetch");
        assert_eq!(calls[1].via, "xhr");
        assert_eq!(calls[0].body, calls[1].body);
        assert_eq!(calls[0].body.as_deref(), Some("contact me at [RS-MAIL-001]"));
    }
}
