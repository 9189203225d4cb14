//! In-memory fakes shared by the pipeline's unit tests.

use super::error::{GatewayError, TransportError, TransportResult};
use super::gateway::{Classifier, RehydrationResult, ScanResult};
use super::transport::{
    Fetch, OutboundBody, OutboundRequest, ShieldBody, XhrOpened, XhrSend, full_body,
};
use async_trait::async_trait;
use hyper::header::CONTENT_TYPE;
use hyper::{HeaderMap, Method, Response, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a fake transport saw for one call.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    pub url: String,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub kind: &'static str,
    pub internal: bool,
    pub via: &'static str,
}

type Responder = Arc<dyn Fn(&RecordedCall) -> Response<ShieldBody> + Send + Sync>;

/// Build a response with a JSON content type.
pub(crate) fn json_response(status: StatusCode, body: &str) -> Response<ShieldBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// Transport that records calls and answers from a closure.
pub(crate) struct ScriptedFetch {
    calls: Mutex<Vec<RecordedCall>>,
    responder: Responder,
    fail: bool,
    delay: Option<Duration>,
}

impl ScriptedFetch {
    pub fn with<F>(responder: F) -> Self
    where
        F: Fn(&RecordedCall) -> Response<ShieldBody> + Send + Sync + 'static,
    {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Arc::new(responder),
            fail: false,
            delay: None,
        }
    }

    pub fn ok(body: &str) -> Self {
        let body = body.to_string();
        Self::with(move |_| json_response(StatusCode::OK, &body))
    }

    pub fn failing() -> Self {
        let mut fetch = Self::ok("{}");
        fetch.fail = true;
        fetch
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    async fn respond(
        &self,
        request: OutboundRequest,
        via: &'static str,
    ) -> TransportResult<Response<ShieldBody>> {
        if request.is_aborted() {
            return Err(TransportError::Aborted);
        }
        let call = RecordedCall {
            url: request.url.clone(),
            method: request.method.clone(),
            headers: request.headers.clone(),
            body: request.body.as_text().map(str::to_string),
            kind: request.body.kind(),
            internal: request.internal,
            via,
        };
        self.calls.lock().unwrap().push(call.clone());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(TransportError::Upstream {
                url: call.url,
                message: "connection refused".to_string(),
            });
        }
        Ok((self.responder)(&call))
    }
}

#[async_trait]
impl Fetch for ScriptedFetch {
    async fn fetch(&self, request: OutboundRequest) -> TransportResult<Response<ShieldBody>> {
        self.respond(request, "fetch").await
    }
}

#[async_trait]
impl XhrSend for ScriptedFetch {
    async fn send(
        &self,
        opened: XhrOpened,
        body: OutboundBody,
    ) -> TransportResult<Response<ShieldBody>> {
        self.respond(opened.into_request(body), "xhr").await
    }
}

/// Classifier that swaps known values for tokens and back.
pub(crate) struct FakeClassifier {
    pairs: Vec<(String, String)>,
    fail: bool,
    delay: Option<Duration>,
    scans: AtomicUsize,
    rehydrations: AtomicUsize,
}

impl FakeClassifier {
    pub fn new() -> Self {
        Self {
            pairs: Vec::new(),
            fail: false,
            delay: None,
            scans: AtomicUsize::new(0),
            rehydrations: AtomicUsize::new(0),
        }
    }

    pub fn replacing(mut self, real: &str, token: &str) -> Self {
        self.pairs.push((real.to_string(), token.to_string()));
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    pub fn rehydrate_count(&self) -> usize {
        self.rehydrations.load(Ordering::SeqCst)
    }

    async fn pause(&self) -> Result<(), GatewayError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(GatewayError::Unavailable("fake classifier down".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Classifier for FakeClassifier {
    async fn try_scan(&self, text: &str) -> Result<ScanResult, GatewayError> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        let mut out = text.to_string();
        for (real, token) in &self.pairs {
            out = out.replace(real.as_str(), token);
        }
        Ok(ScanResult {
            sanitized: out != text,
            text: out,
        })
    }

    async fn try_rehydrate(&self, text: &str) -> Result<RehydrationResult, GatewayError> {
        self.rehydrations.fetch_add(1, Ordering::SeqCst);
        self.pause().await?;
        let mut out = text.to_string();
        let mut replaced = 0;
        for (real, token) in &self.pairs {
            replaced += out.matches(token.as_str()).count() as u64;
            out = out.replace(token.as_str(), real);
        }
        Ok(RehydrationResult { replaced, text: out })
    }
}
