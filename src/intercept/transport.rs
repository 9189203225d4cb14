//! Network primitives a browsing context uses to reach the outside world.
//!
//! A page has two ways to send data: a one-shot call taking an options
//! object ([`Fetch`]) and a two-step open/send pair ([`XhrOpened`] +
//! [`XhrSend`]). The host hands the *original* implementations of both to the
//! installer and gets wrapped implementations of the same traits back.
//!
//! [`HyperTransport`] is the default original: a plain HTTP/1.1 client built
//! on hyper-util's pooled client.

use super::error::{TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full, combinators::BoxBody};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Method, Request, Response, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

/// Header carried by every call the pipeline makes on its own behalf.
pub const INTERNAL_HEADER: &str = "x-shadow-shield-internal";

/// Boxed error type used by streamed bodies.
pub type BodyError = Box<dyn std::error::Error + Send + Sync>;

/// Body type for requests and responses flowing through the pipeline.
pub type ShieldBody = BoxBody<Bytes, BodyError>;

/// Create an empty body.
pub fn empty_body() -> ShieldBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a fully buffered body.
pub fn full_body(content: impl Into<Bytes>) -> ShieldBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Request body as handed to a network primitive.
///
/// Only `Text` is eligible for scanning. Binary and streamed bodies are
/// dispatched as-is and never stringified.
pub enum OutboundBody {
    /// No body.
    Empty,
    /// A string body.
    Text(String),
    /// A byte buffer.
    Binary(Bytes),
    /// A streamed body of unknown size.
    Stream(ShieldBody),
}

impl OutboundBody {
    /// Borrow the body as text, if it is a text body.
    ///
    /// This never consumes the body, so the dispatched request still carries
    /// it intact.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            OutboundBody::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Short name of the body kind, for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundBody::Empty => "empty",
            OutboundBody::Text(_) => "text",
            OutboundBody::Binary(_) => "binary",
            OutboundBody::Stream(_) => "stream",
        }
    }

    /// Known length in bytes (None for streams).
    pub fn len(&self) -> Option<usize> {
        match self {
            OutboundBody::Empty => Some(0),
            OutboundBody::Text(text) => Some(text.len()),
            OutboundBody::Binary(bytes) => Some(bytes.len()),
            OutboundBody::Stream(_) => None,
        }
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }

    /// Convert into a hyper-compatible body for dispatch.
    pub fn into_body(self) -> ShieldBody {
        match self {
            OutboundBody::Empty => empty_body(),
            OutboundBody::Text(text) => full_body(text),
            OutboundBody::Binary(bytes) => full_body(bytes),
            OutboundBody::Stream(body) => body,
        }
    }
}

impl fmt::Debug for OutboundBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Body contents are never printed.
        match self.len() {
            Some(len) => write!(f, "OutboundBody::{}({} bytes)", self.kind(), len),
            None => write!(f, "OutboundBody::{}", self.kind()),
        }
    }
}

impl From<String> for OutboundBody {
    fn from(text: String) -> Self {
        OutboundBody::Text(text)
    }
}

impl From<&str> for OutboundBody {
    fn from(text: &str) -> Self {
        OutboundBody::Text(text.to_string())
    }
}

impl From<Bytes> for OutboundBody {
    fn from(bytes: Bytes) -> Self {
        OutboundBody::Binary(bytes)
    }
}

impl From<Vec<u8>> for OutboundBody {
    fn from(bytes: Vec<u8>) -> Self {
        OutboundBody::Binary(Bytes::from(bytes))
    }
}

/// Caller-side half of an abort pair.
#[derive(Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    /// Abort every call carrying the paired signal.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }
}

/// Signal observed by a call that the caller may abort.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// Whether the call has been aborted.
    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the call is aborted.
    ///
    /// Never resolves if the handle is dropped without aborting.
    pub async fn aborted(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Create a linked abort handle and signal.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx }, AbortSignal { rx })
}

/// One intercepted outbound call.
#[derive(Debug)]
pub struct OutboundRequest {
    /// Target URL, absolute or relative to the context origin.
    pub url: String,
    /// HTTP method.
    pub method: Method,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body.
    pub body: OutboundBody,
    /// Set on calls the pipeline makes to its own service.
    pub internal: bool,
    /// Optional abort signal supplied by the caller.
    pub signal: Option<AbortSignal>,
}

impl OutboundRequest {
    /// Create a request without a body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: HeaderMap::new(),
            body: OutboundBody::Empty,
            internal: false,
            signal: None,
        }
    }

    /// Create a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Create a POST request with a body.
    pub fn post(url: impl Into<String>, body: impl Into<OutboundBody>) -> Self {
        Self::new(Method::POST, url).body(body)
    }

    /// Set the body.
    pub fn body(mut self, body: impl Into<OutboundBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Attach an abort signal.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Mark this as a call the pipeline makes on its own behalf.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self.headers.insert(
            HeaderName::from_static(INTERNAL_HEADER),
            HeaderValue::from_static("1"),
        );
        self
    }

    /// Whether this call carries either re-entrancy marker.
    pub fn is_internal(&self) -> bool {
        self.internal || self.headers.contains_key(INTERNAL_HEADER)
    }

    /// Whether the caller has already aborted.
    pub fn is_aborted(&self) -> bool {
        self.signal.as_ref().is_some_and(AbortSignal::is_aborted)
    }

    /// Split into the open half and body of an XHR-style call.
    pub fn into_xhr(self) -> (XhrOpened, OutboundBody) {
        let opened = XhrOpened {
            method: self.method,
            url: self.url,
            headers: self.headers,
            internal: self.internal,
            signal: self.signal,
        };
        (opened, self.body)
    }
}

/// The `open` half of an XHR-style call: method and URL recorded ahead of
/// `send`.
#[derive(Debug, Clone)]
pub struct XhrOpened {
    /// HTTP method given to `open`.
    pub method: Method,
    /// URL given to `open`.
    pub url: String,
    /// Headers set between `open` and `send`.
    pub headers: HeaderMap,
    /// Set on calls the pipeline makes to its own service.
    pub internal: bool,
    /// Optional abort signal.
    pub signal: Option<AbortSignal>,
}

impl XhrOpened {
    /// Open a call.
    pub fn open(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            internal: false,
            signal: None,
        }
    }

    /// Set a request header.
    pub fn set_request_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach an abort signal.
    pub fn with_signal(mut self, signal: AbortSignal) -> Self {
        self.signal = Some(signal);
        self
    }

    /// Combine with a body into a single request.
    pub fn into_request(self, body: OutboundBody) -> OutboundRequest {
        OutboundRequest {
            url: self.url,
            method: self.method,
            headers: self.headers,
            body,
            internal: self.internal,
            signal: self.signal,
        }
    }
}

/// One-shot network primitive.
#[async_trait]
pub trait Fetch: Send + Sync {
    /// Dispatch a request and return the response.
    async fn fetch(&self, request: OutboundRequest) -> TransportResult<Response<ShieldBody>>;
}

/// Send half of the open/send network primitive.
#[async_trait]
pub trait XhrSend: Send + Sync {
    /// Send a previously opened call with a body.
    async fn send(
        &self,
        opened: XhrOpened,
        body: OutboundBody,
    ) -> TransportResult<Response<ShieldBody>>;
}

/// The pair of network primitives of one browsing context.
#[derive(Clone)]
pub struct Primitives {
    /// One-shot primitive.
    pub fetch: Arc<dyn Fetch>,
    /// Open/send primitive.
    pub xhr: Arc<dyn XhrSend>,
}

impl Primitives {
    /// Bundle two primitives.
    pub fn new(fetch: Arc<dyn Fetch>, xhr: Arc<dyn XhrSend>) -> Self {
        Self { fetch, xhr }
    }

    /// Use one transport for both primitives.
    pub fn shared<T>(transport: Arc<T>) -> Self
    where
        T: Fetch + XhrSend + 'static,
    {
        Self {
            fetch: transport.clone(),
            xhr: transport,
        }
    }
}

/// Plain HTTP/1.1 transport.
#[derive(Clone)]
pub struct HyperTransport {
    client: Client<HttpConnector, ShieldBody>,
    timeout: Option<Duration>,
}

impl HyperTransport {
    /// Create a transport with no overall timeout.
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
            timeout: None,
        }
    }

    /// Bound the time to receive response headers.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn dispatch(&self, request: OutboundRequest) -> TransportResult<Response<ShieldBody>> {
        let OutboundRequest {
            url,
            method,
            headers,
            body,
            signal,
            ..
        } = request;

        let uri: Uri = url
            .parse()
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {}", url, e)))?;

        let mut req = Request::new(body.into_body());
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        *req.headers_mut() = headers;

        trace!("Dispatching {} {}", req.method(), url);

        let call = async {
            let pending = self.client.request(req);
            let result = match self.timeout {
                Some(timeout) => tokio::time::timeout(timeout, pending)
                    .await
                    .map_err(|_| TransportError::Timeout)?,
                None => pending.await,
            };
            result.map_err(|e| TransportError::Upstream {
                url: url.clone(),
                message: e.to_string(),
            })
        };

        let response = match signal {
            Some(signal) => {
                tokio::select! {
                    _ = signal.aborted() => return Err(TransportError::Aborted),
                    result = call => result?,
                }
            }
            None => call.await?,
        };

        Ok(response.map(|body| body.map_err(BodyError::from).boxed()))
    }
}

impl Default for HyperTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fetch for HyperTransport {
    async fn fetch(&self, request: OutboundRequest) -> TransportResult<Response<ShieldBody>> {
        self.dispatch(request).await
    }
}

#[async_trait]
impl XhrSend for HyperTransport {
    async fn send(
        &self,
        opened: XhrOpened,
        body: OutboundBody,
    ) -> TransportResult<Response<ShieldBody>> {
        self.dispatch(opened.into_request(body)).await
    }
}
