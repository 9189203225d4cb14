//! Shared fixtures for integration tests.
//!
//! `FakeNetwork` plays both the outside world and the local service: calls
//! under [`SERVICE`] are answered like `process_text` / `vault/rehydrate`,
//! everything else is recorded and answered by a responder closure.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{Value, json};
use shadow_shield::intercept::{
    Classifier, Fetch, GatewayError, OutboundBody, OutboundRequest, RehydrationResult,
    ScanResult, ShieldBody, TransportError, TransportResult, XhrOpened, XhrSend, full_body,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;

/// Base URL of the fake local service.
pub const SERVICE: &str = "http://127.0.0.1:9000/";

/// One call that reached the outside world.
#[derive(Debug, Clone)]
pub struct Seen {
    pub url: String,
    pub method: Method,
    pub body: Option<String>,
    pub via: &'static str,
}

type Responder = Arc<dyn Fn(&Seen) -> Response<ShieldBody> + Send + Sync>;

/// Build a response with a content type and body.
pub fn response(status: StatusCode, content_type: &str, body: &str) -> Response<ShieldBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .header("x-upstream", "yes")
        .body(full_body(body.to_string()))
        .unwrap()
}

/// Read a response body to a string.
pub async fn body_text(response: Response<ShieldBody>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// In-memory network with a built-in token vault.
pub struct FakeNetwork {
    vault: Vec<(String, String)>,
    responder: Responder,
    seen: Mutex<Vec<Seen>>,
    scans: AtomicUsize,
    rehydrations: AtomicUsize,
    service_down: bool,
    service_delay: Option<Duration>,
}

impl FakeNetwork {
    /// A network whose pages answer `200 text/plain "ok"`.
    pub fn new() -> Self {
        Self {
            vault: Vec::new(),
            responder: Arc::new(|_| response(StatusCode::OK, "text/plain", "ok")),
            seen: Mutex::new(Vec::new()),
            scans: AtomicUsize::new(0),
            rehydrations: AtomicUsize::new(0),
            service_down: false,
            service_delay: None,
        }
    }

    /// Teach the vault one sensitive value and its token.
    pub fn token(mut self, real: &str, token: &str) -> Self {
        self.vault.push((real.to_string(), token.to_string()));
        self
    }

    /// Answer page calls with a closure.
    pub fn respond_with<F>(mut self, responder: F) -> Self
    where
        F: Fn(&Seen) -> Response<ShieldBody> + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Pages echo the request body back as text.
    pub fn echoing(self) -> Self {
        self.respond_with(|seen| {
            response(
                StatusCode::OK,
                "text/plain; charset=utf-8",
                seen.body.as_deref().unwrap_or_default(),
            )
        })
    }

    /// Make every service call fail.
    pub fn service_down(mut self) -> Self {
        self.service_down = true;
        self
    }

    /// Delay every service answer.
    pub fn service_delay(mut self, delay: Duration) -> Self {
        self.service_delay = Some(delay);
        self
    }

    /// Calls that reached pages (not the service).
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    /// Body of the only page call.
    pub fn dispatched_body(&self) -> Option<String> {
        let seen = self.seen();
        assert_eq!(seen.len(), 1, "expected exactly one dispatched call");
        seen[0].body.clone()
    }

    /// Number of `process_text` calls.
    pub fn scan_calls(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of `vault/rehydrate` calls.
    pub fn rehydrate_calls(&self) -> usize {
        self.rehydrations.load(Ordering::SeqCst)
    }

    async fn handle(
        &self,
        request: OutboundRequest,
        via: &'static str,
    ) -> TransportResult<Response<ShieldBody>> {
        if request.is_aborted() {
            return Err(TransportError::Aborted);
        }

        if let Some(path) = request.url.strip_prefix(SERVICE) {
            return self.service(path, request.body.as_text()).await;
        }

        let seen = Seen {
            url: request.url.clone(),
            method: request.method.clone(),
            body: request.body.as_text().map(str::to_string),
            via,
        };
        self.seen.lock().unwrap().push(seen.clone());
        Ok((self.responder)(&seen))
    }

    async fn service(
        &self,
        path: &str,
        body: Option<&str>,
    ) -> TransportResult<Response<ShieldBody>> {
        match path {
            "process_text" => self.scans.fetch_add(1, Ordering::SeqCst),
            "vault/rehydrate" => self.rehydrations.fetch_add(1, Ordering::SeqCst),
            _ => 0,
        };

        if let Some(delay) = self.service_delay {
            tokio::time::sleep(delay).await;
        }
        if self.service_down {
            return Err(TransportError::Upstream {
                url: format!("{}{}", SERVICE, path),
                message: "connection refused".to_string(),
            });
        }

        let text = body
            .and_then(|b| serde_json::from_str::<Value>(b).ok())
            .and_then(|v| v["text"].as_str().map(str::to_string))
            .unwrap_or_default();

        let answer = match path {
            "process_text" => {
                let sanitized = self.swap(&text, false);
                json!({ "sanitized": sanitized != text, "text": sanitized })
            }
            "vault/rehydrate" => {
                let replaced = self
                    .vault
                    .iter()
                    .map(|(_, token)| text.matches(token.as_str()).count())
                    .sum::<usize>();
                json!({ "replaced": replaced, "text": self.swap(&text, true) })
            }
            _ => {
                return Ok(response(StatusCode::NOT_FOUND, "application/json", "{}"));
            }
        };
        Ok(response(StatusCode::OK, "application/json", &answer.to_string()))
    }

    fn swap(&self, text: &str, reverse: bool) -> String {
        self.vault.iter().fold(text.to_string(), |acc, (real, token)| {
            if reverse {
                acc.replace(token.as_str(), real)
            } else {
                acc.replace(real.as_str(), token)
            }
        })
    }
}

#[async_trait]
impl Fetch for FakeNetwork {
    async fn fetch(&self, request: OutboundRequest) -> TransportResult<Response<ShieldBody>> {
        self.handle(request, "fetch").await
    }
}

#[async_trait]
impl XhrSend for FakeNetwork {
    async fn send(
        &self,
        opened: XhrOpened,
        body: OutboundBody,
    ) -> TransportResult<Response<ShieldBody>> {
        self.handle(opened.into_request(body), "xhr").await
    }
}

/// Classifier with a fixed vault, for hosts that do not need the wire.
pub struct VaultClassifier {
    vault: Vec<(String, String)>,
}

impl VaultClassifier {
    pub fn new(real: &str, token: &str) -> Self {
        Self {
            vault: vec![(real.to_string(), token.to_string())],
        }
    }
}

#[async_trait]
impl Classifier for VaultClassifier {
    async fn try_scan(&self, text: &str) -> Result<ScanResult, GatewayError> {
        let out = self
            .vault
            .iter()
            .fold(text.to_string(), |acc, (real, token)| acc.replace(real.as_str(), token));
        Ok(ScanResult {
            sanitized: out != text,
            text: out,
        })
    }

    async fn try_rehydrate(&self, text: &str) -> Result<RehydrationResult, GatewayError> {
        let mut replaced = 0;
        let mut out = text.to_string();
        for (real, token) in &self.vault {
            replaced += out.matches(token.as_str()).count() as u64;
            out = out.replace(token.as_str(), real);
        }
        Ok(RehydrationResult { replaced, text: out })
    }
}

/// Start a real HTTP server that echoes request bodies and records them.
pub async fn spawn_echo_upstream() -> (SocketAddr, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let log = log.clone();
                    async move {
                        let bytes = req.into_body().collect().await.unwrap().to_bytes();
                        let text = String::from_utf8_lossy(&bytes).to_string();
                        log.lock().unwrap().push(text.clone());
                        Ok::<_, Infallible>(
                            Response::builder()
                                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                                .body(Full::new(Bytes::from(text)))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, received)
}

/// Spawn a raw upstream answering every request with one chunked body.
pub async fn spawn_chunked_upstream(body: &'static str) -> SocketAddr {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n{:x}\r\n{}\r\n0\r\n\r\n",
                    body.len(),
                    body
                );
                let _ = stream.write_all(reply.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    addr
}

/// Send one request through a forward proxy, as a browser would.
pub async fn send_via_proxy(
    proxy: SocketAddr,
    request: Request<Full<Bytes>>,
) -> (StatusCode, String) {
    let stream = tokio::net::TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let response = sender.send_request(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}
