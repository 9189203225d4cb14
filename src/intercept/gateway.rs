//! Client for the local classification/vault service.
//!
//! The service owns detection and token storage; this client only ships
//! text to it and interprets the answers:
//!
//! | Call | Method | Request | Response |
//! |---|---|---|---|
//! | `process_text` | POST | `{ text }` | `{ sanitized, text }` |
//! | `vault/rehydrate` | POST | `{ text }` | `{ replaced, text }` |
//! | `vault/mappings` | GET | - | `[{ id, type, fake_val, created_at }]` |
//! | `vault/reveal/{id}` | GET | - | `{ real_val }` |
//!
//! Every call is marked internal so an interception layer sitting on the
//! same transport never scans it. Scanning is advisory: [`Classifier::scan`]
//! and [`Classifier::rehydrate`] fail open.

use super::error::GatewayError;
use super::transport::{Fetch, HyperTransport, OutboundRequest};
use crate::config::Config;
use async_trait::async_trait;
use http_body_util::BodyExt;
use hyper::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use hyper::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default timeout for one service call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on text shipped to the scanner, in bytes.
pub const DEFAULT_MAX_SCAN_BYTES: usize = 50_000;

/// Answer of the `process_text` endpoint.
///
/// A reply claiming `sanitized` without a `text` field fails to decode.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "ScanReply")]
pub struct ScanResult {
    /// Whether the service replaced sensitive spans.
    pub sanitized: bool,
    /// Candidate replacement body. Meaningless when `sanitized` is false.
    pub text: String,
}

/// `process_text` reply as sent on the wire.
#[derive(Deserialize)]
struct ScanReply {
    sanitized: bool,
    #[serde(default)]
    text: Option<String>,
}

impl TryFrom<ScanReply> for ScanResult {
    type Error = String;

    fn try_from(reply: ScanReply) -> Result<Self, Self::Error> {
        match (reply.sanitized, reply.text) {
            (true, None) => Err("sanitized reply without text".to_string()),
            (sanitized, text) => Ok(Self {
                sanitized,
                text: text.unwrap_or_default(),
            }),
        }
    }
}

impl ScanResult {
    /// A result that leaves the body untouched.
    pub fn unchanged() -> Self {
        Self {
            sanitized: false,
            text: String::new(),
        }
    }

    /// The replacement text, only when the service sanitized.
    pub fn replacement(&self) -> Option<&str> {
        self.sanitized.then_some(self.text.as_str())
    }
}

/// Answer of the `vault/rehydrate` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RehydrationResult {
    /// Number of tokens substituted back.
    #[serde(default)]
    pub replaced: u64,
    /// Rehydrated text.
    #[serde(default)]
    pub text: String,
}

impl RehydrationResult {
    /// A result with nothing replaced.
    pub fn unchanged() -> Self {
        Self {
            replaced: 0,
            text: String::new(),
        }
    }

    /// The rehydrated text, only when something was replaced.
    pub fn into_text(self) -> Option<String> {
        (self.replaced > 0).then_some(self.text)
    }
}

/// One stored token mapping, as listed by the vault.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VaultMapping {
    /// Vault row identifier.
    pub id: i64,
    /// Kind of sensitive value (EMAIL, PHONE, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// The shadow token that replaced the value.
    pub fake_val: String,
    /// When the mapping was created.
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Answer of the `vault/reveal/{id}` endpoint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RevealedValue {
    /// The original sensitive value.
    pub real_val: String,
}

#[derive(Serialize)]
struct TextPayload<'a> {
    text: &'a str,
}

/// Scan and rehydrate operations the pipeline depends on.
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Scan text, reporting service failures.
    async fn try_scan(&self, text: &str) -> Result<ScanResult, GatewayError>;

    /// Rehydrate text, reporting service failures.
    async fn try_rehydrate(&self, text: &str) -> Result<RehydrationResult, GatewayError>;

    /// Scan text; any failure yields an unsanitized result.
    async fn scan(&self, text: &str) -> ScanResult {
        match self.try_scan(text).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Scan unavailable, leaving body unchanged: {}", e);
                ScanResult::unchanged()
            }
        }
    }

    /// Rehydrate text; any failure yields zero replacements.
    async fn rehydrate(&self, text: &str) -> RehydrationResult {
        match self.try_rehydrate(text).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Rehydration unavailable: {}", e);
                RehydrationResult::unchanged()
            }
        }
    }
}

/// HTTP client for the local service.
pub struct GatewayClient {
    /// Base URL without a trailing slash.
    base_url: String,
    /// Transport used for every call.
    transport: Arc<dyn Fetch>,
    /// Timeout covering request and response body.
    timeout: Duration,
    /// Texts longer than this are never shipped.
    max_scan_bytes: usize,
}

impl GatewayClient {
    /// Create a client for a service base URL.
    pub fn new(base_url: &str, transport: Arc<dyn Fetch>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transport,
            timeout: DEFAULT_TIMEOUT,
            max_scan_bytes: DEFAULT_MAX_SCAN_BYTES,
        }
    }

    /// Create a client from configuration, over a plain HTTP transport.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.service.url_or_default(), Arc::new(HyperTransport::new()))
            .with_timeout(config.service.timeout())
            .with_max_scan_bytes(config.interception.max_scan_bytes())
    }

    /// Set the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the scan size cap.
    pub fn with_max_scan_bytes(mut self, max: usize) -> Self {
        self.max_scan_bytes = max;
        self
    }

    /// Full URL of an endpoint.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// List stored token mappings.
    pub async fn mappings(&self) -> Result<Vec<VaultMapping>, GatewayError> {
        self.call(Method::GET, "vault/mappings", None).await
    }

    /// Reveal the real value behind a mapping.
    pub async fn reveal(&self, id: &str) -> Result<RevealedValue, GatewayError> {
        self.call(Method::GET, &format!("vault/reveal/{}", id), None)
            .await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        text: Option<&str>,
    ) -> Result<T, GatewayError> {
        let url = self.endpoint(path);
        let mut request = OutboundRequest::new(method, &url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .internal();

        if let Some(text) = text {
            let payload = serde_json::to_string(&TextPayload { text })?;
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(payload);
        }

        let exchange = async {
            let response = self.transport.fetch(request).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(GatewayError::Status(status.as_u16()));
            }
            let bytes = response
                .into_body()
                .collect()
                .await
                .map_err(|e| GatewayError::Unavailable(e.to_string()))?
                .to_bytes();
            Ok(serde_json::from_slice::<T>(&bytes)?)
        };

        let result = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| GatewayError::Timeout(self.timeout.as_millis() as u64))?;

        debug!("Service call {} -> {}", url, if result.is_ok() { "ok" } else { "error" });
        result
    }
}

#[async_trait]
impl Classifier for GatewayClient {
    async fn try_scan(&self, text: &str) -> Result<ScanResult, GatewayError> {
        if text.len() > self.max_scan_bytes {
            return Err(GatewayError::Oversized {
                len: text.len(),
                max: self.max_scan_bytes,
            });
        }
        self.call(Method::POST, "process_text", Some(text)).await
    }

    async fn try_rehydrate(&self, text: &str) -> Result<RehydrationResult, GatewayError> {
        self.call(Method::POST, "vault/rehydrate", Some(text)).await
    }
}
