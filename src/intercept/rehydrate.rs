//! Substitutes real values back for shadow tokens in responses.
//!
//! The matcher decides from the response head alone whether the body may be
//! buffered. Streams, binary media, encoded bodies and anything over the size
//! cap go straight back to the caller untouched. Otherwise the body is read
//! once. If it holds no sentinel, or the vault replaces nothing, the caller
//! gets a response rebuilt from the original head and the exact original
//! bytes. The caller never sees a partially rehydrated body.

use super::error::TransportError;
use super::gateway::Classifier;
use super::transport::{BodyError, ShieldBody, full_body};
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Frame, SizeHint};
use hyper::header::{
    CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, TRANSFER_ENCODING,
};
use hyper::Response;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, trace};

/// Default sentinel every shadow token starts with.
pub const DEFAULT_SENTINEL: &str = "[RS-";

/// Default cap on buffered response bodies (4 MiB).
pub const DEFAULT_MAX_REHYDRATE_BYTES: usize = 4 * 1024 * 1024;

/// Media types delivered incrementally.
const STREAMING_TYPES: &[&str] = &["text/event-stream", "application/x-ndjson"];

/// Media type prefixes that never carry text.
const BINARY_PREFIXES: &[&str] = &["image/", "audio/", "video/", "font/"];

/// Why a response was returned without reading its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Status outside 2xx.
    NotSuccess,
    /// Incrementally delivered body.
    Streaming,
    /// Binary media type.
    Binary,
    /// Compressed or otherwise encoded body.
    Encoded,
    /// Body larger than the cap.
    Oversized,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SkipReason::NotSuccess => "non-success status",
            SkipReason::Streaming => "streaming content type",
            SkipReason::Binary => "binary content type",
            SkipReason::Encoded => "encoded body",
            SkipReason::Oversized => "body over size cap",
        };
        f.write_str(text)
    }
}

/// What the matcher did with one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RehydrationOutcome {
    /// Returned without reading the body.
    Skipped(SkipReason),
    /// Body read; no sentinel or not text.
    NoTokens,
    /// The vault found nothing to replace.
    NothingReplaced,
    /// The vault could not be reached.
    Unavailable(String),
    /// Tokens were replaced.
    Rehydrated(u64),
}

/// Rehydrates shadow tokens in responses through a [`Classifier`].
#[derive(Clone)]
pub struct RehydrationMatcher {
    classifier: Arc<dyn Classifier>,
    sentinel: String,
    max_bytes: usize,
}

impl RehydrationMatcher {
    /// Create a matcher with the default sentinel and size cap.
    pub fn new(classifier: Arc<dyn Classifier>) -> Self {
        Self {
            classifier,
            sentinel: DEFAULT_SENTINEL.to_string(),
            max_bytes: DEFAULT_MAX_REHYDRATE_BYTES,
        }
    }

    /// Use a different sentinel substring.
    pub fn with_sentinel(mut self, sentinel: impl Into<String>) -> Self {
        self.sentinel = sentinel.into();
        self
    }

    /// Use a different buffering cap.
    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Decide from the head whether the body must be left alone.
    pub fn skip_reason<B>(&self, response: &Response<B>) -> Option<SkipReason> {
        if !response.status().is_success() {
            return Some(SkipReason::NotSuccess);
        }

        let headers = response.headers();
        if let Some(encoding) = headers.get(CONTENT_ENCODING).and_then(|v| v.to_str().ok())
            && !encoding.trim().eq_ignore_ascii_case("identity")
        {
            return Some(SkipReason::Encoded);
        }

        if let Some(content_type) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            let media = content_type
                .split(';')
                .next()
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if STREAMING_TYPES.contains(&media.as_str()) {
                return Some(SkipReason::Streaming);
            }
            if media == "application/octet-stream"
                || BINARY_PREFIXES.iter().any(|p| media.starts_with(p))
            {
                return Some(SkipReason::Binary);
            }
        }

        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_bytes) {
            return Some(SkipReason::Oversized);
        }

        None
    }

    /// Rehydrate a response if it carries tokens.
    ///
    /// # Errors
    ///
    /// Returns an error only when reading the original body fails, which the
    /// caller would have seen reading it anyway.
    pub async fn apply(
        &self,
        response: Response<ShieldBody>,
    ) -> Result<(Response<ShieldBody>, RehydrationOutcome), TransportError> {
        if let Some(reason) = self.skip_reason(&response) {
            trace!("Rehydration skipped: {}", reason);
            return Ok((response, RehydrationOutcome::Skipped(reason)));
        }

        let (mut parts, mut body) = response.into_parts();
        let mut buffered = BytesMut::new();

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| TransportError::Body(e.to_string()))?;
            if let Ok(data) = frame.into_data() {
                buffered.extend_from_slice(&data);
            }
            if buffered.len() > self.max_bytes {
                // Undeclared length over the cap: hand back what was read
                // followed by the rest of the stream.
                debug!("Response body exceeded {} bytes, not rehydrating", self.max_bytes);
                let body = BoxBody::new(Prefixed {
                    prefix: Some(buffered.freeze()),
                    rest: body,
                });
                return Ok((
                    Response::from_parts(parts, body),
                    RehydrationOutcome::Skipped(SkipReason::Oversized),
                ));
            }
        }

        let original: Bytes = buffered.freeze();
        let text = match std::str::from_utf8(&original) {
            Ok(text) if text.contains(&self.sentinel) => text,
            _ => {
                return Ok((
                    Response::from_parts(parts, full_body(original)),
                    RehydrationOutcome::NoTokens,
                ));
            }
        };

        let outcome = match self.classifier.try_rehydrate(text).await {
            Ok(result) if result.replaced > 0 => {
                let replaced = result.replaced;
                // The rebuilt body is sent whole; a chunked framing header
                // alongside Content-Length makes the response unencodable.
                parts.headers.remove(TRANSFER_ENCODING);
                parts
                    .headers
                    .insert(CONTENT_LENGTH, HeaderValue::from(result.text.len()));
                debug!("Rehydrated {} token(s)", replaced);
                return Ok((
                    Response::from_parts(parts, full_body(result.text)),
                    RehydrationOutcome::Rehydrated(replaced),
                ));
            }
            Ok(_) => RehydrationOutcome::NothingReplaced,
            Err(e) => RehydrationOutcome::Unavailable(e.to_string()),
        };

        Ok((Response::from_parts(parts, full_body(original)), outcome))
    }
}

/// Body yielding already-read bytes before the remainder of a stream.
struct Prefixed {
    prefix: Option<Bytes>,
    rest: ShieldBody,
}

impl Body for Prefixed {
    type Data = Bytes;
    type Error = BodyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if let Some(prefix) = self.prefix.take() {
            return Poll::Ready(Some(Ok(Frame::data(prefix))));
        }
        Pin::new(&mut self.rest).poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.prefix.is_none() && self.rest.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        let mut hint = self.rest.size_hint();
        if let Some(prefix) = &self.prefix {
            let len = prefix.len() as u64;
            hint.set_lower(hint.lower() + len);
            if let Some(upper) = hint.upper() {
                hint.set_upper(upper + len);
            }
        }
        hint
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::testing::FakeClassifier;
    use hyper::StatusCode;

    fn matcher(classifier: Arc<FakeClassifier>) -> RehydrationMatcher {
        RehydrationMatcher::new(classifier)
    }

    fn response(status: StatusCode, content_type: &str, body: &str) -> Response<ShieldBody> {
        Response::builder()
            .status(status)
            .header(CONTENT_TYPE, content_type)
            .header("x-trace", "abc")
            .body(full_body(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response<ShieldBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn classifier() -> Arc<FakeClassifier> {
        Arc::new(FakeClassifier::new().replacing("a@b.com", "[RS-MAIL-001]"))
    }

    #[tokio::test]
    async fn test_tokens_replaced_and_head_preserved() {
        let classifier = classifier();
        let original = response(StatusCode::CREATED, "application/json", r#"{"to":"[RS-MAIL-001]"}"#);

        let (rebuilt, outcome) = matcher(classifier.clone()).apply(original).await.unwrap();
        assert_eq!(outcome, RehydrationOutcome::Rehydrated(1));
        assert_eq!(rebuilt.status(), StatusCode::CREATED);
        assert_eq!(rebuilt.headers()["x-trace"], "abc");
        assert_eq!(rebuilt.headers()[CONTENT_LENGTH], r#"{"to":"a@b.com"}"#.len().to_string().as_str());
        assert_eq!(body_text(rebuilt).await, r#"{"to":"a@b.com"}"#);
    }

    #[tokio::test]
    async fn test_chunked_framing_replaced_by_length() {
        let mut original = response(StatusCode::OK, "text/plain", "mail [RS-MAIL-001]");
        original
            .headers_mut()
            .insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let (rebuilt, outcome) = matcher(classifier()).apply(original).await.unwrap();
        assert_eq!(outcome, RehydrationOutcome::Rehydrated(1));
        assert!(!rebuilt.headers().contains_key(TRANSFER_ENCODING));
        assert_eq!(rebuilt.headers()[CONTENT_LENGTH], "mail a@b.com".len().to_string().as_str());
        assert_eq!(body_text(rebuilt).await, "mail a@b.com");
    }

    #[tokio::test]
    async fn test_no_sentinel_skips_vault_and_keeps_body() {
        let classifier = classifier();
        let original = response(StatusCode::OK, "text/html", "<p>hello</p>");

        let (rebuilt, outcome) = matcher(classifier.clone()).apply(original).await.unwrap();
        assert_eq!(outcome, RehydrationOutcome::NoTokens);
        assert_eq!(classifier.rehydrate_count(), 0);
        assert_eq!(rebuilt.headers()["x-trace"], "abc");
        assert_eq!(body_text(rebuilt).await, "<p>hello</p>");
    }

    #[tokio::test]
    async fn test_zero_replacements_keep_original() {
        let classifier = Arc::new(FakeClassifier::new());
        let original = response(StatusCode::OK, "text/plain", "unknown [RS-XYZ-999] token");

        let (rebuilt, outcome) = matcher(classifier.clone()).apply(original).await.unwrap();
        assert_eq!(outcome, RehydrationOutcome::NothingReplaced);
        assert_eq!(classifier.rehydrate_count(), 1);
        assert_eq!(body_text(rebuilt).await, "unknown [RS-XYZ-999] token");
    }

    #[tokio::test]
    async fn test_vault_failure_keeps_original() {
        let classifier = Arc::new(FakeClassifier::new().failing());
        let original = response(StatusCode::OK, "text/plain", "mail [RS-MAIL-001]");

        let (rebuilt, outcome) = matcher(classifier).apply(original).await.unwrap();
        assert!(matches!(outcome, RehydrationOutcome::Unavailable(_)));
        assert_eq!(body_text(rebuilt).await, "mail [RS-MAIL-001]");
    }

    #[tokio::test]
    async fn test_event_stream_is_not_read() {
        let classifier = classifier();
        let original = response(StatusCode::OK, "text/event-stream; charset=utf-8", "data: [RS-MAIL-001]\n\n");

        let (rebuilt, outcome) = matcher(classifier.clone()).apply(original).await.unwrap();
        assert_eq!(outcome, RehydrationOutcome::Skipped(SkipReason::Streaming));
        assert_eq!(classifier.rehydrate_count(), 0);
        assert_eq!(body_text(rebuilt).await, "data: [RS-MAIL-001]\n\n");
    }

    #[test]
    fn test_skip_reasons_from_head() {
        let m = matcher(classifier());
        assert_eq!(
            m.skip_reason(&response(StatusCode::NOT_FOUND, "text/plain", "")),
            Some(SkipReason::NotSuccess)
        );
        assert_eq!(
            m.skip_reason(&response(StatusCode::OK, "image/png", "")),
            Some(SkipReason::Binary)
        );
        assert_eq!(
            m.skip_reason(&response(StatusCode::OK, "application/x-ndjson", "")),
            Some(SkipReason::Streaming)
        );
        assert_eq!(m.skip_reason(&response(StatusCode::OK, "application/json", "")), None);

        let mut gz = response(StatusCode::OK, "text/plain", "");
        gz.headers_mut().insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(m.skip_reason(&gz), Some(SkipReason::Encoded));
    }

    #[test]
    fn test_declared_length_over_cap_is_skipped() {
        let m = matcher(classifier()).with_max_bytes(10);
        let mut big = response(StatusCode::OK, "text/plain", "");
        big.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(11usize));
        assert_eq!(m.skip_reason(&big), Some(SkipReason::Oversized));
    }

    #[tokio::test]
    async fn test_undeclared_body_over_cap_is_returned_whole() {
        let classifier = classifier();
        let m = matcher(classifier.clone()).with_max_bytes(8);
        let original = response(StatusCode::OK, "text/plain", "mail [RS-MAIL-001] please");

        let (rebuilt, outcome) = m.apply(original).await.unwrap();
        assert_eq!(outcome, RehydrationOutcome::Skipped(SkipReason::Oversized));
        assert_eq!(classifier.rehydrate_count(), 0);
        assert_eq!(body_text(rebuilt).await, "mail [RS-MAIL-001] please");
    }

    #[tokio::test]
    async fn test_custom_sentinel() {
        let classifier = Arc::new(FakeClassifier::new().replacing("x", "<<T1>>"));
        let m = matcher(classifier).with_sentinel("<<T");
        let (rebuilt, outcome) = m
            .apply(response(StatusCode::OK, "text/plain", "value <<T1>>"))
            .await
            .unwrap();
        assert_eq!(outcome, RehydrationOutcome::Rehydrated(1));
        assert_eq!(body_text(rebuilt).await, "value x");
    }
}
