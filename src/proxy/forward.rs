//! Request forwarding through an installed interception.
//!
//! Plain HTTP requests are turned into [`OutboundRequest`]s and dispatched
//! through the connection's wrapped primitives, so every write passes the
//! scan/consent pipeline and every response passes rehydration.
//!
//! `CONNECT` is handled differently:
//! 1. Parse the target host:port from the request URI
//! 2. Return `200 Connection Established`
//! 3. Relay bytes in both directions after the upgrade
//!
//! The tunnel is opaque; its contents are never inspected.

use super::error::{ProxyError, ProxyResult};
use crate::intercept::{
    BodyError, INTERNAL_HEADER, Interception, OutboundBody, OutboundRequest, ShieldBody,
    empty_body, full_body,
};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::header::{CONTENT_TYPE, HOST, HeaderMap, HeaderName};
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

/// Headers meant for the proxy itself, never forwarded upstream.
const HOP_BY_HOP: [HeaderName; 2] = [
    HeaderName::from_static("proxy-connection"),
    HeaderName::from_static("proxy-authorization"),
];

/// Header pages set on open/send calls.
const REQUESTED_WITH: &str = "x-requested-with";

/// Handle one client request on an intercepted connection.
pub async fn handle_request(
    req: Request<Incoming>,
    interception: &Interception,
    max_buffer: usize,
) -> ProxyResult<Response<ShieldBody>> {
    if req.method() == Method::CONNECT {
        return handle_connect(req);
    }

    let request = match into_outbound(req, max_buffer).await {
        Ok(request) => request,
        Err(ProxyError::InvalidRequest(message)) => {
            debug!("Rejecting proxy request: {}", message);
            return text_response(StatusCode::BAD_REQUEST, message);
        }
        Err(e) => return Err(e),
    };
    let url = request.url.clone();

    let result = if is_xhr(&request.headers) {
        let (opened, body) = request.into_xhr();
        interception.xhr().send(opened, body).await
    } else {
        interception.fetch().fetch(request).await
    };

    match result {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("Forwarding to {} failed: {}", url, e);
            text_response(StatusCode::BAD_GATEWAY, format!("Upstream request failed: {}", e))
        }
    }
}

/// Convert a proxied request into the pipeline's request type.
///
/// Textual bodies of known size within `max_buffer` bytes are buffered as
/// text; everything else is passed along without being read.
pub async fn into_outbound(
    req: Request<Incoming>,
    max_buffer: usize,
) -> ProxyResult<OutboundRequest> {
    let url = absolute_url(&req)?;
    let (parts, body) = req.into_parts();

    let mut headers = parts.headers;
    strip_client_headers(&mut headers);

    let exact = body.size_hint().exact();
    let body = if body.is_end_stream() || exact == Some(0) {
        OutboundBody::Empty
    } else if is_textual(&headers) && exact.is_some_and(|len| len as usize <= max_buffer) {
        let bytes = body.collect().await?.to_bytes();
        match String::from_utf8(bytes.to_vec()) {
            Ok(text) => OutboundBody::Text(text),
            Err(_) => OutboundBody::Binary(bytes),
        }
    } else {
        OutboundBody::Stream(body.map_err(BodyError::from).boxed())
    };

    trace!("Proxying {} {} ({:?})", parts.method, url, body);

    let mut request = OutboundRequest::new(parts.method, url).body(body);
    request.headers = headers;
    Ok(request)
}

/// Drop headers a client must not pass through the proxy.
///
/// The internal marker is reserved for the pipeline's own service calls.
fn strip_client_headers(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(INTERNAL_HEADER);
}

/// Whether the request came from an open/send style call.
fn is_xhr(headers: &HeaderMap) -> bool {
    headers
        .get(REQUESTED_WITH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("XMLHttpRequest"))
}

/// Whether a request body is worth buffering as text.
///
/// A missing content type counts as textual; the bytes decide later.
pub fn is_textual(headers: &HeaderMap) -> bool {
    let Some(value) = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) else {
        return true;
    };
    let essence = value
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json"
                | "application/xml"
                | "application/x-www-form-urlencoded"
                | "application/javascript"
                | "application/graphql"
        )
}

/// Reconstruct the absolute URL of a proxied request.
///
/// Forward-proxy clients send absolute-form targets; origin-form targets
/// are completed from the `Host` header.
fn absolute_url<B>(req: &Request<B>) -> ProxyResult<String> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ProxyError::InvalidRequest("Missing host in request".to_string()))?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Ok(format!("http://{}{}", host, path))
}

/// Open an opaque tunnel for a CONNECT request.
fn handle_connect(req: Request<Incoming>) -> ProxyResult<Response<ShieldBody>> {
    let Some(authority) = req.uri().authority().map(|a| a.to_string()) else {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT requires host:port");
    };
    let (host, port) = match parse_host_port(&authority) {
        Ok(target) => target,
        Err(e) => return text_response(StatusCode::BAD_REQUEST, e.to_string()),
    };

    info!("Relaying CONNECT tunnel to {}:{} without inspection", host, port);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = tunnel(upgraded, &host, port).await {
                    debug!("Tunnel to {}:{} ended: {}", host, port, e);
                }
            }
            Err(e) => {
                warn!("HTTP upgrade failed for {}:{}: {}", host, port, e);
            }
        }
    });

    Ok(Response::new(empty_body()))
}

/// Relay bytes between the client and the target until either side closes.
async fn tunnel(upgraded: hyper::upgrade::Upgraded, host: &str, port: u16) -> ProxyResult<()> {
    let mut upstream = TcpStream::connect((host, port))
        .await
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: format!("{}:{}", host, port),
            message: e.to_string(),
        })?;
    let mut client = TokioIo::new(upgraded);

    let (sent, received) = tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(
        "Tunnel to {}:{} closed ({} bytes up, {} bytes down)",
        host, port, sent, received
    );
    Ok(())
}

/// Parse host:port string from CONNECT authority.
///
/// Examples:
/// - `example.com:443` -> ("example.com", 443)
/// - `example.com` -> ("example.com", 443) (default port)
/// - `[::1]:8443` -> ("::1", 8443)
fn parse_host_port(authority: &str) -> ProxyResult<(String, u16)> {
    let Some((host, port_str)) = authority.rsplit_once(':') else {
        return Ok((authority.to_string(), 443));
    };
    let port = port_str
        .parse::<u16>()
        .map_err(|_| ProxyError::InvalidRequest(format!("Invalid port: {}", port_str)))?;

    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    Ok((host.to_string(), port))
}

/// Plain-text response generated by the proxy itself.
fn text_response(
    status: StatusCode,
    message: impl Into<String>,
) -> ProxyResult<Response<ShieldBody>> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(message.into()))?)
}
