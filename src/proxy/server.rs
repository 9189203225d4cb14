//! HTTP proxy server implementation.
//!
//! This module provides the main proxy server that:
//! - Listens for browser connections on a local TCP address
//! - Installs interception once per client connection
//! - Forwards plain HTTP requests through the wrapped primitives
//! - Relays CONNECT tunnels opaquely
//!
//! # Architecture
//!
//! The proxy uses hyper's HTTP/1.1 server with upgrade support for CONNECT.
//! Each connection is handled in a separate Tokio task and is its own
//! [`BrowsingContext`], labelled `conn-<peer>`. Per-client overrides are
//! looked up in `[contexts."<client ip>"]`.
//!
//! # Example
//!
//! ```ignore
//! use shadow_shield::proxy::ProxyServerBuilder;
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let server = ProxyServerBuilder::new(intercept)
//!     .listen("127.0.0.1:8899".parse()?)
//!     .bind(shutdown_rx)
//!     .await?;
//! let totals = server.run().await?;
//!
//! // To shutdown:
//! shutdown_tx.send(true)?;
//! ```

use super::error::{ProxyError, ProxyResult};
use super::forward::handle_request;
use crate::config::{Config, DEFAULT_LISTEN};
use crate::intercept::{
    BrowsingContext, HyperTransport, InterceptConfig, Interception, Primitives, StatsSnapshot,
    install_interception,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Configuration for the proxy server.
#[derive(Clone)]
pub struct ProxySettings {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Pipeline configuration shared by every connection.
    pub intercept: InterceptConfig,
    /// Primitives that perform the real dispatch.
    pub originals: Primitives,
    /// Loaded configuration, for per-client context overrides.
    pub config: Arc<Config>,
}

/// Counters of every connection served in this session.
#[derive(Default)]
pub struct SessionTotals {
    finished: Mutex<StatsSnapshot>,
    live: Mutex<HashMap<Uuid, Arc<Interception>>>,
}

impl SessionTotals {
    /// Create empty totals.
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, interception: Arc<Interception>) {
        self.live
            .lock()
            .unwrap()
            .insert(interception.context_id(), interception);
    }

    fn close(&self, context_id: Uuid) {
        let closed = self.live.lock().unwrap().remove(&context_id);
        if let Some(interception) = closed {
            self.finished.lock().unwrap().merge(&interception.stats());
        }
    }

    /// Number of connections currently open.
    pub fn live_connections(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    /// Sum of closed and open connections' counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut totals = *self.finished.lock().unwrap();
        for interception in self.live.lock().unwrap().values() {
            totals.merge(&interception.stats());
        }
        totals
    }
}

/// The main proxy server.
pub struct ProxyServer {
    settings: Arc<ProxySettings>,
    listener: TcpListener,
    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
    totals: Arc<SessionTotals>,
}

impl ProxyServer {
    /// Bind the listening socket.
    ///
    /// # Arguments
    ///
    /// * `settings` - Proxy configuration.
    /// * `shutdown_rx` - Receiver for shutdown signal.
    pub async fn bind(
        settings: ProxySettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> ProxyResult<Self> {
        let listener = TcpListener::bind(settings.listen).await?;

        Ok(Self {
            settings: Arc::new(settings),
            listener,
            shutdown_rx,
            totals: Arc::new(SessionTotals::new()),
        })
    }

    /// Address the server actually listens on.
    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Session counters, readable while the server runs.
    pub fn totals(&self) -> Arc<SessionTotals> {
        self.totals.clone()
    }

    /// Run the proxy server.
    ///
    /// Returns the session totals when the shutdown signal is received.
    pub async fn run(self) -> ProxyResult<StatsSnapshot> {
        info!("Proxy listening on {}", self.local_addr()?);

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                accept_result = self.listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            debug!("Accepted connection from {}", peer);
                            self.spawn_connection_handler(stream, peer);
                        }
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Proxy shutting down");
                        break;
                    }
                }
            }
        }

        Ok(self.totals.snapshot())
    }

    /// Spawn a task to handle a single connection.
    fn spawn_connection_handler(&self, stream: TcpStream, peer: SocketAddr) {
        let settings = self.settings.clone();
        let totals = self.totals.clone();

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, settings, totals).await {
                // Don't log connection resets as errors - they're common
                let err_str = e.to_string();
                if err_str.contains("connection reset")
                    || err_str.contains("broken pipe")
                    || err_str.contains("Connection reset")
                {
                    debug!("Connection ended: {}", e);
                } else {
                    warn!("Connection error: {}", e);
                }
            }
        });
    }
}

/// Handle a single client connection.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    settings: Arc<ProxySettings>,
    totals: Arc<SessionTotals>,
) -> ProxyResult<()> {
    let context_settings = settings.config.resolve_context(&peer.ip().to_string());
    let context = Arc::new(BrowsingContext::new(
        format!("conn-{}", peer),
        context_settings,
    ));
    let interception = Arc::new(install_interception(
        &context,
        settings.originals.clone(),
        settings.intercept.clone(),
    )?);
    let context_id = context.id();
    totals.open(interception.clone());

    let max_buffer = settings.intercept.limits.max_bytes;
    let io = TokioIo::new(stream);

    // Create the service that handles each request
    let service = service_fn(move |req: Request<Incoming>| {
        let interception = interception.clone();
        async move { handle_request(req, &interception, max_buffer).await }
    });

    // Serve HTTP/1.1 with support for upgrades (needed for CONNECT)
    let result = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(io, service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from);

    totals.close(context_id);
    debug!("Connection from {} closed", peer);
    drop(context);
    result
}

/// Builder for ProxyServer configuration.
pub struct ProxyServerBuilder {
    listen: Option<SocketAddr>,
    intercept: InterceptConfig,
    originals: Option<Primitives>,
    config: Option<Arc<Config>>,
}

impl ProxyServerBuilder {
    /// Create a new builder around a pipeline configuration.
    pub fn new(intercept: InterceptConfig) -> Self {
        Self {
            listen: None,
            intercept,
            originals: None,
            config: None,
        }
    }

    /// Set the listen address.
    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Set the primitives that perform real dispatch.
    pub fn originals(mut self, originals: Primitives) -> Self {
        self.originals = Some(originals);
        self
    }

    /// Set the configuration used for per-client overrides.
    pub fn config(mut self, config: Arc<Config>) -> Self {
        self.config = Some(config);
        self
    }

    /// Assemble the settings without binding.
    pub fn settings(self) -> ProxyResult<ProxySettings> {
        let listen = match self.listen {
            Some(addr) => addr,
            None => DEFAULT_LISTEN
                .parse()
                .map_err(|e| ProxyError::InvalidRequest(format!("{}: {}", DEFAULT_LISTEN, e)))?,
        };

        Ok(ProxySettings {
            listen,
            intercept: self.intercept,
            originals: self
                .originals
                .unwrap_or_else(|| Primitives::shared(Arc::new(HyperTransport::new()))),
            config: self.config.unwrap_or_default(),
        })
    }

    /// Build and bind the proxy server.
    ///
    /// # Arguments
    ///
    /// * `shutdown_rx` - Receiver for shutdown signal.
    pub async fn bind(self, shutdown_rx: watch::Receiver<bool>) -> ProxyResult<ProxyServer> {
        ProxyServer::bind(self.settings()?, shutdown_rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intercept::testing::FakeClassifier;
    use crate::intercept::{ExclusionGuard, ProtectionMode};
    use std::time::Duration;

    fn intercept() -> InterceptConfig {
        InterceptConfig::new(
            Arc::new(FakeClassifier::new()),
            ExclusionGuard::new("http://127.0.0.1:9000/", &[], &[]),
        )
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_builder_defaults() {
        let settings = ProxyServerBuilder::new(intercept()).settings().unwrap();
        assert_eq!(settings.listen.to_string(), DEFAULT_LISTEN);
        assert_eq!(
            settings.config.resolve_context("127.0.0.1").mode,
            ProtectionMode::Auto
        );
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let (_tx, rx) = watch::channel(false);
        let server = ProxyServerBuilder::new(intercept())
            .listen(loopback())
            .bind(rx)
            .await
            .unwrap();

        let addr = server.local_addr().unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_returns_totals() {
        let (tx, rx) = watch::channel(false);
        let server = ProxyServerBuilder::new(intercept())
            .listen(loopback())
            .bind(rx)
            .await
            .unwrap();
        let totals = server.totals();

        let handle = tokio::spawn(server.run());
        tx.send(true).unwrap();

        let snapshot = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(snapshot, StatsSnapshot::default());
        assert_eq!(totals.live_connections(), 0);
    }

    #[tokio::test]
    async fn test_connection_counts_as_context() {
        let (tx, rx) = watch::channel(false);
        let server = ProxyServerBuilder::new(intercept())
            .listen(loopback())
            .bind(rx)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let totals = server.totals();
        let handle = tokio::spawn(server.run());

        let stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..50 {
            if totals.live_connections() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(totals.live_connections(), 1);

        drop(stream);
        for _ in 0..50 {
            if totals.live_connections() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(totals.live_connections(), 0);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
