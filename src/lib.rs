//! shadow-shield: outbound interception with shadow tokens
//!
//! This crate swaps sensitive text in outgoing request bodies for shadow
//! tokens issued by a local classification service, and puts the real
//! values back into responses before they reach the page.
//!
//! # Failure Model
//!
//! The pipeline is **fail-open**: when the classifier, the vault or the
//! consent prompt is unavailable, the original request goes out unchanged and
//! the original response comes back unchanged. The pipeline never blocks
//! traffic because of its own failures.
//!
//! # Architecture
//!
//! - **Intercept**: scan, consent, dispatch and rehydrate, installed once per
//!   browsing context through injected network primitives
//! - **Proxy**: local HTTP forward proxy hosting one context per connection
//! - **Config**: Hierarchical TOML configuration with per-context overrides
//! - **Telemetry**: Structured syslog logging for audit trails

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod intercept;
pub mod proxy;
pub mod telemetry;
