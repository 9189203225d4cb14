//! Local HTTP forward proxy hosting the interception pipeline.
//!
//! Browsers configured to use the proxy get every plain HTTP write scanned
//! and every response rehydrated, exactly as an in-page installation would.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────┐   conn   ┌─────────────────────────────┐        ┌──────────┐
//! │ browser  │─────────>│ ProxyServer                 │───────>│ upstream │
//! └──────────┘          │  one BrowsingContext/conn   │        └──────────┘
//!                       │  WrappedFetch / WrappedXhr  │
//!                       └──────────────┬──────────────┘
//!                                      │ process_text, vault/rehydrate
//!                                      ▼
//!                              ┌───────────────┐
//!                              │ local service │
//!                              └───────────────┘
//! ```
//!
//! CONNECT tunnels are relayed without inspection.

pub mod error;
pub mod forward;
pub mod server;

// Re-export main types for convenient access
pub use error::{ProxyError, ProxyResult};
pub use forward::{handle_request, into_outbound, is_textual};
pub use server::{ProxyServer, ProxyServerBuilder, ProxySettings, SessionTotals};
