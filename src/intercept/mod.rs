//! Outbound interception: sanitize request bodies, rehydrate responses.
//!
//! A host hands the network primitives of a browsing context to
//! [`install_interception`] and uses the wrapped primitives it gets back in
//! their place. For every write-style call carrying a text body, the wrapped
//! primitive asks the local classification service for a sanitized version,
//! in which sensitive spans are replaced by shadow tokens, and sends that
//! instead (after user confirmation in consent mode). Responses containing
//! shadow tokens are passed through the vault so the page sees real values
//! again.
//!
//! # Architecture
//!
//! ```text
//! page ──> WrappedFetch / WrappedXhr
//!              │
//!              ├─ ExclusionGuard      (self traffic, telemetry endpoints)
//!              ├─ Classifier::scan    (POST process_text)
//!              ├─ ConsentPolicy       (auto, or ConfirmationPrompt)
//!              ├─ original primitive  (real dispatch)
//!              └─ RehydrationMatcher  (POST vault/rehydrate)
//! ```
//!
//! Every failure inside the pipeline fails open: the original body is sent,
//! the original response is returned.

pub mod consent;
pub mod error;
pub mod gateway;
pub mod guard;
pub mod hook;
pub mod install;
pub mod rehydrate;
pub mod stats;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use consent::{
    ConfirmationPrompt, ConsentDecision, ConsentHoldManager, ConsentPolicy, ConsentRequest,
    FixedPrompt, HoldError, HoldPrompt, PendingConsent, ProtectionMode, TerminalPrompt,
};
pub use error::{GatewayError, InstallError, TransportError, TransportResult};
pub use gateway::{
    Classifier, GatewayClient, RehydrationResult, RevealedValue, ScanResult, VaultMapping,
};
pub use guard::{BypassReason, ExclusionGuard};
pub use hook::{Outcome, Pipeline, WrappedFetch, WrappedXhr};
pub use install::{
    BrowsingContext, ContextSettings, InterceptConfig, Interception, ScanLimits, ScanStrategy,
    install_interception,
};
pub use rehydrate::{RehydrationMatcher, RehydrationOutcome, SkipReason};
pub use stats::{InterceptStats, StatsSnapshot};
pub use transport::{
    AbortHandle, AbortSignal, BodyError, Fetch, HyperTransport, INTERNAL_HEADER, OutboundBody, OutboundRequest, Primitives,
    ShieldBody, XhrOpened, XhrSend, abort_pair, empty_body, full_body,
};
