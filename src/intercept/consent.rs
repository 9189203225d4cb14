//! Consent policy for sanitized bodies.
//!
//! In `auto` mode a positive scan is applied without asking. In `consent`
//! mode the pipeline asks a [`ConfirmationPrompt`] and waits for the answer;
//! the prompt is injected so the pipeline never talks to a UI directly.
//!
//! Three prompts ship with the crate:
//!
//! - [`FixedPrompt`] always gives the same answer (headless hosts, tests).
//! - [`HoldPrompt`] parks the question in a [`ConsentHoldManager`] so a host
//!   UI can list and answer it.
//! - [`TerminalPrompt`] asks on stderr and reads the answer from stdin.
//!
//! Every prompt is bounded by a timeout. An unanswered question resolves to
//! the configured timeout decision, which defaults to applying the sanitized
//! body. Declines are not remembered: every qualifying request asks again.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

/// Characters of sanitized text shown in a prompt.
const PREVIEW_CHARS: usize = 80;

/// How a context treats positive scan results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionMode {
    /// Apply sanitized bodies without asking.
    #[default]
    Auto,
    /// Ask before applying each sanitized body.
    Consent,
}

impl fmt::Display for ProtectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtectionMode::Auto => write!(f, "auto"),
            ProtectionMode::Consent => write!(f, "consent"),
        }
    }
}

impl FromStr for ProtectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(ProtectionMode::Auto),
            "consent" => Ok(ProtectionMode::Consent),
            other => Err(format!("unknown mode '{}' (expected auto or consent)", other)),
        }
    }
}

/// Answer to one consent question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsentDecision {
    /// Send the sanitized body.
    #[default]
    Apply,
    /// Send the original body.
    Decline,
}

impl ConsentDecision {
    /// Whether the sanitized body should be sent.
    pub fn is_apply(self) -> bool {
        self == ConsentDecision::Apply
    }
}

impl FromStr for ConsentDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "apply" => Ok(ConsentDecision::Apply),
            "decline" => Ok(ConsentDecision::Decline),
            other => Err(format!(
                "unknown decision '{}' (expected apply or decline)",
                other
            )),
        }
    }
}

/// What a prompt is asked about.
///
/// Carries only the sanitized text, never the original body.
#[derive(Debug, Clone, Serialize)]
pub struct ConsentRequest {
    /// Context the call came from.
    pub context_id: Uuid,
    /// Human-readable context label.
    pub context_label: String,
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Leading part of the sanitized body.
    pub preview: String,
}

impl ConsentRequest {
    /// Build a question, truncating the sanitized text to a preview.
    pub fn new(
        context_id: Uuid,
        context_label: impl Into<String>,
        url: impl Into<String>,
        method: impl Into<String>,
        sanitized: &str,
    ) -> Self {
        let mut preview: String = sanitized.chars().take(PREVIEW_CHARS).collect();
        if sanitized.chars().nth(PREVIEW_CHARS).is_some() {
            preview.push_str("...");
        }
        Self {
            context_id,
            context_label: context_label.into(),
            url: url.into(),
            method: method.into(),
            preview,
        }
    }
}

/// Capability to ask the user whether to send a sanitized body.
#[async_trait]
pub trait ConfirmationPrompt: Send + Sync {
    /// Ask and wait for the answer.
    async fn confirm(&self, request: &ConsentRequest) -> ConsentDecision;
}

/// Decides whether a positive scan result is applied.
#[derive(Clone)]
pub struct ConsentPolicy {
    prompt: Arc<dyn ConfirmationPrompt>,
}

impl ConsentPolicy {
    /// Create a policy asking the given prompt in consent mode.
    pub fn new(prompt: Arc<dyn ConfirmationPrompt>) -> Self {
        Self { prompt }
    }

    /// Whether to send the sanitized body.
    ///
    /// Only meaningful for sanitized scan results. Consent mode waits for the
    /// prompt.
    pub async fn should_apply(&self, mode: ProtectionMode, request: &ConsentRequest) -> bool {
        match mode {
            ProtectionMode::Auto => true,
            ProtectionMode::Consent => {
                let decision = self.prompt.confirm(request).await;
                debug!(
                    "Consent for {} {} in {}: {:?}",
                    request.method, request.url, request.context_label, decision
                );
                decision.is_apply()
            }
        }
    }
}

impl Default for ConsentPolicy {
    fn default() -> Self {
        Self::new(Arc::new(FixedPrompt(ConsentDecision::Apply)))
    }
}

/// Prompt that always gives the same answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompt(pub ConsentDecision);

#[async_trait]
impl ConfirmationPrompt for FixedPrompt {
    async fn confirm(&self, _request: &ConsentRequest) -> ConsentDecision {
        self.0
    }
}

/// A question waiting for an answer.
struct PendingQuestion {
    request: ConsentRequest,
    asked_at: Instant,
    decision_tx: oneshot::Sender<ConsentDecision>,
}

/// Snapshot of a pending question, for a host UI.
#[derive(Debug, Clone, Serialize)]
pub struct PendingConsent {
    /// Identifier to answer with.
    pub id: Uuid,
    /// Context label.
    pub context_label: String,
    /// Target URL.
    pub url: String,
    /// HTTP method.
    pub method: String,
    /// Sanitized preview.
    pub preview: String,
    /// Seconds spent waiting so far.
    pub waiting_secs: u64,
}

/// Holds consent questions until a host UI answers them.
pub struct ConsentHoldManager {
    pending: Mutex<HashMap<Uuid, PendingQuestion>>,
    timeout: Duration,
    timeout_decision: ConsentDecision,
}

impl ConsentHoldManager {
    /// Create a manager.
    ///
    /// # Arguments
    ///
    /// * `timeout` - Maximum time a question waits.
    /// * `timeout_decision` - Answer used when nobody responds in time.
    pub fn new(timeout: Duration, timeout_decision: ConsentDecision) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            timeout,
            timeout_decision,
        }
    }

    /// Park a question. Returns its id and the receiver for the answer.
    pub fn park(&self, request: ConsentRequest) -> (Uuid, oneshot::Receiver<ConsentDecision>) {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();

        debug!("Parked consent question {} for {} {}", id, request.method, request.url);

        self.pending.lock().unwrap().insert(
            id,
            PendingQuestion {
                request,
                asked_at: Instant::now(),
                decision_tx: tx,
            },
        );

        (id, rx)
    }

    /// Answer a pending question.
    ///
    /// # Errors
    ///
    /// Returns error if the question is unknown or its caller went away.
    pub fn decide(&self, id: Uuid, decision: ConsentDecision) -> Result<(), HoldError> {
        let question = self
            .pending
            .lock()
            .unwrap()
            .remove(&id)
            .ok_or(HoldError::NotFound(id))?;

        debug!("Decision for {} ({}): {:?}", id, question.request.url, decision);

        question
            .decision_tx
            .send(decision)
            .map_err(|_| HoldError::CallerGone(id))
    }

    /// List pending questions.
    pub fn list_pending(&self) -> Vec<PendingConsent> {
        self.pending
            .lock()
            .unwrap()
            .iter()
            .map(|(id, q)| PendingConsent {
                id: *id,
                context_label: q.request.context_label.clone(),
                url: q.request.url.clone(),
                method: q.request.method.clone(),
                preview: q.request.preview.clone(),
                waiting_secs: q.asked_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// Number of pending questions.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    /// Withdraw a question. Returns true if it was still pending.
    pub fn cancel(&self, id: Uuid) -> bool {
        let removed = self.pending.lock().unwrap().remove(&id);
        if removed.is_some() {
            debug!("Withdrew consent question {}", id);
            true
        } else {
            false
        }
    }

    /// Park a question and wait for the answer or the timeout.
    ///
    /// If the returned future is dropped (the call was aborted), the
    /// question is withdrawn.
    pub async fn ask(&self, request: ConsentRequest) -> ConsentDecision {
        let (id, rx) = self.park(request);
        let _withdraw = Withdraw { manager: self, id };

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(_)) => self.timeout_decision,
            Err(_) => {
                info!(
                    "Consent question {} unanswered after {:?}, using {:?}",
                    id, self.timeout, self.timeout_decision
                );
                self.timeout_decision
            }
        }
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Answer used on timeout.
    pub fn timeout_decision(&self) -> ConsentDecision {
        self.timeout_decision
    }
}

/// Removes a question from the manager when the asker goes away.
struct Withdraw<'a> {
    manager: &'a ConsentHoldManager,
    id: Uuid,
}

impl Drop for Withdraw<'_> {
    fn drop(&mut self) {
        self.manager.cancel(self.id);
    }
}

/// Prompt backed by a [`ConsentHoldManager`].
#[derive(Clone)]
pub struct HoldPrompt {
    manager: Arc<ConsentHoldManager>,
}

impl HoldPrompt {
    /// Create a prompt over a shared manager.
    pub fn new(manager: Arc<ConsentHoldManager>) -> Self {
        Self { manager }
    }

    /// The manager a host UI answers through.
    pub fn manager(&self) -> &Arc<ConsentHoldManager> {
        &self.manager
    }
}

#[async_trait]
impl ConfirmationPrompt for HoldPrompt {
    async fn confirm(&self, request: &ConsentRequest) -> ConsentDecision {
        self.manager.ask(request.clone()).await
    }
}

/// Prompt asking on stderr and reading answers line by line.
pub struct TerminalPrompt<R = BufReader<Stdin>> {
    reader: tokio::sync::Mutex<R>,
    timeout: Duration,
    timeout_decision: ConsentDecision,
}

impl TerminalPrompt {
    /// Prompt reading from the process's stdin.
    pub fn stdin(timeout: Duration, timeout_decision: ConsentDecision) -> Self {
        Self::with_reader(BufReader::new(tokio::io::stdin()), timeout, timeout_decision)
    }
}

impl<R> TerminalPrompt<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Prompt reading answers from any line source.
    pub fn with_reader(reader: R, timeout: Duration, timeout_decision: ConsentDecision) -> Self {
        Self {
            reader: tokio::sync::Mutex::new(reader),
            timeout,
            timeout_decision,
        }
    }
}

/// Interpret a typed answer. An empty line accepts the default (apply).
fn parse_answer(line: &str) -> Option<ConsentDecision> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" | "y" | "yes" => Some(ConsentDecision::Apply),
        "n" | "no" => Some(ConsentDecision::Decline),
        _ => None,
    }
}

#[async_trait]
impl<R> ConfirmationPrompt for TerminalPrompt<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn confirm(&self, request: &ConsentRequest) -> ConsentDecision {
        // One question on the terminal at a time.
        let mut reader = self.reader.lock().await;

        eprintln!(
            "\n[shadow-shield] Sensitive content detected in {} {} ({})",
            request.method, request.url, request.context_label
        );
        eprintln!("  sanitized: {}", request.preview);
        eprint!("  Send the sanitized version? [Y/n] ");

        let mut line = String::new();
        match tokio::time::timeout(self.timeout, reader.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => parse_answer(&line).unwrap_or(self.timeout_decision),
            Ok(_) => self.timeout_decision,
            Err(_) => {
                eprintln!();
                info!("Terminal consent timed out, using {:?}", self.timeout_decision);
                self.timeout_decision
            }
        }
    }
}

/// Errors from consent hold operations.
#[derive(Debug, Error)]
pub enum HoldError {
    /// No pending question with this id.
    #[error("Pending consent question {0} not found")]
    NotFound(Uuid),

    /// The call asking the question went away before the answer.
    #[error("Caller of consent question {0} is gone")]
    CallerGone(Uuid),
}
