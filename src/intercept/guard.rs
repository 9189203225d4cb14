//! Exclusion guard: decides which outbound calls bypass interception.
//!
//! Evaluated first on every call, with no side effects.
//!
//! # Evaluation Order
//!
//! 1. Re-entrant marker (flag or header) set by the pipeline itself
//! 2. URL targets the local classification/vault service (loop prevention)
//! 3. URL cannot be resolved to an absolute http(s) URL (fail open)
//! 4. Host matches the excluded host list
//! 5. Path matches an excluded path fragment (analytics, telemetry, health)
//!
//! # Pattern Matching
//!
//! Host patterns are exact (`stats.example.com`) or wildcard
//! (`*.sentry.io` matches `o1.ingest.sentry.io` but not `sentry.io`).
//! Path fragments match anywhere in the path and query. All matching is
//! case-insensitive.

use crate::config::Config;
use hyper::Uri;
use std::collections::HashSet;
use std::fmt;

/// Hosts treated as the same machine when matching the service URL.
const LOOPBACK_HOSTS: &[&str] = &["127.0.0.1", "localhost", "[::1]"];

/// Why a call bypasses interception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassReason {
    /// The call is the pipeline's own traffic.
    Internal,
    /// The URL targets the local classification/vault service.
    ServiceEndpoint,
    /// The URL could not be resolved.
    Unresolvable,
    /// The host matched an excluded host pattern.
    ExcludedHost(String),
    /// The path matched an excluded fragment.
    ExcludedPath(String),
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BypassReason::Internal => write!(f, "internal call"),
            BypassReason::ServiceEndpoint => write!(f, "local service endpoint"),
            BypassReason::Unresolvable => write!(f, "unresolvable url"),
            BypassReason::ExcludedHost(pattern) => write!(f, "excluded host ({})", pattern),
            BypassReason::ExcludedPath(fragment) => write!(f, "excluded path ({})", fragment),
        }
    }
}

/// Bypass check for outbound calls.
#[derive(Debug, Clone)]
pub struct ExclusionGuard {
    /// `host:port` forms under which the service is reachable (lowercase).
    service_authorities: HashSet<String>,
    /// Path prefix of the service (always ends with `/`).
    service_path: String,
    /// Excluded hosts (exact matches, lowercase).
    hosts_exact: HashSet<String>,
    /// Excluded host wildcards (e.g., "*.example.com").
    hosts_wildcards: Vec<String>,
    /// Excluded path fragments (lowercase).
    path_fragments: Vec<String>,
}

impl ExclusionGuard {
    /// Create a guard for a service base URL and exclusion lists.
    ///
    /// An unparseable service URL leaves only the textual prefix check.
    pub fn new(service_url: &str, hosts: &[String], paths: &[String]) -> Self {
        let (service_authorities, service_path) = service_identity(service_url);
        let (hosts_exact, hosts_wildcards) = split_patterns(hosts);

        let path_fragments = paths
            .iter()
            .map(|p| p.trim().to_lowercase())
            .filter(|p| !p.is_empty())
            .collect();

        Self {
            service_authorities,
            service_path,
            hosts_exact,
            hosts_wildcards,
            path_fragments,
        }
    }

    /// Create a guard from the loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.service.url_or_default(),
            &config.exclusions.hosts,
            &config.exclusions.paths,
        )
    }

    /// Decide whether a URL bypasses interception.
    pub fn should_bypass(&self, url: &str) -> bool {
        self.evaluate(url, None, false).is_some()
    }

    /// Evaluate a call, returning the bypass reason if it bypasses.
    ///
    /// Relative URLs (`/api/x`) are resolved against `origin` when given.
    pub fn evaluate(&self, url: &str, origin: Option<&str>, internal: bool) -> Option<BypassReason> {
        if internal {
            return Some(BypassReason::Internal);
        }

        if self.mentions_service(url) {
            return Some(BypassReason::ServiceEndpoint);
        }

        let Some(uri) = resolve(url, origin) else {
            return Some(BypassReason::Unresolvable);
        };

        let host = uri.host().unwrap_or_default().to_lowercase();

        if self.is_service(&uri, &host) {
            return Some(BypassReason::ServiceEndpoint);
        }

        if let Some(pattern) = self.matching_host(&host) {
            return Some(BypassReason::ExcludedHost(pattern));
        }

        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_lowercase())
            .unwrap_or_default();

        self.path_fragments
            .iter()
            .find(|fragment| path.contains(fragment.as_str()))
            .map(|fragment| BypassReason::ExcludedPath(fragment.clone()))
    }

    /// Whether a URL points at the local service.
    pub fn targets_service(&self, url: &str) -> bool {
        if self.mentions_service(url) {
            return true;
        }
        resolve(url, None).is_some_and(|uri| {
            let host = uri.host().unwrap_or_default().to_lowercase();
            self.is_service(&uri, &host)
        })
    }

    /// Textual loop-prevention check: the URL contains the service prefix.
    fn mentions_service(&self, url: &str) -> bool {
        let lowered = url.to_lowercase();
        self.service_authorities
            .iter()
            .any(|authority| lowered.contains(&format!("{}{}", authority, self.service_path)))
    }

    fn is_service(&self, uri: &Uri, host: &str) -> bool {
        let authority = format!("{}:{}", host, effective_port(uri));
        if !self.service_authorities.contains(&authority) {
            return false;
        }
        let path = uri.path();
        path.starts_with(&self.service_path) || format!("{}/", path) == self.service_path
    }

    fn matching_host(&self, host: &str) -> Option<String> {
        if self.hosts_exact.contains(host) {
            return Some(host.to_string());
        }
        self.hosts_wildcards
            .iter()
            .find(|pattern| matches_wildcard(pattern, host))
            .cloned()
    }
}

/// Resolve a URL to an absolute http(s) URI.
fn resolve(url: &str, origin: Option<&str>) -> Option<Uri> {
    let trimmed = url.trim();
    let candidate = if trimmed.starts_with('/') && !trimmed.starts_with("//") {
        format!("{}{}", origin?.trim_end_matches('/'), trimmed)
    } else {
        trimmed.to_string()
    };

    let uri: Uri = candidate.parse().ok()?;
    match uri.scheme_str() {
        Some("http") | Some("https") if uri.host().is_some() => Some(uri),
        _ => None,
    }
}

fn effective_port(uri: &Uri) -> u16 {
    uri.port_u16().unwrap_or(match uri.scheme_str() {
        Some("https") => 443,
        _ => 80,
    })
}

/// Authorities and path prefix for the service base URL.
fn service_identity(service_url: &str) -> (HashSet<String>, String) {
    let mut authorities = HashSet::new();

    let Some(uri) = resolve(service_url, None) else {
        // Keep the raw text so the textual check still prevents recursion.
        let raw = service_url
            .trim()
            .trim_start_matches("http://")
            .trim_start_matches("https://")
            .trim_end_matches('/')
            .to_lowercase();
        if !raw.is_empty() {
            authorities.insert(raw);
        }
        return (authorities, "/".to_string());
    };

    let host = uri.host().unwrap_or_default().to_lowercase();
    let port = effective_port(&uri);

    if LOOPBACK_HOSTS.contains(&host.as_str()) {
        for alias in LOOPBACK_HOSTS {
            authorities.insert(format!("{}:{}", alias, port));
        }
    } else {
        authorities.insert(format!("{}:{}", host, port));
    }

    let mut path = uri.path().to_string();
    if !path.ends_with('/') {
        path.push('/');
    }

    (authorities, path)
}

/// Split patterns into exact matches and wildcards.
///
/// Patterns starting with `*.` are treated as wildcards.
/// All patterns are lowercased for case-insensitive matching.
fn split_patterns(patterns: &[String]) -> (HashSet<String>, Vec<String>) {
    let mut exact = HashSet::new();
    let mut wildcards = Vec::new();

    for pattern in patterns {
        let pattern_lower = pattern.trim().to_lowercase();
        if pattern_lower.starts_with("*.") {
            wildcards.push(pattern_lower);
        } else if !pattern_lower.is_empty() {
            exact.insert(pattern_lower);
        }
    }

    (exact, wildcards)
}

/// Check if a host matches a wildcard pattern.
///
/// Pattern `*.example.com` matches `sub.example.com` and
/// `deep.sub.example.com`, but not `example.com` or `fakeexample.com`.
fn matches_wildcard(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        if host.ends_with(suffix) {
            let prefix_len = host.len() - suffix.len();
            prefix_len > 0 && host.as_bytes().get(prefix_len - 1) == Some(&b'.')
        } else {
            false
        }
    } else {
        pattern == host
    }
}
