//! Configuration system for shadow-shield.
//!
//! This module provides TOML configuration loading with hierarchy merging.
//!
//! # Configuration Hierarchy
//!
//! 1. Embedded defaults (`config/default.toml`)
//! 2. System config: `/etc/shadow-shield/config.toml`
//! 3. User config: `~/.config/shadow-shield/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! # Merge Behavior
//!
//! - **Lists** (exclusions, scan methods) are **merged** (appended)
//! - **Scalars** (mode, timeouts, URLs) are **overridden** when set
//! - **Contexts** are merged by key
//!
//! # Per-Context Overrides
//!
//! ```toml
//! [contexts.banking]
//! mode = "consent"
//! rehydrate = false
//! ```

mod error;
mod loader;
mod schema;

pub use error::ConfigError;
pub use loader::{ConfigLoader, embedded_defaults, validate};
pub use schema::{
    Config, ConsentConfig, ContextOverride, DEFAULT_LISTEN, DEFAULT_SERVICE_URL,
    ExclusionsConfig, GeneralConfig, InterceptionConfig, ProxyConfig, ServiceConfig,
};
