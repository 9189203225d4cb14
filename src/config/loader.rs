//! Configuration loading with hierarchy merging.
//!
//! Configuration is loaded from multiple sources and merged in order:
//!
//! 1. Embedded defaults (compiled into binary)
//! 2. System config: `/etc/shadow-shield/config.toml`
//! 3. User config: `~/.config/shadow-shield/config.toml`
//! 4. Additional config file (via `--config` flag)
//! 5. CLI flags (highest priority)
//!
//! Lists (exclusions, scan methods) are **merged** (appended).
//! Scalars (mode, timeouts, URLs) are **overridden**.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use hyper::{Method, Uri};
use tracing::debug;

use super::error::ConfigError;
use super::schema::{Config, InterceptionConfig, ProxyConfig, ServiceConfig};
use crate::cli::Cli;

/// System-wide configuration path.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/shadow-shield/config.toml";

/// User configuration directory name.
pub const USER_CONFIG_DIR: &str = "shadow-shield";

/// User configuration filename.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Defaults compiled into the binary.
const EMBEDDED_DEFAULTS: &str = include_str!("../../config/default.toml");

/// Configuration loader with support for hierarchy merging.
pub struct ConfigLoader {
    /// Path to system-wide configuration.
    system_path: PathBuf,
    /// Path to user configuration.
    user_path: PathBuf,
}

impl ConfigLoader {
    /// Create a new ConfigLoader with default paths.
    #[must_use]
    pub fn new() -> Self {
        let user_config_dir = dirs::config_dir()
            .map(|p| p.join(USER_CONFIG_DIR))
            .unwrap_or_else(|| PathBuf::from(".config").join(USER_CONFIG_DIR));

        Self {
            system_path: PathBuf::from(SYSTEM_CONFIG_PATH),
            user_path: user_config_dir.join(USER_CONFIG_FILE),
        }
    }

    /// Create a ConfigLoader with custom paths (for testing).
    #[must_use]
    pub fn with_paths(system_path: PathBuf, user_path: PathBuf) -> Self {
        Self {
            system_path,
            user_path,
        }
    }

    /// Load and merge configuration from all sources.
    ///
    /// Missing system and user files are skipped. A missing `--config`
    /// file, invalid TOML and invalid values are errors.
    pub fn load(&self, cli: &Cli) -> Result<Config, ConfigError> {
        let mut config = embedded_defaults()?;
        debug!("Loaded embedded default configuration");

        if let Some(system_config) = self.load_file(&self.system_path)? {
            config.merge(system_config);
            debug!("Loaded system config from {:?}", self.system_path);
        } else {
            debug!("No system config found at {:?}", self.system_path);
        }

        if let Some(user_config) = self.load_file(&self.user_path)? {
            config.merge(user_config);
            debug!("Loaded user config from {:?}", self.user_path);
        } else {
            debug!("No user config found at {:?}", self.user_path);
        }

        if let Some(ref cli_config_path) = cli.config {
            match self.load_file(cli_config_path)? {
                Some(cli_config) => {
                    config.merge(cli_config);
                    debug!("Loaded additional config from {:?}", cli_config_path);
                }
                None => {
                    // Unlike system/user config, a missing CLI-specified config is an error
                    return Err(ConfigError::ReadError {
                        path: cli_config_path.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "Specified config file not found",
                        ),
                    });
                }
            }
        }

        config.merge(cli_overrides(cli));

        validate(&config)?;
        Ok(config)
    }

    /// Load a config file, returning None if it doesn't exist.
    fn load_file(&self, path: &Path) -> Result<Option<Config>, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config: Config =
                    toml::from_str(&contents).map_err(|e| ConfigError::ParseError {
                        path: path.to_path_buf(),
                        source: e,
                    })?;
                Ok(Some(config))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source: e,
            }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the defaults compiled into the binary.
pub fn embedded_defaults() -> Result<Config, ConfigError> {
    toml::from_str(EMBEDDED_DEFAULTS).map_err(|e| ConfigError::ParseError {
        path: PathBuf::from("<embedded:default.toml>"),
        source: e,
    })
}

/// Build a config layer from CLI flags.
fn cli_overrides(cli: &Cli) -> Config {
    Config {
        service: ServiceConfig {
            url: cli.service_url.clone().unwrap_or_default(),
            ..Default::default()
        },
        interception: InterceptionConfig {
            mode: cli.mode,
            rehydrate: cli.no_rehydrate.then_some(false),
            ..Default::default()
        },
        proxy: ProxyConfig {
            listen: cli.listen.clone().unwrap_or_default(),
        },
        ..Default::default()
    }
}

/// Reject values the pipeline cannot work with.
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    let url = config.service.url_or_default();
    let uri: Uri = url.parse().map_err(|e| ConfigError::InvalidValue {
        field: "service.url".to_string(),
        message: format!("'{}': {}", url, e),
    })?;
    if !matches!(uri.scheme_str(), Some("http")) || uri.host().is_none() {
        return Err(ConfigError::InvalidValue {
            field: "service.url".to_string(),
            message: format!("'{}' must be an absolute http:// URL", url),
        });
    }

    for name in &config.interception.scan_methods {
        if Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes()).is_err() {
            return Err(ConfigError::InvalidValue {
                field: "interception.scan_methods".to_string(),
                message: format!("'{}' is not an HTTP method", name),
            });
        }
    }

    if config.interception.sentinel().trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "interception.token_sentinel".to_string(),
            message: "must not be blank".to_string(),
        });
    }

    let listen = config.proxy.listen_or_default();
    listen
        .parse::<SocketAddr>()
        .map_err(|e| ConfigError::InvalidValue {
            field: "proxy.listen".to_string(),
            message: format!("'{}': {}", listen, e),
        })?;

    Ok(())
}
