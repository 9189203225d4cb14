//! Command-line interface definitions for shadow-shield.
//!
//! Uses clap's derive API for type-safe argument parsing.

use crate::intercept::ProtectionMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Local privacy shield for outbound web traffic.
///
/// shadow-shield sits between a browser and the network, replaces sensitive
/// text in outgoing request bodies with shadow tokens, and puts the real
/// values back into responses so they still read normally on this machine.
#[derive(Parser, Debug)]
#[command(name = "shadow-shield")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to run (defaults to `proxy`).
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to additional config file.
    ///
    /// Merged on top of system and user configs, below CLI flags.
    #[arg(short = 'c', long = "config", value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Protection mode: `auto` applies sanitized bodies, `consent` asks first.
    #[arg(long = "mode", value_name = "MODE", global = true)]
    pub mode: Option<ProtectionMode>,

    /// Do not rehydrate shadow tokens in responses.
    #[arg(long = "no-rehydrate", global = true)]
    pub no_rehydrate: bool,

    /// Base URL of the local classification/vault service.
    #[arg(long = "service-url", value_name = "URL", global = true)]
    pub service_url: Option<String>,

    /// Address the proxy listens on.
    #[arg(long = "listen", value_name = "ADDR")]
    pub listen: Option<String>,

    /// Never prompt on the terminal.
    ///
    /// Consent questions are answered with the configured timeout decision.
    #[arg(long = "headless")]
    pub headless: bool,

    /// Increase log verbosity.
    ///
    /// Can be specified multiple times:
    /// -v    = info level
    /// -vv   = debug level
    /// -vvv  = trace level
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// Subcommands for shadow-shield.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Run the intercepting HTTP proxy.
    Proxy,

    /// Send text to the classifier and print the result.
    Scan {
        /// Text to scan.
        text: String,
    },

    /// Rehydrate shadow tokens in text and print the result.
    Rehydrate {
        /// Text containing shadow tokens.
        text: String,
    },

    /// Show whether a URL bypasses interception, and why.
    CheckUrl {
        /// URL to check.
        url: String,
    },

    /// Inspect the token vault.
    Vault {
        /// Vault action.
        #[command(subcommand)]
        action: VaultCommand,
    },
}

/// Vault subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum VaultCommand {
    /// List stored token mappings.
    Mappings,

    /// Reveal the real value behind a mapping.
    Reveal {
        /// Mapping id.
        id: String,
    },
}

impl Cli {
    /// The command to run, `proxy` when none was given.
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Proxy)
    }
}
