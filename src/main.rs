//! shadow-shield: local privacy shield for outbound web traffic.
//!
//! This is the main entry point for the shadow-shield binary. It handles CLI
//! argument parsing, configuration loading, telemetry initialization, and
//! runs the intercepting proxy or one of the service helper commands.
//!
//! # I/O Architecture
//!
//! - **Audit logging**: Goes to syslog (not stdout/stderr), falling back to a
//!   null logger when syslog is unreachable
//! - **Debug logging**: stderr, filtered by `-v`, `RUST_LOG` or `general.log_level`
//! - **Consent prompts**: stderr/stdin, unless `--headless`
//! - **Command output**: JSON on stdout

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use shadow_shield::{
    cli::{Cli, Commands, VaultCommand},
    config::{Config, ConfigLoader},
    intercept::{
        Classifier, ConfirmationPrompt, ConsentPolicy, ExclusionGuard, FixedPrompt,
        GatewayClient, HyperTransport, InterceptConfig, Primitives, TerminalPrompt,
    },
    proxy::ProxyServerBuilder,
    telemetry::{self, AuditEvent},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    // Load configuration with hierarchy merging
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbose, &config.general.log_level)?;
    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    match cli.command() {
        Commands::Proxy => run_proxy(&cli, config).await,
        Commands::Scan { text } => {
            let result = gateway(&config)
                .try_scan(&text)
                .await
                .context("Scan failed")?;
            print_json(&result)
        }
        Commands::Rehydrate { text } => {
            let result = gateway(&config)
                .try_rehydrate(&text)
                .await
                .context("Rehydration failed")?;
            print_json(&result)
        }
        Commands::CheckUrl { url } => {
            let guard = ExclusionGuard::from_config(&config);
            match guard.evaluate(&url, None, false) {
                Some(reason) => println!("bypass: {}", reason),
                None => println!("intercept"),
            }
            Ok(())
        }
        Commands::Vault { action } => {
            let client = gateway(&config);
            match action {
                VaultCommand::Mappings => {
                    let mappings = client
                        .mappings()
                        .await
                        .context("Failed to list vault mappings")?;
                    print_json(&mappings)
                }
                VaultCommand::Reveal { id } => {
                    let revealed = client
                        .reveal(&id)
                        .await
                        .with_context(|| format!("Failed to reveal mapping {}", id))?;
                    print_json(&revealed)
                }
            }
        }
    }
}

/// Run the intercepting proxy until Ctrl-C.
async fn run_proxy(cli: &Cli, config: Config) -> Result<()> {
    // Initialize telemetry (syslog) - this never touches stdout/stderr
    if let Err(e) = telemetry::init_logger() {
        warn!("Syslog unavailable, audit events are discarded: {}", e);
        telemetry::init_null_logger().context("Failed to initialize telemetry")?;
    }

    let listen: SocketAddr = config
        .proxy
        .listen_or_default()
        .parse()
        .context("Invalid listen address")?;

    let prompt: Arc<dyn ConfirmationPrompt> = if cli.headless {
        Arc::new(FixedPrompt(config.consent.timeout_decision()))
    } else {
        Arc::new(TerminalPrompt::stdin(
            config.consent.timeout(),
            config.consent.timeout_decision(),
        ))
    };
    let intercept = InterceptConfig::from_config(
        &config,
        Arc::new(gateway(&config)),
        ConsentPolicy::new(prompt),
    );
    let mode = config.interception.mode();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServerBuilder::new(intercept)
        .listen(listen)
        .originals(Primitives::shared(Arc::new(HyperTransport::new())))
        .config(Arc::new(config))
        .bind(shutdown_rx)
        .await
        .with_context(|| format!("Failed to listen on {}", listen))?;

    info!(
        "shadow-shield proxy on {} (mode={})",
        server.local_addr().context("Failed to read listen address")?,
        mode
    );

    // Log session start to syslog
    let started = Instant::now();
    telemetry::record(AuditEvent::SessionStart {
        user: whoami(),
        listen: listen.to_string(),
        mode,
        pid: std::process::id(),
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
        }
        let _ = shutdown_tx.send(true);
    });

    let totals = server.run().await.context("Proxy failed")?;

    // Log session end to syslog
    telemetry::record(AuditEvent::SessionEnd {
        user: whoami(),
        duration_sec: started.elapsed().as_secs(),
        totals,
    });
    info!(
        "Session ended: {} intercepted, {} sanitized, {} rehydrated",
        totals.intercepted, totals.sanitized, totals.rehydrated
    );

    Ok(())
}

/// Client for the local classification/vault service.
fn gateway(config: &Config) -> GatewayClient {
    GatewayClient::from_config(config)
}

/// Print a value as pretty JSON on stdout.
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to encode output")?;
    println!("{}", json);
    Ok(())
}

/// Initialize the tracing subscriber for diagnostic logging.
///
/// This is separate from the audit telemetry which goes to syslog.
///
/// # Verbosity Levels
/// - 0 (default): `RUST_LOG`, else the configured level, else warnings
/// - 1 (-v): Info level
/// - 2 (-vv): Debug level
/// - 3+ (-vvv): Trace level
fn init_tracing(verbose: u8, configured: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let fallback = if configured.is_empty() { "warn" } else { configured };
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback)),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}

/// Get the current username for audit logging.
fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
