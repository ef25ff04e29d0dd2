//! Certmill - Main entry point
//!
//! Operator CLI for the certificate issuance engine.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};

use certmill_config::Config;
use certmill_engine::acme::ChallengeType;
use certmill_engine::validation::ChallengeValidator;
use certmill_engine::{crypto, CertificateEngine, MemorySubscriptionDirectory, Worker};

/// Certmill - ACME-style certificate issuance with provider fallback
#[derive(Parser, Debug)]
#[command(name = "certmill")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "CERTMILL_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ChallengeKind {
    #[value(name = "http-01")]
    Http01,
    #[value(name = "dns-01")]
    Dns01,
}

impl From<ChallengeKind> for ChallengeType {
    fn from(kind: ChallengeKind) -> Self {
        match kind {
            ChallengeKind::Http01 => ChallengeType::Http01,
            ChallengeKind::Dns01 => ChallengeType::Dns01,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file and exit
    Check {
        /// Also try connecting to every configured provider endpoint
        #[arg(long = "network")]
        network: bool,
    },
    /// Run the task worker (default)
    Run,
    /// Check one challenge against live HTTP/DNS state
    Validate {
        #[arg(value_enum)]
        kind: ChallengeKind,
        #[arg(long)]
        domain: String,
        #[arg(long)]
        token: String,
        #[arg(long = "key-authorization")]
        key_authorization: String,
    },
    /// Compute an external account binding signature
    EabSign {
        /// Base64url MAC key
        #[arg(long = "mac-key", env = "CERTMILL_EAB_MAC_KEY")]
        mac_key: String,
        /// Base64url protected header
        #[arg(long)]
        protected: String,
        /// Base64url payload
        #[arg(long)]
        payload: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check { network } => check_config(cli.config.as_deref(), network),
        Commands::Run => run_worker(cli.config.as_deref()),
        Commands::Validate {
            kind,
            domain,
            token,
            key_authorization,
        } => validate_challenge(cli.config.as_deref(), kind, &domain, &token, &key_authorization),
        Commands::EabSign {
            mac_key,
            protected,
            payload,
        } => {
            let signature = crypto::eab_sign(&mac_key, &protected, &payload)
                .context("Failed to sign account binding")?;
            println!("{}", signature);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(false)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init(),
    }
}

fn load_config(config_path: Option<&str>) -> Result<Config> {
    match config_path {
        Some(path) => {
            info!(path = %path, "Loading configuration file");
            Config::from_file(path).context("Failed to load configuration file")
        }
        None => {
            info!("No configuration specified, using embedded default configuration");
            Config::default_embedded().context("Failed to load embedded configuration")
        }
    }
}

/// Validate configuration and exit
fn check_config(config_path: Option<&str>, network: bool) -> Result<()> {
    let config = load_config(config_path)?;

    let mut result = config.check();
    if network {
        let runtime = tokio::runtime::Runtime::new()?;
        result.merge(runtime.block_on(certmill_config::validate::network::validate_endpoints(&config)));
    }

    for warning in &result.warnings {
        warn!("{}", warning);
    }
    if !result.errors.is_empty() {
        for error in &result.errors {
            tracing::error!("{}", error);
        }
        anyhow::bail!("Configuration has {} error(s)", result.errors.len());
    }

    info!("Configuration test successful:");
    info!("  - provider(s): {:?}", config.providers.configured());
    info!(
        "  - polling every {}s, at most {} attempt(s)",
        config.polling.interval_secs, config.polling.max_attempts
    );
    info!("  - renewals {} day(s) before expiry", config.renewal.renew_before_days);

    println!(
        "certmill: configuration file {} test is successful",
        config_path.unwrap_or("(embedded)")
    );
    Ok(())
}

/// Run the worker until Ctrl-C
fn run_worker(config_path: Option<&str>) -> Result<()> {
    let config = load_config(config_path)?;
    config.validate().context("Configuration validation failed")?;

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let subscriptions = Arc::new(MemorySubscriptionDirectory::new());
        let engine = Arc::new(
            CertificateEngine::from_config(&config, subscriptions)
                .context("Failed to start certificate engine")?,
        );
        engine
            .recover()
            .await
            .context("Failed to recover in-flight certificates")?;
        let worker = Worker::new(engine).with_tick(Duration::from_secs(config.engine.worker_tick_secs));

        let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received shutdown signal, initiating graceful shutdown");
            }
            let _ = shutdown_tx.send(());
        });

        info!("Certmill worker started");
        worker.run(shutdown_rx).await;
        Ok(())
    })
}

/// One-shot challenge check
fn validate_challenge(
    config_path: Option<&str>,
    kind: ChallengeKind,
    domain: &str,
    token: &str,
    key_authorization: &str,
) -> Result<()> {
    let config = load_config(config_path)?;
    let runtime = tokio::runtime::Runtime::new()?;

    let outcome = runtime.block_on(async {
        let validator = ChallengeValidator::from_config(&config.validation)
            .context("Failed to build challenge validator")?;
        Ok::<_, anyhow::Error>(
            validator
                .validate(kind.into(), domain, token, key_authorization)
                .await,
        )
    })?;

    println!(
        "{} {}: {:?} after {} attempt(s): {}",
        ChallengeType::from(kind).as_str(),
        domain,
        outcome.verdict,
        outcome.attempts,
        outcome.detail
    );
    if !outcome.is_valid() {
        std::process::exit(1);
    }
    Ok(())
}
