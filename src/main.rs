//! mitm-cache-proxy: caching forward proxy with TLS interception
//!
//! This is the main entry point for the mitm-cache-proxy binary. It handles
//! CLI argument parsing, configuration loading and tracing initialization,
//! then runs the proxy until Ctrl-C.
//!
//! # Logging
//!
//! Logs go to stderr. The level is chosen by, in order of precedence:
//!
//! - `-v` flags (`-v` info, `-vv` debug, `-vvv` trace)
//! - the `RUST_LOG` environment variable
//! - `general.log_level` from the configuration

use anyhow::{Context, Result};
use clap::Parser;
use mitm_cache_proxy::{
    cli::Cli,
    config::ConfigLoader,
    proxy::{ProxyConfig, ProxyService},
};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before any other initialization)
    let cli = Cli::parse();

    // Load configuration with hierarchy merging
    let config = ConfigLoader::new()
        .load(&cli)
        .context("Failed to load configuration")?;

    init_tracing(cli.verbosity_filter(), &config.general.log_level)?;

    debug!("Parsed CLI arguments: {:?}", cli);
    debug!("Loaded configuration: {:?}", config);

    let proxy_config =
        ProxyConfig::from_config(&config).context("Invalid proxy configuration")?;
    let mut service = ProxyService::new(proxy_config);

    let addr = service.start().await.context("Failed to start proxy")?;
    info!("mitm-cache-proxy {} ready on {}", env!("CARGO_PKG_VERSION"), addr);
    if let Some(path) = service.certificate_authority().root_cert_path() {
        info!(
            "Import {} into the client trust store to accept intercepted certificates",
            path.display()
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupt received, stopping");

    service.stop().await.context("Failed to stop proxy")?;
    Ok(())
}

/// Initialize the tracing subscriber.
///
/// # Verbosity Levels
/// - `verbosity` from `-v` flags wins when present
/// - otherwise `RUST_LOG`
/// - otherwise the configured level
fn init_tracing(verbosity: Option<&str>, configured: &str) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbosity {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(configured))
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(())
}
