//! dualproxy - a local HTTP and SOCKS5 forwarding proxy
//!
//! Usage:
//!     dualproxy [--config <path>] [--port <port>]
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use dualproxy::config::{load_config, Config};
use dualproxy::metrics::MetricsServer;
use dualproxy::util::{init_logging, ShutdownSignal};
use dualproxy::ProxyLauncher;

/// A local forwarding proxy serving HTTP and SOCKS5 side by side.
#[derive(Parser, Debug)]
#[command(name = "dualproxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file (defaults apply when omitted)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Configuration directory reported by the launcher
    #[arg(long, value_name = "DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Preferred HTTP port; SOCKS5 binds just above it (0 = OS-assigned)
    #[arg(short, long, value_name = "PORT", default_value_t = 0)]
    port: u16,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path).with_context(|| {
            format!("failed to load configuration from '{}'", path.display())
        })?,
        None => Config::default(),
    };

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);

    init_logging(log_level, &config.global.log_format)
        .context("failed to initialize logging")?;

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!("  Listen host: {}", config.listen.host);
        println!("  Port search: {}", config.listen.port_search);
        println!(
            "  Relay: connect timeout {:?}, idle timeout {:?}",
            config.relay.connect_timeout, config.relay.idle_timeout
        );
        if config.metrics.enabled {
            println!("  Metrics: {}{}", config.metrics.address, config.metrics.path);
        }
        return Ok(());
    }

    info!(
        config_path = ?cli.config,
        config_dir = %cli.config_dir.display(),
        port = cli.port,
        "dualproxy starting"
    );

    run(cli, config)
}

fn run(cli: Cli, config: Config) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(run_async(cli, config))
}

async fn run_async(cli: Cli, config: Config) -> Result<()> {
    let launcher = ProxyLauncher::new(config);

    let addrs = launcher
        .start(&cli.config_dir, cli.port)
        .await
        .context("failed to start proxy listeners")?;

    let metrics_shutdown = ShutdownSignal::new();
    let metrics_handle = if launcher.config().metrics.enabled {
        let metrics_config = &launcher.config().metrics;
        let server = MetricsServer::bind(
            metrics_config.address,
            metrics_config.path.clone(),
            launcher.metrics().clone(),
        )
        .await
        .with_context(|| {
            format!(
                "failed to bind metrics server on {}",
                metrics_config.address
            )
        })?;
        Some(tokio::spawn(server.run(metrics_shutdown.subscribe())))
    } else {
        None
    };

    println!("HTTP proxy:   {}", addrs.http);
    println!("SOCKS5 proxy: {}", addrs.socks);
    info!("dualproxy is running");
    info!("press Ctrl+C to stop");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("received shutdown signal");
        }
        Err(e) => {
            error!(error = %e, "failed to listen for shutdown signal");
        }
    }

    launcher.shutdown();
    metrics_shutdown.shutdown();
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    info!(
        active_sessions = launcher.sessions().active(),
        "dualproxy shut down complete"
    );
    Ok(())
}
