//! plexus-server: multi-client real-time messaging server.
//!
//! Serves one of the bundled applications over WebSocket until Ctrl+C or
//! SIGTERM, then closes every session.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use plexus_core::WireFormat;
use plexus_server::apps::{spawn_ticker, ChatApp, TickerApp};
use plexus_server::{
    ConfigOverrides, DuplicateIdentity, PlexusServer, Registry, RegistryHandle, ServerConfig,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum App {
    /// Chat room; connect to <path>/<name>
    Chat,
    /// Counter broadcast; any path under the prefix
    Ticker,
}

/// plexus-server: multi-client real-time messaging server
#[derive(Parser, Debug)]
#[command(name = "plexus-server", version, about = "Multi-client real-time messaging server")]
struct Cli {
    /// Application to serve
    #[arg(long, value_enum, default_value_t = App::Chat)]
    app: App,

    /// Listen address
    #[arg(long)]
    bind: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Only accept upgrades under this path
    #[arg(long)]
    path: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.plexus/config.toml")]
    config: String,

    /// Wire format (json or cbor)
    #[arg(long)]
    wire_format: Option<WireFormat>,

    /// Per-client outbound queue length
    #[arg(long)]
    mailbox_capacity: Option<usize>,

    /// What to do when an identity connects twice (reject or replace)
    #[arg(long)]
    duplicate_identity: Option<DuplicateIdentity>,

    /// Ticker period in milliseconds
    #[arg(long, default_value_t = 1000)]
    tick_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), app = ?cli.app, "starting plexus-server");

    let overrides = ConfigOverrides {
        bind: cli.bind.clone(),
        port: cli.port,
        path: cli.path.clone(),
        mailbox_capacity: cli.mailbox_capacity,
        wire_format: cli.wire_format,
        duplicate_identity: cli.duplicate_identity,
    };
    let config_path = PathBuf::from(&cli.config);
    let config = ServerConfig::load(Some(&config_path), &overrides)
        .context("failed to load config")?;

    let (handle, registry_task, ticker) = match cli.app {
        App::Chat => {
            let (handle, task) = Registry::spawn(ChatApp::new(), config.registry.clone());
            (handle, task, None)
        }
        App::Ticker => {
            let (handle, task) = Registry::spawn(TickerApp::new(), config.registry.clone());
            let ticker = spawn_ticker(handle.clone(), Duration::from_millis(cli.tick_ms.max(1)));
            (handle, task, Some(ticker))
        }
    };

    let server = PlexusServer::bind(&config, handle.clone())
        .await
        .context("failed to start listener")?;
    info!(addr = %server.local_addr(), path = %config.path_prefix, "listening");

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    stop(handle, registry_task, ticker).await;
    info!("plexus-server stopped");
    Ok(())
}

async fn stop(handle: RegistryHandle, registry_task: JoinHandle<()>, ticker: Option<JoinHandle<()>>) {
    handle.shutdown();
    if let Err(e) = registry_task.await {
        warn!(error = %e, "registry task failed");
    }
    if let Some(ticker) = ticker {
        ticker.abort();
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
