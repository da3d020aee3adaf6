//! Hearth server binary.
//!
//! Loads the configuration, binds the listeners and routes stanzas until
//! interrupted. SIGHUP reloads the routing instances from the same file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use hearth_xmpp::{ConnectionRegistry, InstanceRegistry, Router, XmppServer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod config;
mod telemetry;

use config::Config;
use telemetry::LogFormat;

/// Hearth - XML stream server
#[derive(Parser)]
#[command(name = "hearth-server")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "hearth.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(LogFormat::from_env())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Hearth server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {:?}", cli.config))?;
    if cli.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let router = Arc::new(Router::new(config.router_config(), InstanceRegistry::default()));
    let server = XmppServer::bind(config.server_config()?, Arc::clone(&router))
        .await
        .context("Failed to start listeners")?;

    let connections = Arc::clone(server.connection_registry());
    router.publish(config.build_registry(&connections)?);

    let shutdown = server.shutdown_token();
    tokio::spawn(reload_on_hangup(
        cli.config.clone(),
        Arc::clone(&router),
        connections,
        shutdown.clone(),
    ));
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
        }
        shutdown.cancel();
    });

    server.run().await?;
    info!("Hearth server stopped");
    Ok(())
}

/// Re-read the configuration and publish a fresh routing registry.
///
/// Listener and karma settings only take effect on restart.
fn reload(path: &Path, router: &Router, connections: &Arc<ConnectionRegistry>) -> Result<()> {
    let config = Config::load(path)?;
    router.publish(config.build_registry(connections)?);
    Ok(())
}

#[cfg(unix)]
async fn reload_on_hangup(
    path: PathBuf,
    router: Arc<Router>,
    connections: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, reload disabled");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            received = hangup.recv() => {
                if received.is_none() {
                    return;
                }
                info!(path = ?path, "SIGHUP received, reloading instances");
                match reload(&path, &router, &connections) {
                    Ok(()) => info!("Reload complete"),
                    Err(e) => warn!(error = %e, "Reload rejected, keeping previous instances"),
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(
    _path: PathBuf,
    _router: Arc<Router>,
    _connections: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
) {
    shutdown.cancelled().await;
}
