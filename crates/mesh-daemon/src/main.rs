//! mesh-daemon: headless node of the audio mesh control plane.
//!
//! Listens for WebSocket peer connections, serves the HTTP signaling
//! endpoint and joins the nodes listed in the configuration.

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_core::{LocalPeer, MessageType};
use mesh_daemon::config::{MeshConfig, RendezvousTarget};
use mesh_daemon::{PeersManager, WsTransport, signaling};

#[derive(Parser, Debug)]
#[command(name = "mesh-daemon")]
#[command(about = "Peer coordination daemon for the audio mesh")]
struct Args {
    /// Directory containing config.json
    #[arg(short, long, default_value = ".", env = "MESH_CONFIG_PATH")]
    config: String,

    /// WebSocket transport bind address (overrides config)
    #[arg(short, long, env = "MESH_LISTEN")]
    listen: Option<String>,

    /// HTTP signaling bind address (overrides config)
    #[arg(long, env = "MESH_HTTP")]
    http: Option<String>,

    /// Signaling endpoint of a node to join; may be repeated
    #[arg(short, long)]
    join: Vec<String>,

    /// Node name (overrides config)
    #[arg(long)]
    name: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_daemon=debug"
    } else {
        "info,mesh_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = MeshConfig::load(&args.config)?;
    if let Some(listen) = args.listen {
        config.network.listen = listen;
    }
    if let Some(http) = args.http {
        config.network.http = http;
    }
    if let Some(name) = args.name {
        config.identity.name = name;
    }
    config.join.http.extend(args.join);

    let local = match config.identity.uuid.clone() {
        Some(uuid) => LocalPeer::with_uuid(uuid, config.identity.name.clone()),
        None => LocalPeer::new(config.identity.name.clone()),
    };
    info!("Starting mesh-daemon as {} ({})", local.name, local.uuid);
    info!("Instance: {}", local.instance_uuid);

    let transport = WsTransport::bind(&config.network.listen, config.network.advertise.clone())
        .await
        .with_context(|| format!("Failed to bind {}", config.network.listen))?;
    let manager = PeersManager::new(local, transport, config.manager_config());

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let (http_addr, http_task) = signaling::serve(Arc::clone(&manager), &config.network.http, async move {
        let _ = stop_rx.wait_for(|stop| *stop).await;
    })
    .await
    .with_context(|| format!("Failed to bind {}", config.network.http))?;
    info!("Signaling endpoint: http://{}", http_addr);

    log_new_peers(&manager);
    let _latency_updates = manager.on_controller_message(MessageType::SinkLatencyUpdate, |message, peer| {
        info!("{} from {}", message.message_type(), peer.uuid());
    });

    join_configured(&manager, &config.join.http, &config.join.rendezvous).await;

    info!("Daemon running. Press Ctrl+C to stop.");
    shutdown_signal().await;

    manager.shutdown().await;
    let _ = stop_tx.send(true);
    if let Ok(Err(e)) = http_task.await {
        warn!("Signaling server error: {}", e);
    }

    info!("Shut down");
    Ok(())
}

fn log_new_peers(manager: &Arc<PeersManager>) {
    let mut connected = manager.subscribe_new_connected_peer();
    tokio::spawn(async move {
        while let Ok(peer) = connected.recv().await {
            info!("Peer online: {} ({}) via {}", peer.name(), peer.uuid(), peer.target());
        }
    });
}

async fn join_configured(manager: &Arc<PeersManager>, http: &[String], rendezvous: &[RendezvousTarget]) {
    let http_joins = http.iter().map(|endpoint| async move {
        if let Err(e) = manager.join_peer_with_http_api(endpoint).await {
            warn!("Join {} failed: {}", endpoint, e);
        }
    });
    let rendezvous_joins = rendezvous.iter().map(|target| async move {
        if let Err(e) = manager
            .join_peer_with_rendezvous_api(&target.host, &target.peer_uuid)
            .await
        {
            warn!("Rendezvous with {} failed: {}", target.peer_uuid, e);
        }
    });
    futures::join!(join_all(http_joins), join_all(rendezvous_joins));
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
