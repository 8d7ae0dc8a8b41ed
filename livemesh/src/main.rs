use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use livemesh_core::{
    config::MailboxBackend,
    ice::provider_from_config,
    logging,
    presence::{HttpPresenceNotifier, NoopPresenceNotifier, PresenceNotifier},
    signaling::{MailboxStore, MemoryMailboxStore, RedisMailboxStore},
    Config, PeerId, StreamCollaborators, StreamLifecycleController,
};
use livemesh_rtc::{CountingPlayback, SyntheticMediaSource, WebRtcConnectionFactory};

#[derive(Parser, Debug)]
#[command(name = "livemesh")]
#[command(about = "Peer-to-peer live streaming over mailbox signaling", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(long, short, env = "LIVEMESH_CONFIG")]
    config: Option<String>,

    /// Overrides identity.peer_id
    #[arg(long)]
    peer_id: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast synthetic media to viewers
    Broadcast {
        /// Viewer to offer to; may be repeated
        #[arg(long = "viewer")]
        viewers: Vec<String>,
    },
    /// Answer incoming offers and count received media
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(peer_id) = args.peer_id {
        config.identity.peer_id = peer_id;
    }
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let identity = config.local_identity();
    info!(peer_id = %identity.peer_id, "livemesh starting");

    // 3. Wire collaborators
    let mailbox: Arc<dyn MailboxStore> = match config.mailbox.backend {
        MailboxBackend::Redis => Arc::new(
            RedisMailboxStore::connect(&config.mailbox.redis_url, config.mailbox.key_prefix.clone())
                .await?,
        ),
        MailboxBackend::Memory => {
            warn!("Using in-process mailboxes; remote peers cannot reach this node");
            Arc::new(MemoryMailboxStore::new())
        }
    };

    let presence: Arc<dyn PresenceNotifier> = match &config.presence.endpoint {
        Some(endpoint) => Arc::new(HttpPresenceNotifier::new(
            endpoint.clone(),
            Duration::from_secs(config.presence.request_timeout_secs),
        )?),
        None => Arc::new(NoopPresenceNotifier),
    };

    let playback = CountingPlayback::new();
    let collaborators = StreamCollaborators {
        media: Arc::new(SyntheticMediaSource::new()),
        ice: provider_from_config(&config.ice, &identity.peer_id)?,
        mailbox,
        connections: Arc::new(WebRtcConnectionFactory::new()?),
        playback: Arc::new(playback.clone()),
        presence,
    };

    let controller = Arc::new(StreamLifecycleController::new(
        identity,
        config.stream.clone(),
        collaborators,
    ));

    let mut alerts = controller.error();
    tokio::spawn(async move {
        while alerts.changed().await.is_ok() {
            if let Some(alert) = alerts.borrow_and_update().clone() {
                if alert.fatal {
                    error!(kind = ?alert.kind, "{}", alert.message);
                } else {
                    warn!(kind = ?alert.kind, "{}", alert.message);
                }
            }
        }
    });

    // 4. Start
    match args.command {
        Command::Broadcast { viewers } => {
            controller.start_stream().await?;
            for viewer in viewers {
                controller.announce_viewer(PeerId::new(viewer));
            }
        }
        Command::Watch => controller.join_stream().await?,
    }

    let report = controller.clone();
    let stats = playback.clone();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(10));
        loop {
            ticker.tick().await;
            for peer_id in report.peer_ids() {
                if let Some((tracks, packets, bytes)) = stats.stats(&peer_id) {
                    info!(peer_id = %peer_id, tracks, packets, bytes, "Receiving");
                }
            }
            info!(peers = report.peer_count(), state = %report.state(), "Stream status");
        }
    });

    // 5. Run until signalled, then stop
    shutdown_signal().await;
    reporter.abort();
    controller.stop_stream().await?;
    info!("livemesh stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
