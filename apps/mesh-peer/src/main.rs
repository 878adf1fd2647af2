use anyhow::{Context, Result};
use clap::Parser;
use mesh_peer_core::cli::Cli;
use mesh_peer_core::media::StaticMediaSource;
use mesh_peer_core::notify::LoggingNotifier;
use mesh_peer_core::telemetry::logging;
use mesh_peer_core::transport::webrtc::RtcTransportFactory;
use mesh_peer_core::{MeshConfig, join_mesh};
use std::sync::Arc;
use tokio::signal;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    logging::init(&cli.logging.to_config()).context("failed to initialise logging")?;

    let mut config = MeshConfig::from_env();
    cli.apply(&mut config);

    let factory = RtcTransportFactory::new(&config.ice_servers)
        .context("failed to build the webrtc stack")?;
    let local_id = config.local_id();
    config.participant_id = Some(local_id.clone());

    let mut media = StaticMediaSource::new(local_id.as_str());
    if cli.receive_only {
        media.audio = false;
        media.video = false;
    }

    let mut client = join_mesh(
        &config,
        &media,
        Arc::new(factory),
        Arc::new(LoggingNotifier),
    )
    .await
    .with_context(|| format!("failed to join mesh via {}", config.relay_url))?;
    eprintln!("joined mesh as {}", client.local_id());

    let interrupted = tokio::select! {
        result = signal::ctrl_c() => {
            result.context("failed to listen for ctrl-c")?;
            true
        }
        _ = client.closed() => false,
    };
    if interrupted {
        tracing::info!(target = "mesh", "leaving mesh");
        client.leave().await;
    } else {
        tracing::warn!(target = "mesh", "relay connection ended");
    }
    Ok(())
}
