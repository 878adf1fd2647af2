use mesh_protocol::ParticipantId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::media::{LocalMedia, MediaSource};
use crate::notify::PeerNotifier;
use crate::session::{PeerDirectory, SessionManager};
use crate::signaling::{ChannelEvent, SignalingConnection, SignalingError, SignalingSender};
use crate::transport::TransportFactory;

/// A running mesh membership. Dropping it stops the dispatch loop.
pub struct MeshClient {
    local_id: ParticipantId,
    directory: PeerDirectory,
    signaling: SignalingSender,
    task: Option<JoinHandle<()>>,
    _connection: Option<SignalingConnection>,
}

/// Acquire local media, connect to the relay and start dispatching.
pub async fn join_mesh(
    config: &MeshConfig,
    media_source: &dyn MediaSource,
    factory: Arc<dyn TransportFactory>,
    notifier: Arc<dyn PeerNotifier>,
) -> Result<MeshClient, MeshError> {
    let media = media_source.acquire().await?;
    tracing::debug!(target = "mesh", tracks = media.tracks().len(), "local media acquired");

    let mut connection = SignalingConnection::connect(&config.relay_url, config.heartbeat).await?;
    let events = connection
        .take_events()
        .ok_or(SignalingError::ChannelClosed)?;
    let mut client = MeshClient::attach(
        config,
        media,
        connection.sender(),
        events,
        factory,
        notifier,
    );
    client._connection = Some(connection);
    tracing::info!(
        target = "mesh",
        local = %client.local_id,
        relay = %config.relay_url,
        "joined relay"
    );
    Ok(client)
}

impl MeshClient {
    /// Start a session manager on an already established channel.
    pub fn attach(
        config: &MeshConfig,
        media: LocalMedia,
        signaling: SignalingSender,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        factory: Arc<dyn TransportFactory>,
        notifier: Arc<dyn PeerNotifier>,
    ) -> Self {
        let local_id = config.local_id();
        let manager = SessionManager::new(
            local_id.clone(),
            media,
            signaling.clone(),
            factory,
            notifier,
        )
        .with_max_peers(config.max_peers)
        .with_offer_options(config.offer);
        let directory = manager.directory();
        let task = tokio::spawn(manager.run(events));
        Self {
            local_id,
            directory,
            signaling,
            task: Some(task),
            _connection: None,
        }
    }

    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    /// Resolves once the dispatch loop has ended.
    pub async fn closed(&mut self) {
        if let Some(task) = self.task.as_mut() {
            if let Err(err) = task.await {
                tracing::warn!(target = "mesh", error = %err, "session manager task failed");
            }
            self.task = None;
        }
    }

    /// Close the relay channel and wait for every session to be torn down.
    pub async fn leave(mut self) {
        self.signaling.close();
        self.closed().await;
    }
}

impl Drop for MeshClient {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaError;
    use crate::notify::LoggingNotifier;
    use crate::transport::mock::MockTransportFactory;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::net::TcpListener;

    struct DeniedMedia;

    #[async_trait]
    impl MediaSource for DeniedMedia {
        async fn acquire(&self) -> Result<LocalMedia, MediaError> {
            Err(MediaError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn media_failure_aborts_join_before_connecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = MeshConfig {
            relay_url: format!("ws://{}/mesh", listener.local_addr().unwrap()),
            ..MeshConfig::default()
        };
        let factory = MockTransportFactory::new();

        let result = join_mesh(
            &config,
            &DeniedMedia,
            Arc::new(factory.clone()),
            Arc::new(LoggingNotifier),
        )
        .await;
        assert!(matches!(
            result,
            Err(MeshError::Media(MediaError::PermissionDenied))
        ));

        let accepted = tokio::time::timeout(Duration::from_millis(50), listener.accept()).await;
        assert!(accepted.is_err(), "relay must not be contacted");
        assert_eq!(factory.opened_count(), 0);
    }
}
