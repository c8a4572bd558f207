//! Call service orchestration

use crate::call::{CallController, CallError, CallSessionManager};
use crate::config::{CallConfig, ConfigError};
use crate::identity::{Identity, IdentityError, IdentityProvider, PeerDirectory, PeerId};
use crate::media::CaptureDevice;
use crate::negotiator::NegotiatorFactory;
use crate::signaling::SignalingChannel;
use crate::store::DocumentStore;
use crate::types::{CallEvent, CallMode, SessionId};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    /// Configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Local identity or peer lookup failed
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Builder is missing a required component
    #[error("Missing component: {0}")]
    MissingComponent(&'static str),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),
}

/// A running call client
pub struct CallService {
    controller: CallController,
    signaling: Arc<SignalingChannel>,
    config: CallConfig,
}

impl CallService {
    /// Create a builder
    #[must_use]
    pub fn builder() -> CallServiceBuilder {
        CallServiceBuilder::new()
    }

    /// Control handle of the call manager
    pub fn controller(&self) -> &CallController {
        &self.controller
    }

    /// Identity this client calls as
    pub fn local_identity(&self) -> &Identity {
        self.controller.local_identity()
    }

    /// Effective configuration
    pub fn config(&self) -> &CallConfig {
        &self.config
    }

    /// Signaling channel used by this client
    pub fn signaling(&self) -> &Arc<SignalingChannel> {
        &self.signaling
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.controller.subscribe_events()
    }

    /// Look a peer up in `directory` and call them
    ///
    /// # Errors
    ///
    /// Returns error if the peer is not reachable or the call cannot start
    #[tracing::instrument(skip(self, directory), fields(peer = %peer))]
    pub async fn call_peer(
        &self,
        directory: &dyn PeerDirectory,
        peer: &PeerId,
        mode: CallMode,
    ) -> Result<SessionId, ServiceError> {
        let callee = directory.select(peer).await?;
        Ok(self.controller.initiate(callee, mode).await?)
    }

    /// End any active call and stop the call manager
    ///
    /// # Errors
    ///
    /// Returns error if the manager had already stopped
    pub async fn shutdown(&self) -> Result<(), ServiceError> {
        self.controller.shutdown().await?;
        Ok(())
    }
}

/// Builder for [`CallService`]
pub struct CallServiceBuilder {
    config: CallConfig,
    identity: Option<Arc<dyn IdentityProvider>>,
    store: Option<Arc<dyn DocumentStore>>,
    transport: Option<Arc<dyn NegotiatorFactory>>,
    capture: Option<Arc<dyn CaptureDevice>>,
}

impl Default for CallServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CallServiceBuilder {
    /// Create a builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: CallConfig::default(),
            identity: None,
            store: None,
            transport: None,
            capture: None,
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the signed-in identity source
    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn IdentityProvider>) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the signaling store
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the connection transport
    ///
    /// Defaults to the WebRTC transport when that feature is enabled.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn NegotiatorFactory>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the capture device
    #[must_use]
    pub fn with_capture(mut self, capture: Arc<dyn CaptureDevice>) -> Self {
        self.capture = Some(capture);
        self
    }

    fn transport(&mut self) -> Result<Arc<dyn NegotiatorFactory>, ServiceError> {
        if let Some(transport) = self.transport.take() {
            return Ok(transport);
        }
        #[cfg(feature = "webrtc-transport")]
        {
            Ok(Arc::new(crate::webrtc_transport::WebRtcTransport::new()))
        }
        #[cfg(not(feature = "webrtc-transport"))]
        {
            Err(ServiceError::MissingComponent("transport"))
        }
    }

    /// Validate configuration, resolve the local identity and start the
    /// call manager
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid, a component is missing,
    /// no user is signed in, or the session collection cannot be watched
    #[tracing::instrument(skip(self))]
    pub async fn start(mut self) -> Result<CallService, ServiceError> {
        self.config.validate()?;
        let transport = self.transport()?;
        let identity = self
            .identity
            .ok_or(ServiceError::MissingComponent("identity"))?;
        let store = self.store.ok_or(ServiceError::MissingComponent("store"))?;
        let capture = self
            .capture
            .ok_or(ServiceError::MissingComponent("capture"))?;

        let local = identity.local_identity().await?;
        tracing::info!(local = %local, "Starting call service");

        let signaling = Arc::new(SignalingChannel::new(store, self.config.signaling.clone()));
        let controller = CallSessionManager::start(
            local,
            self.config.clone(),
            signaling.clone(),
            transport,
            capture,
        )
        .await?;

        Ok(CallService {
            controller,
            signaling,
            config: self.config,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::{StaticDirectory, StaticIdentity};
    use crate::loopback::{LoopbackTransport, SimulatedCamera};
    use crate::memory_store::MemoryStore;
    use crate::types::CallState;

    fn builder() -> CallServiceBuilder {
        CallService::builder()
            .with_identity(Arc::new(StaticIdentity(Identity::new("a1", "Alice"))))
            .with_store(Arc::new(MemoryStore::new()))
            .with_transport(Arc::new(LoopbackTransport::new()))
            .with_capture(Arc::new(SimulatedCamera::new()))
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let service = builder().start().await.unwrap();
        assert_eq!(service.local_identity().id.as_str(), "a1");
        assert_eq!(service.controller().state(), CallState::Idle);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = CallConfig {
            ice_servers: vec![],
            ..CallConfig::default()
        };
        let res = builder().with_config(config).start().await;
        assert!(matches!(res, Err(ServiceError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_store() {
        let res = CallService::builder()
            .with_identity(Arc::new(StaticIdentity(Identity::new("a1", "Alice"))))
            .with_transport(Arc::new(LoopbackTransport::new()))
            .with_capture(Arc::new(SimulatedCamera::new()))
            .start()
            .await;
        assert!(matches!(res, Err(ServiceError::MissingComponent("store"))));
    }

    #[tokio::test]
    async fn test_call_unknown_peer() {
        let service = builder().start().await.unwrap();
        let directory = StaticDirectory::new(
            PeerId::new("a1"),
            vec![Identity::new("b1", "Bob")],
        );
        let res = service
            .call_peer(&directory, &PeerId::new("zz"), CallMode::Audio)
            .await;
        assert!(matches!(
            res,
            Err(ServiceError::Identity(IdentityError::PeerNotFound(_)))
        ));

        let id = service
            .call_peer(&directory, &PeerId::new("b1"), CallMode::Audio)
            .await
            .unwrap();
        assert!(!id.as_str().is_empty());
        service.shutdown().await.unwrap();
    }
}
