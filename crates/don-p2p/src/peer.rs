//! The façade protocol code depends on.
//!
//! - [`Peer`]: connections for a single requirement set, send and receive
//! - [`SharedPeer`]: a peer shared by several DONs
//! - [`PeerWrapper`] / [`SingletonPeerWrapper`]: lifecycle-managed access to the shared peer

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{PeerConfig, StreamConfig};
use crate::error::P2pResult;
use crate::manager::ConnectionManager;
use crate::protocol::{DonPair, PeerId};
use crate::router::MessageReceiver;
use crate::signer::Signer;
use crate::transport::Transport;

/// Lifecycle of a peer service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    /// Constructed, not yet started.
    Created,
    /// Accepting updates, sends and receives.
    Running,
    /// Shut down. A stopped service cannot be restarted.
    Stopped,
}

impl ServiceState {
    /// Returns true if the service accepts operations.
    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A node's messaging endpoint.
pub trait Peer: Send + Sync {
    /// Identity of the local node.
    fn id(&self) -> PeerId;

    /// Replaces the default scope's desired peers.
    ///
    /// Requirements from other scopes for the same peers are kept.
    fn update_connections(&self, desired: &HashMap<PeerId, StreamConfig>) -> P2pResult<()>;

    /// Sends `payload` to `peer` without blocking.
    fn send(&self, peer: PeerId, payload: &[u8]) -> P2pResult<()>;

    /// Hands out the merged inbound channel. Succeeds once per service.
    fn receive(&self) -> P2pResult<MessageReceiver>;

    /// Returns true if the local node is a configured bootstrapper.
    fn is_bootstrap(&self) -> bool;
}

/// A [`Peer`] shared by every DON the node belongs to.
pub trait SharedPeer: Peer {
    /// Replaces the set of DON pairs the node takes part in.
    ///
    /// Each pair with the local node on one side requires links to every
    /// member of the other side, using `config`.
    fn update_connections_by_dons(&self, pairs: &[DonPair], config: StreamConfig) -> P2pResult<()>;
}

/// Lifecycle-managed access to the node's shared peer.
pub trait PeerWrapper: Send + Sync {
    /// The running peer, or `None` before start and after stop.
    fn get_peer(&self) -> Option<Arc<dyn SharedPeer>>;
}

/// Owns the node's single [`ConnectionManager`].
#[derive(Debug)]
pub struct SingletonPeerWrapper {
    config: PeerConfig,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    peer: RwLock<Option<Arc<ConnectionManager>>>,
}

impl SingletonPeerWrapper {
    /// Creates a wrapper. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(config: PeerConfig, transport: Arc<dyn Transport>, signer: Arc<dyn Signer>) -> Self {
        Self {
            config,
            transport,
            signer,
            peer: RwLock::new(None),
        }
    }

    /// Creates and starts the peer. A no-op if it is already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the signer cannot
    /// initialize, or no async runtime is available.
    pub fn start(&self) -> P2pResult<()> {
        let mut peer = self.peer.write();
        if peer.is_some() {
            return Ok(());
        }
        let manager = Arc::new(ConnectionManager::new(
            self.config.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.signer),
        )?);
        manager.start()?;
        info!(peer_id = %manager.local_id(), "shared peer started");
        *peer = Some(manager);
        Ok(())
    }

    /// Stops the peer. Consumers holding it see `NotRunning` from then on.
    pub async fn stop(&self) {
        let manager = self.peer.write().take();
        if let Some(manager) = manager {
            manager.stop().await;
        }
    }

    /// The concrete manager, for diagnostics.
    #[must_use]
    pub fn manager(&self) -> Option<Arc<ConnectionManager>> {
        self.peer.read().clone()
    }
}

impl PeerWrapper for SingletonPeerWrapper {
    fn get_peer(&self) -> Option<Arc<dyn SharedPeer>> {
        self.peer
            .read()
            .clone()
            .map(|manager| manager as Arc<dyn SharedPeer>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::P2pError;
    use crate::memory::MemoryNetwork;
    use crate::signer::{Ed25519Signer, KeySource};

    fn wrapper() -> SingletonPeerWrapper {
        let signer = Arc::new(Ed25519Signer::new(KeySource::Seed([5u8; 32])));
        signer.initialize().unwrap();
        let transport = MemoryNetwork::new().transport(signer.peer_id().unwrap());
        SingletonPeerWrapper::new(PeerConfig::default(), transport, signer)
    }

    #[test]
    fn service_state_display() {
        assert_eq!(ServiceState::Created.to_string(), "created");
        assert_eq!(ServiceState::Running.to_string(), "running");
        assert_eq!(ServiceState::Stopped.to_string(), "stopped");
        assert!(ServiceState::Running.is_running());
        assert!(!ServiceState::Stopped.is_running());
    }

    #[test]
    fn no_peer_before_start() {
        assert!(wrapper().get_peer().is_none());
    }

    #[test]
    fn start_outside_runtime_fails() {
        let wrapper = wrapper();
        assert!(matches!(wrapper.start(), Err(P2pError::Runtime(_))));
        assert!(wrapper.get_peer().is_none());
    }

    #[tokio::test]
    async fn start_exposes_running_peer() {
        let wrapper = wrapper();
        wrapper.start().unwrap();

        let peer = wrapper.get_peer().unwrap();
        assert_eq!(peer.id(), Ed25519Signer::from_seed([5u8; 32]).peer_id().unwrap());
        assert!(!peer.is_bootstrap());
        assert!(peer.update_connections(&HashMap::new()).is_ok());

        // A second start keeps the same instance.
        let first = wrapper.manager().unwrap();
        wrapper.start().unwrap();
        assert!(Arc::ptr_eq(&first, &wrapper.manager().unwrap()));
    }

    #[tokio::test]
    async fn stop_invalidates_handed_out_peer() {
        let wrapper = wrapper();
        wrapper.start().unwrap();
        let peer = wrapper.get_peer().unwrap();

        wrapper.stop().await;

        assert!(wrapper.get_peer().is_none());
        let err = peer.update_connections(&HashMap::new()).unwrap_err();
        assert!(matches!(err, P2pError::NotRunning { state: ServiceState::Stopped }));
    }
}
