//! The desired-peer-set surface consumed from the DON registry.

use std::collections::HashMap;

use crate::config::StreamConfig;
use crate::protocol::{Don, PeerId};

/// Source of the peers a scope should be connected to.
pub trait DonRegistry: Send + Sync {
    /// Every peer that should be connected, with the stream policy it needs.
    fn desired_peers(&self) -> HashMap<PeerId, StreamConfig>;
}

impl DonRegistry for HashMap<PeerId, StreamConfig> {
    fn desired_peers(&self) -> HashMap<PeerId, StreamConfig> {
        self.clone()
    }
}

/// Registry snapshot listing the DONs the local node works with.
///
/// Every member of every listed DON is desired with the snapshot's stream
/// config. Empty DONs contribute nothing.
#[derive(Debug, Clone, Default)]
pub struct DonMembershipRegistry {
    dons: Vec<Don>,
    config: StreamConfig,
}

impl DonMembershipRegistry {
    /// Creates a snapshot.
    #[must_use]
    pub const fn new(dons: Vec<Don>, config: StreamConfig) -> Self {
        Self { dons, config }
    }

    /// Adds a DON to the snapshot.
    #[must_use]
    pub fn with_don(mut self, don: Don) -> Self {
        self.dons.push(don);
        self
    }

    /// DONs in the snapshot.
    #[must_use]
    pub fn dons(&self) -> &[Don] {
        &self.dons
    }
}

impl DonRegistry for DonMembershipRegistry {
    fn desired_peers(&self) -> HashMap<PeerId, StreamConfig> {
        self.dons
            .iter()
            .flat_map(|don| don.members.iter().copied())
            .map(|peer| (peer, self.config))
            .collect()
    }
}
