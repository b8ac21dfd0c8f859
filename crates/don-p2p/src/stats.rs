//! Service-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of a peer service's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    /// Accepted `update_connections*` calls.
    pub updates: u64,
    /// Transport links opened.
    pub links_opened: u64,
    /// Transport links closed.
    pub links_closed: u64,
    /// Live reconfigurations applied to open links.
    pub reconfigurations: u64,
    /// Links drained and reopened because their maximum length shrank.
    pub reopens: u64,
    /// Failed opens and handshakes.
    pub link_failures: u64,
    /// Messages handed to the transport.
    pub messages_sent: u64,
    /// Messages delivered to the router.
    pub messages_received: u64,
    /// Sends refused by a token bucket.
    pub rate_limited: u64,
    /// Inbound frames that failed verification.
    pub auth_failures: u64,
    /// Inbound messages dropped on a full peer buffer.
    pub congestion_drops: u64,
    /// Inbound frames over the link's maximum length.
    pub oversized_drops: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) updates: AtomicU64,
    pub(crate) links_opened: AtomicU64,
    pub(crate) links_closed: AtomicU64,
    pub(crate) reconfigurations: AtomicU64,
    pub(crate) reopens: AtomicU64,
    pub(crate) link_failures: AtomicU64,
    pub(crate) messages_sent: AtomicU64,
    pub(crate) messages_received: AtomicU64,
    pub(crate) rate_limited: AtomicU64,
    pub(crate) auth_failures: AtomicU64,
    pub(crate) congestion_drops: AtomicU64,
    pub(crate) oversized_drops: AtomicU64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub(crate) fn snapshot(&self) -> PeerStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        PeerStats {
            updates: load(&self.updates),
            links_opened: load(&self.links_opened),
            links_closed: load(&self.links_closed),
            reconfigurations: load(&self.reconfigurations),
            reopens: load(&self.reopens),
            link_failures: load(&self.link_failures),
            messages_sent: load(&self.messages_sent),
            messages_received: load(&self.messages_received),
            rate_limited: load(&self.rate_limited),
            auth_failures: load(&self.auth_failures),
            congestion_drops: load(&self.congestion_drops),
            oversized_drops: load(&self.oversized_drops),
        }
    }
}
