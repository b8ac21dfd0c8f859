//! In-process transport.
//!
//! [`MemoryNetwork`] connects any number of peer services living in the same
//! process. A link between A and B is established once both A and B have
//! opened it. Closing either end drops the link on both sides; the side that
//! did not close sees a failure and retries while it still needs the link.
//! A listening node (a bootstrapper) hears about every peer that opens to it
//! first, so it can open its own end.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::StreamConfig;
use crate::error::{P2pError, P2pResult};
use crate::protocol::PeerId;
use crate::transport::{InboundRequests, Link, LinkEvents, Transport};

#[derive(Debug)]
struct Endpoint {
    id: u64,
    events: LinkEvents,
}

#[derive(Debug, Default)]
struct NetworkState {
    /// Keyed by `(local, remote)`.
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
    unreachable: HashSet<PeerId>,
    listeners: HashMap<PeerId, InboundRequests>,
    opens: HashMap<PeerId, u64>,
    closes: HashMap<PeerId, u64>,
}

impl NetworkState {
    /// Removes both ends of the `a`-`b` link, returning their event handles.
    fn sever(&mut self, a: PeerId, b: PeerId) -> Vec<LinkEvents> {
        [(a, b), (b, a)]
            .iter()
            .filter_map(|key| self.endpoints.remove(key))
            .map(|endpoint| endpoint.events)
            .collect()
    }
}

/// A simulated network shared by in-process peers.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the transport used by `local`.
    #[must_use]
    pub fn transport(&self, local: PeerId) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            network: self.clone(),
            local,
        })
    }

    /// Makes `peer` unreachable (cutting its current links) or reachable again.
    pub fn set_unreachable(&self, peer: PeerId, unreachable: bool) {
        let severed = {
            let mut state = self.state.lock();
            if !unreachable {
                state.unreachable.remove(&peer);
                return;
            }
            state.unreachable.insert(peer);
            let remotes: Vec<PeerId> = state
                .endpoints
                .keys()
                .filter(|(local, _)| *local == peer)
                .map(|(_, remote)| *remote)
                .collect();
            let mut severed = Vec::new();
            for remote in remotes {
                severed.extend(state.sever(peer, remote));
            }
            severed
        };
        for events in severed {
            events.failed("peer unreachable");
        }
    }

    /// Links `peer` has opened so far.
    #[must_use]
    pub fn open_count(&self, peer: &PeerId) -> u64 {
        self.state.lock().opens.get(peer).copied().unwrap_or(0)
    }

    /// Links `peer` has closed so far.
    #[must_use]
    pub fn close_count(&self, peer: &PeerId) -> u64 {
        self.state.lock().closes.get(peer).copied().unwrap_or(0)
    }

    /// Returns true if both ends of the `a`-`b` link are open.
    #[must_use]
    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        let state = self.state.lock();
        state.endpoints.contains_key(&(*a, *b)) && state.endpoints.contains_key(&(*b, *a))
    }
}

/// One peer's view of a [`MemoryNetwork`].
#[derive(Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: PeerId,
}

impl Transport for MemoryTransport {
    fn open(
        &self,
        remote: PeerId,
        _config: &StreamConfig,
        events: LinkEvents,
    ) -> P2pResult<Arc<dyn Link>> {
        let id = self.network.next_id.fetch_add(1, Ordering::Relaxed);
        let (pair, replaced, listener) = {
            let mut state = self.network.state.lock();
            if state.unreachable.contains(&remote) || state.unreachable.contains(&self.local) {
                return Err(P2pError::TransportFailed {
                    peer_id: remote,
                    reason: "unreachable".to_string(),
                });
            }
            *state.opens.entry(self.local).or_default() += 1;
            let replaced = state.endpoints.insert(
                (self.local, remote),
                Endpoint {
                    id,
                    events: events.clone(),
                },
            );
            let pair = state
                .endpoints
                .get(&(remote, self.local))
                .map(|endpoint| endpoint.events.clone());
            let listener = if pair.is_none() {
                state.listeners.get(&remote).cloned()
            } else {
                None
            };
            (pair, replaced, listener)
        };

        if let Some(old) = replaced {
            old.events.failed("superseded by a new link");
        }
        if let Some(remote_events) = pair {
            // Both ends are open: the handshake completes on each side.
            remote_events.established();
            events.established();
        }
        if let Some(listener) = listener {
            listener.opened_by(self.local);
        }
        debug!(local = %self.local, remote = %remote, "memory link opened");

        Ok(Arc::new(MemoryLink {
            network: self.network.clone(),
            local: self.local,
            remote,
            id,
        }))
    }

    fn listen(&self, inbound: InboundRequests) {
        let waiting: Vec<PeerId> = {
            let mut state = self.network.state.lock();
            state.listeners.insert(self.local, inbound.clone());
            state
                .endpoints
                .keys()
                .filter(|(opener, target)| {
                    *target == self.local && !state.endpoints.contains_key(&(self.local, *opener))
                })
                .map(|(opener, _)| *opener)
                .collect()
        };
        // Peers that opened before this node started listening.
        for peer in waiting {
            inbound.opened_by(peer);
        }
    }
}

/// One end of an in-memory link.
#[derive(Debug)]
pub struct MemoryLink {
    network: MemoryNetwork,
    local: PeerId,
    remote: PeerId,
    id: u64,
}

impl Link for MemoryLink {
    fn send(&self, frame: Vec<u8>) -> P2pResult<()> {
        let remote_events = {
            let state = self.network.state.lock();
            let ours = state.endpoints.get(&(self.local, self.remote));
            if ours.is_none_or(|endpoint| endpoint.id != self.id) {
                return Err(P2pError::TransportFailed {
                    peer_id: self.remote,
                    reason: "link closed".to_string(),
                });
            }
            state
                .endpoints
                .get(&(self.remote, self.local))
                .map(|endpoint| endpoint.events.clone())
                .ok_or_else(|| P2pError::TransportFailed {
                    peer_id: self.remote,
                    reason: "remote end not open".to_string(),
                })?
        };
        // The receiver's drop policy applies; delivery never blocks the sender.
        remote_events.deliver(&frame);
        Ok(())
    }

    fn reconfigure(&self, _config: &StreamConfig) {}

    fn close(&self) {
        let (ours, severed) = {
            let mut state = self.network.state.lock();
            let is_current = state
                .endpoints
                .get(&(self.local, self.remote))
                .is_some_and(|endpoint| endpoint.id == self.id);
            if !is_current {
                return;
            }
            *state.closes.entry(self.local).or_default() += 1;
            let ours = state
                .endpoints
                .remove(&(self.local, self.remote))
                .map(|endpoint| endpoint.events);
            let severed = state.sever(self.remote, self.local);
            (ours, severed)
        };
        // Nothing is ever queued in memory, so draining completes at once.
        if let Some(events) = ours {
            events.closed();
        }
        for events in severed {
            events.failed("closed by remote");
        }
    }
}
