//! The boundary to the secure transport.
//!
//! The connection manager asks a [`Transport`] to open a [`Link`] to a peer
//! and hands it a [`LinkEvents`] handle. The transport reports handshake
//! completion, inbound frames and closure through that handle. Frames are
//! opaque to the transport: `signature || payload` as built by
//! [`signer::seal`](crate::signer::seal).

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StreamConfig;
use crate::connection::{LinkCell, LinkPhase};
use crate::error::P2pResult;
use crate::protocol::{Message, PeerId};
use crate::router::{Enqueue, PeerQueue};
use crate::signer::{self, SIGNATURE_LEN};
use crate::stats::{bump, Counters};

/// An open connection to one remote peer.
pub trait Link: Send + Sync + fmt::Debug {
    /// Queues a frame for transmission without blocking.
    fn send(&self, frame: Vec<u8>) -> P2pResult<()>;

    /// Applies new buffer sizes to the live link.
    fn reconfigure(&self, config: &StreamConfig);

    /// Size of the largest frame still queued for transmission.
    fn largest_queued_frame(&self) -> usize {
        0
    }

    /// Starts closing the link. Queued frames may still be flushed; the
    /// transport reports [`LinkEvents::closed`] once done.
    fn close(&self);
}

/// Opens links to remote peers.
pub trait Transport: Send + Sync + fmt::Debug {
    /// Starts opening a link to `remote`.
    ///
    /// Returning `Ok` means the attempt is under way; the handshake outcome is
    /// reported through `events`.
    fn open(
        &self,
        remote: PeerId,
        config: &StreamConfig,
        events: LinkEvents,
    ) -> P2pResult<Arc<dyn Link>>;

    /// Registers the local node to hear about peers that open a link to it
    /// without a matching open on this side.
    ///
    /// Only bootstrap nodes listen. Transports that complete handshakes on
    /// their own may ignore this.
    fn listen(&self, _inbound: InboundRequests) {}
}

/// Handle a transport uses to report unsolicited inbound links.
///
/// Reporting never blocks and takes no manager locks; the manager serves
/// the request from its maintenance task.
#[derive(Debug, Clone)]
pub struct InboundRequests {
    local: PeerId,
    requests: mpsc::UnboundedSender<PeerId>,
}

impl InboundRequests {
    pub(crate) const fn new(local: PeerId, requests: mpsc::UnboundedSender<PeerId>) -> Self {
        Self { local, requests }
    }

    /// The listening peer.
    #[must_use]
    pub const fn local(&self) -> PeerId {
        self.local
    }

    /// Reports that `remote` is trying to link to the local node.
    pub fn opened_by(&self, remote: PeerId) {
        debug!(local = %self.local, remote = %remote, "inbound link requested");
        // The manager may already be gone.
        let _ = self.requests.send(remote);
    }
}

/// What happened to an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Buffered for the consumer.
    Queued,
    /// Dropped: the peer's buffer was full.
    Congested,
    /// Dropped: the payload exceeds the link's maximum length.
    Oversized,
    /// Dropped: the signature did not verify.
    Unauthenticated,
    /// Dropped: the link is not accepting frames.
    Inactive,
}

/// Notification from a link to its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LinkDown {
    pub(crate) peer_id: PeerId,
    pub(crate) generation: u64,
    /// True if the link was draining, i.e. closed on purpose.
    pub(crate) drained: bool,
}

/// Handle a transport uses to report on one link.
///
/// Cheap to clone. Safe to call from any thread and from inside
/// [`Transport::open`], [`Link::send`] or [`Link::close`].
#[derive(Clone)]
pub struct LinkEvents {
    local: PeerId,
    cell: Arc<LinkCell>,
    queue: Arc<PeerQueue>,
    counters: Arc<Counters>,
    signals: mpsc::UnboundedSender<LinkDown>,
}

impl fmt::Debug for LinkEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEvents")
            .field("local", &self.local)
            .field("remote", &self.cell.peer_id())
            .field("generation", &self.cell.generation())
            .finish_non_exhaustive()
    }
}

impl LinkEvents {
    pub(crate) const fn new(
        local: PeerId,
        cell: Arc<LinkCell>,
        queue: Arc<PeerQueue>,
        counters: Arc<Counters>,
        signals: mpsc::UnboundedSender<LinkDown>,
    ) -> Self {
        Self {
            local,
            cell,
            queue,
            counters,
            signals,
        }
    }

    /// The local peer.
    #[must_use]
    pub const fn local(&self) -> PeerId {
        self.local
    }

    /// The remote peer of this link.
    #[must_use]
    pub fn remote(&self) -> PeerId {
        self.cell.peer_id()
    }

    /// Current phase of the link.
    #[must_use]
    pub fn phase(&self) -> LinkPhase {
        self.cell.phase()
    }

    /// Reports a completed handshake.
    pub fn established(&self) {
        if self
            .cell
            .transition(&[LinkPhase::Connecting], LinkPhase::Connected)
        {
            info!(peer_id = %self.remote(), generation = self.cell.generation(), "link connected");
        }
    }

    /// Reports a failed handshake or a broken link.
    pub fn failed(&self, reason: &str) {
        let Some(was) = self.cell.fail(reason) else {
            return;
        };
        if was == LinkPhase::Draining {
            debug!(peer_id = %self.remote(), reason, "draining link dropped");
        } else {
            bump(&self.counters.link_failures);
            warn!(peer_id = %self.remote(), reason, "link failed");
        }
        self.signal(was == LinkPhase::Draining);
    }

    /// Reports that the link is closed and its queued frames are flushed.
    pub fn closed(&self) {
        if self
            .cell
            .transition(&[LinkPhase::Draining], LinkPhase::Unconnected)
        {
            debug!(peer_id = %self.remote(), "link drained");
            self.signal(true);
        } else {
            self.failed("closed by remote");
        }
    }

    /// Authenticates an inbound frame and buffers its payload.
    ///
    /// Never blocks. Dropped frames are counted, never surfaced.
    pub fn deliver(&self, frame: &[u8]) -> Delivery {
        let remote = self.remote();
        if !self.cell.phase().accepts_inbound() {
            return Delivery::Inactive;
        }

        let payload_len = frame.len().saturating_sub(SIGNATURE_LEN);
        let max = self.cell.max_message_len();
        if payload_len > max {
            bump(&self.counters.oversized_drops);
            self.cell.with_health(|h| h.oversized_drops += 1);
            debug!(peer_id = %remote, len = payload_len, max, "dropping oversized frame");
            return Delivery::Oversized;
        }

        let payload = match signer::open(&remote, &self.local, frame) {
            Ok(payload) => payload,
            Err(e) => {
                bump(&self.counters.auth_failures);
                self.cell.with_health(|h| h.auth_failures += 1);
                debug!(peer_id = %remote, error = %e, "dropping unauthenticated frame");
                return Delivery::Unauthenticated;
            }
        };

        let len = payload.len();
        match self.queue.push(Message::new(remote, payload.to_vec())) {
            Enqueue::Queued => {
                bump(&self.counters.messages_received);
                self.cell.with_health(|h| h.record_received(len));
                Delivery::Queued
            }
            Enqueue::Full => {
                bump(&self.counters.congestion_drops);
                self.cell.with_health(|h| h.congestion_drops += 1);
                Delivery::Congested
            }
            Enqueue::Closed => Delivery::Inactive,
        }
    }

    fn signal(&self, drained: bool) {
        // The manager may already be gone.
        let _ = self.signals.send(LinkDown {
            peer_id: self.remote(),
            generation: self.cell.generation(),
            drained,
        });
    }
}
