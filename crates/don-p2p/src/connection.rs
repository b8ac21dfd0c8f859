//! Link lifecycle and health tracking.
//!
//! - [`LinkPhase`]: `Unconnected -> Connecting -> Connected -> Draining -> Unconnected`
//! - [`LinkHealth`]: counters and timestamps for one link
//! - [`LinkReport`]: a point-in-time view of a peer's link, as exposed by health reports

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::StreamConfig;
use crate::protocol::{PeerId, Scope};

/// Phase of a peer link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LinkPhase {
    /// No transport is open, or the last handshake failed.
    Unconnected,
    /// Transport opened, handshake pending.
    Connecting,
    /// Handshake complete; the link carries messages.
    Connected,
    /// No longer required; queued frames are flushing, new sends are refused.
    Draining,
}

impl LinkPhase {
    /// Returns true if new messages may be sent.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self, Self::Connected)
    }

    /// Returns true if inbound frames are still accepted.
    #[must_use]
    pub const fn accepts_inbound(&self) -> bool {
        matches!(self, Self::Connected | Self::Draining)
    }
}

impl fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconnected => write!(f, "unconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Draining => write!(f, "draining"),
        }
    }
}

/// Health counters of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkHealth {
    /// When the current handshake completed.
    pub established_at: Option<DateTime<Utc>>,
    /// Last time a message was sent or received.
    pub last_seen: DateTime<Utc>,
    /// Messages accepted by the transport.
    pub messages_sent: u64,
    /// Messages delivered to the router.
    pub messages_received: u64,
    /// Payload bytes accepted by the transport.
    pub bytes_sent: u64,
    /// Payload bytes delivered to the router.
    pub bytes_received: u64,
    /// Inbound frames dropped for bad signatures.
    pub auth_failures: u64,
    /// Inbound messages dropped because the peer buffer was full.
    pub congestion_drops: u64,
    /// Inbound frames dropped for exceeding the maximum length.
    pub oversized_drops: u64,
    /// Consecutive failed open or handshake attempts.
    pub failed_attempts: u32,
    /// Most recent transport failure.
    pub last_error: Option<String>,
}

impl LinkHealth {
    /// Creates a new health tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            established_at: None,
            last_seen: Utc::now(),
            messages_sent: 0,
            messages_received: 0,
            bytes_sent: 0,
            bytes_received: 0,
            auth_failures: 0,
            congestion_drops: 0,
            oversized_drops: 0,
            failed_attempts: 0,
            last_error: None,
        }
    }

    /// Records a successful handshake.
    pub fn record_established(&mut self) {
        let now = Utc::now();
        self.established_at = Some(now);
        self.last_seen = now;
        self.failed_attempts = 0;
    }

    /// Records a failed open or handshake.
    pub fn record_failure(&mut self, reason: impl Into<String>) {
        self.established_at = None;
        self.failed_attempts = self.failed_attempts.saturating_add(1);
        self.last_error = Some(reason.into());
    }

    /// Records a sent message.
    pub fn record_sent(&mut self, len: usize) {
        self.messages_sent += 1;
        self.bytes_sent += len as u64;
        self.last_seen = Utc::now();
    }

    /// Records a received message.
    pub fn record_received(&mut self, len: usize) {
        self.messages_received += 1;
        self.bytes_received += len as u64;
        self.last_seen = Utc::now();
    }
}

impl Default for LinkHealth {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct LinkStatus {
    phase: LinkPhase,
    max_message_len: usize,
    health: LinkHealth,
}

/// Shared state of one link generation.
///
/// Owned jointly by the connection manager and the transport's
/// [`LinkEvents`](crate::transport::LinkEvents) handle. Never locks any
/// manager state, so transports may call into it from any context.
#[derive(Debug)]
pub(crate) struct LinkCell {
    peer_id: PeerId,
    generation: u64,
    status: Mutex<LinkStatus>,
    changed: Arc<Notify>,
}

impl LinkCell {
    pub(crate) fn new(
        peer_id: PeerId,
        generation: u64,
        max_message_len: usize,
        health: LinkHealth,
        changed: Arc<Notify>,
    ) -> Self {
        Self {
            peer_id,
            generation,
            status: Mutex::new(LinkStatus {
                phase: LinkPhase::Connecting,
                max_message_len,
                health,
            }),
            changed,
        }
    }

    pub(crate) const fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn phase(&self) -> LinkPhase {
        self.status.lock().phase
    }

    pub(crate) fn max_message_len(&self) -> usize {
        self.status.lock().max_message_len
    }

    pub(crate) fn set_max_message_len(&self, len: usize) {
        self.status.lock().max_message_len = len;
    }

    /// Moves to `to` if the current phase is one of `from`. Returns whether it moved.
    pub(crate) fn transition(&self, from: &[LinkPhase], to: LinkPhase) -> bool {
        let moved = {
            let mut status = self.status.lock();
            if from.contains(&status.phase) {
                status.phase = to;
                if to == LinkPhase::Connected {
                    status.health.record_established();
                }
                true
            } else {
                false
            }
        };
        if moved {
            self.changed.notify_waiters();
        }
        moved
    }

    /// Returns the link to `Unconnected` and records the failure.
    ///
    /// Returns the phase the link left, or `None` if it was already down.
    /// Exactly one of several racing callers sees `Some`.
    pub(crate) fn fail(&self, reason: &str) -> Option<LinkPhase> {
        let was = {
            let mut status = self.status.lock();
            if status.phase == LinkPhase::Unconnected {
                return None;
            }
            status.health.record_failure(reason);
            std::mem::replace(&mut status.phase, LinkPhase::Unconnected)
        };
        self.changed.notify_waiters();
        Some(was)
    }

    pub(crate) fn with_health<R>(&self, f: impl FnOnce(&mut LinkHealth) -> R) -> R {
        f(&mut self.status.lock().health)
    }

    pub(crate) fn health(&self) -> LinkHealth {
        self.status.lock().health.clone()
    }
}

/// Point-in-time view of a peer's link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkReport {
    /// The remote peer.
    pub peer_id: PeerId,
    /// Current phase.
    pub phase: LinkPhase,
    /// True if the link is required but down and waiting for a retry.
    pub retrying: bool,
    /// Merged config the link runs with.
    pub effective_config: Option<StreamConfig>,
    /// Scopes currently requiring this peer.
    pub scopes: Vec<Scope>,
    /// True if the peer is a configured bootstrapper.
    pub bootstrap: bool,
    /// Inbound messages waiting in the peer's buffer.
    pub queued_inbound: usize,
    /// Link health counters.
    pub health: LinkHealth,
}
