//! Error types for don-p2p.

use thiserror::Error;

use crate::connection::LinkPhase;
use crate::peer::ServiceState;
use crate::protocol::PeerId;
use crate::rate_limit::RateLimitKind;

/// Errors that can occur in transport operations.
#[derive(Debug, Error)]
pub enum P2pError {
    /// No connection state exists for the peer.
    #[error("no connection to peer {peer_id}")]
    NotFound {
        /// The peer that was addressed.
        peer_id: PeerId,
    },

    /// Not enough tokens in one of the link's buckets.
    #[error("rate limit exceeded for peer {peer_id} ({limit})")]
    RateLimitExceeded {
        /// The peer whose link is exhausted.
        peer_id: PeerId,
        /// Which bucket ran dry.
        limit: RateLimitKind,
    },

    /// Handshake or link-level failure.
    #[error("transport to peer {peer_id} failed: {reason}")]
    TransportFailed {
        /// The remote peer.
        peer_id: PeerId,
        /// Transport-provided reason.
        reason: String,
    },

    /// Payload exceeds the link's maximum message length.
    #[error("payload of {len} bytes to peer {peer_id} exceeds limit of {max} bytes")]
    PayloadTooLarge {
        /// The addressed peer.
        peer_id: PeerId,
        /// Payload length in bytes.
        len: usize,
        /// Maximum allowed length in bytes.
        max: usize,
    },

    /// Inbound frame failed signature verification.
    #[error("authentication failed for message from {peer_id}: {reason}")]
    AuthenticationFailed {
        /// The claimed sender.
        peer_id: PeerId,
        /// Why verification failed.
        reason: String,
    },

    /// Malformed stream or peer configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The link exists but cannot carry new messages.
    #[error("link to peer {peer_id} is {phase}")]
    LinkUnavailable {
        /// The addressed peer.
        peer_id: PeerId,
        /// Current link phase.
        phase: LinkPhase,
    },

    /// The service is not running.
    #[error("peer service is {state}")]
    NotRunning {
        /// Current service state.
        state: ServiceState,
    },

    /// The receive channel was already handed out.
    #[error("receive channel already taken")]
    ReceiverTaken,

    /// Key acquisition or signing failed.
    #[error("signer error: {0}")]
    Signer(String),

    /// A peer id could not be decoded.
    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    /// An await helper gave up before its condition held.
    #[error("timed out with {pending} links not yet connected")]
    Timeout {
        /// Number of required links still not connected.
        pending: usize,
    },

    /// No async runtime is available, or it has shut down.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl P2pError {
    /// Returns true if the caller can back off and retry the same operation.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. }
                | Self::LinkUnavailable { .. }
                | Self::TransportFailed { .. }
        )
    }
}

/// Result type for don-p2p operations.
pub type P2pResult<T> = Result<T, P2pError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerId {
        PeerId::from_bytes([7u8; 32])
    }

    #[test]
    fn display_rate_limit_names_bucket() {
        let err = P2pError::RateLimitExceeded {
            peer_id: peer(),
            limit: RateLimitKind::Bytes,
        };
        let msg = err.to_string();
        assert!(msg.contains("rate limit exceeded"));
        assert!(msg.contains("bytes"));
        assert!(msg.contains(&peer().to_string()));
    }

    #[test]
    fn display_payload_too_large() {
        let err = P2pError::PayloadTooLarge {
            peer_id: peer(),
            len: 1000,
            max: 500,
        };
        assert!(err.to_string().contains("1000 bytes"));
        assert!(err.to_string().contains("500 bytes"));
    }

    #[test]
    fn display_link_unavailable_names_phase() {
        let err = P2pError::LinkUnavailable {
            peer_id: peer(),
            phase: LinkPhase::Draining,
        };
        assert!(err.to_string().contains("draining"));
    }

    #[test]
    fn display_not_running() {
        let err = P2pError::NotRunning {
            state: ServiceState::Stopped,
        };
        assert_eq!(err.to_string(), "peer service is stopped");
    }

    #[test]
    fn retryable_classification() {
        assert!(
            P2pError::RateLimitExceeded {
                peer_id: peer(),
                limit: RateLimitKind::Messages
            }
            .is_retryable()
        );
        assert!(
            P2pError::TransportFailed {
                peer_id: peer(),
                reason: "reset".into()
            }
            .is_retryable()
        );
        assert!(!P2pError::NotFound { peer_id: peer() }.is_retryable());
        assert!(!P2pError::InvalidConfig("zero capacity".into()).is_retryable());
        assert!(
            !P2pError::PayloadTooLarge {
                peer_id: peer(),
                len: 2,
                max: 1
            }
            .is_retryable()
        );
    }
}
