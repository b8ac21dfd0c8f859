//! # don-p2p
//!
//! Peer-to-peer transport core for nodes that take part in many decentralized
//! oracle networks (DONs) at once over one pool of peer links.
//!
//! This crate provides:
//!
//! - Connection-set reconciliation: every DON contributes the peers it needs,
//!   and each link runs with the field-wise maximum of the requested policies
//! - Bootstrap peers that stay connected regardless of DON membership
//! - Per-link token bucket rate limiting on message count and bytes
//! - A single merged inbound channel with per-sender FIFO and drop-newest backpressure
//! - Ed25519 message authentication bound to sender and recipient
//! - An in-memory transport for tests and simulation
//!
//! ## Core Types
//!
//! - [`PeerId`]: 32-byte peer identifier, the peer's Ed25519 public key
//! - [`StreamConfig`]: per-link buffer sizes, maximum message length and rate limits
//! - [`ConnectionManager`]: the concrete [`Peer`] / [`SharedPeer`] implementation
//! - [`Transport`] / [`Link`]: the interface consumed from the secure transport
//! - [`MemoryNetwork`]: an in-process [`Transport`]
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use don_p2p::{
//!     ConnectionManager, Ed25519Signer, KeySource, MemoryNetwork, Peer, PeerConfig, PeerId,
//!     Signer, StreamConfig,
//! };
//!
//! # async fn run(remote: PeerId) -> don_p2p::P2pResult<()> {
//! let signer = Arc::new(Ed25519Signer::new(KeySource::Generate));
//! signer.initialize()?;
//! let transport = MemoryNetwork::new().transport(signer.peer_id()?);
//! let manager = Arc::new(ConnectionManager::new(PeerConfig::default(), transport, signer)?);
//! manager.start()?;
//!
//! manager.update_connections(&HashMap::from([(remote, StreamConfig::default())]))?;
//! let mut inbound = manager.receive()?;
//! manager.send(remote, b"hello")?;
//! while let Some(message) = inbound.recv().await {
//!     println!("{} bytes from {}", message.payload.len(), message.sender);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod memory;
pub mod peer;
pub mod protocol;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod signer;
pub mod stats;
pub mod transport;

pub use config::{
    BootstrapperLocator, DEFAULT_RECEIVE_CHANNEL_SIZE, PeerConfig, StreamConfig, TokenBucketParams,
};
pub use connection::{LinkHealth, LinkPhase, LinkReport};
pub use error::{P2pError, P2pResult};
pub use manager::ConnectionManager;
pub use memory::{MemoryLink, MemoryNetwork, MemoryTransport};
pub use peer::{Peer, PeerWrapper, ServiceState, SharedPeer, SingletonPeerWrapper};
pub use protocol::{Don, DonId, DonPair, DonPairId, Message, PeerId, Scope};
pub use rate_limit::{LinkRateLimiter, RateLimitKind, RateLimiterSnapshot, TokenBucket};
pub use registry::{DonMembershipRegistry, DonRegistry};
pub use router::MessageReceiver;
pub use signer::{Ed25519Signer, KeySource, SIGNATURE_LEN, Signer};
pub use stats::PeerStats;
pub use transport::{Delivery, InboundRequests, Link, LinkEvents, Transport};
