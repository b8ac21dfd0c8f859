//! Identity and membership types shared by every layer of the transport.
//!
//! - [`PeerId`]: 32-byte peer identifier, which is also the peer's Ed25519 public key
//! - [`Message`]: an authenticated inbound payload handed to protocol logic
//! - [`Don`] / [`DonPair`]: DON membership as produced by the DON registry
//! - [`Scope`]: who contributed a connection requirement

use crate::error::P2pError;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Unique identifier for a peer in the network.
///
/// The bytes are the peer's raw Ed25519 public key, so any holder of a `PeerId`
/// can verify signatures produced by that peer. Displayed and serialized as base58.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId {
    bytes: [u8; 32],
}

impl PeerId {
    /// Creates a `PeerId` from an Ed25519 public key.
    #[must_use]
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        Self {
            bytes: key.to_bytes(),
        }
    }

    /// Creates a `PeerId` from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Returns the raw bytes of the peer ID.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Interprets the peer ID as an Ed25519 verifying key.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::InvalidPeerId`] if the bytes are not a valid curve point.
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, P2pError> {
        VerifyingKey::from_bytes(&self.bytes)
            .map_err(|e| P2pError::InvalidPeerId(format!("{self}: {e}")))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(&self.bytes).into_string())
    }
}

impl FromStr for PeerId {
    type Err = P2pError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|e| P2pError::InvalidPeerId(format!("{s}: {e}")))?;
        let bytes: [u8; 32] = decoded.try_into().map_err(|v: Vec<u8>| {
            P2pError::InvalidPeerId(format!("{s}: expected 32 bytes, got {}", v.len()))
        })?;
        Ok(Self { bytes })
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An authenticated message received from a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The peer that sent (and signed) the payload.
    pub sender: PeerId,
    /// The application payload, without the authentication envelope.
    pub payload: Vec<u8>,
}

impl Message {
    /// Creates a new message.
    #[must_use]
    pub const fn new(sender: PeerId, payload: Vec<u8>) -> Self {
        Self { sender, payload }
    }
}

/// Identifier of a DON in the registry.
pub type DonId = u32;

/// A decentralized oracle network: an id and its member peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Don {
    /// Registry identifier.
    pub id: DonId,
    /// Member peers, in registry order.
    pub members: Vec<PeerId>,
}

impl Don {
    /// Creates a new DON.
    #[must_use]
    pub const fn new(id: DonId, members: Vec<PeerId>) -> Self {
        Self { id, members }
    }

    /// Returns true if `peer` is a member of this DON.
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.members.contains(peer)
    }

    /// Digest of the sorted membership, independent of registry order.
    fn membership_digest(&self) -> [u8; 32] {
        let mut members = self.members.clone();
        members.sort_unstable();
        members.dedup();
        let mut hasher = blake3::Hasher::new();
        for member in &members {
            hasher.update(member.as_bytes());
        }
        *hasher.finalize().as_bytes()
    }
}

/// Two DONs whose members must be able to talk to each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonPair {
    /// First DON of the pair.
    pub first: Don,
    /// Second DON of the pair.
    pub second: Don,
}

impl DonPair {
    /// Creates a new DON pair.
    #[must_use]
    pub const fn new(first: Don, second: Don) -> Self {
        Self { first, second }
    }

    /// Order-independent identity of this pair, including both memberships.
    ///
    /// A membership change on either side yields a different id.
    #[must_use]
    pub fn id(&self) -> DonPairId {
        let (a, b) = (
            (self.first.id, self.first.membership_digest()),
            (self.second.id, self.second.membership_digest()),
        );
        let (low, high) = if a <= b { (a, b) } else { (b, a) };

        let mut hasher = blake3::Hasher::new();
        hasher.update(&low.0.to_be_bytes());
        hasher.update(&low.1);
        hasher.update(&high.0.to_be_bytes());
        hasher.update(&high.1);

        DonPairId {
            low: low.0,
            high: high.0,
            digest: *hasher.finalize().as_bytes(),
        }
    }

    /// Members of the opposite DON(s) that `local` must connect to.
    ///
    /// Empty when `local` belongs to neither side. Never contains `local`.
    #[must_use]
    pub fn remote_members(&self, local: &PeerId) -> Vec<PeerId> {
        let mut remote = Vec::new();
        if self.first.contains(local) {
            remote.extend(self.second.members.iter().copied());
        }
        if self.second.contains(local) {
            remote.extend(self.first.members.iter().copied());
        }
        remote.retain(|p| p != local);
        remote.sort_unstable();
        remote.dedup();
        remote
    }
}

/// Identity of a [`DonPair`], used as a requirement scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DonPairId {
    low: DonId,
    high: DonId,
    digest: [u8; 32],
}

impl DonPairId {
    /// The smaller DON id of the pair.
    #[must_use]
    pub const fn low(&self) -> DonId {
        self.low
    }

    /// The larger DON id of the pair.
    #[must_use]
    pub const fn high(&self) -> DonId {
        self.high
    }
}

impl fmt::Display for DonPairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = bs58::encode(&self.digest[..8]).into_string();
        write!(f, "{}-{}-{short}", self.low, self.high)
    }
}

/// The contributor of a connection requirement.
///
/// Each scope owns its own desired peer set; updates from one scope never
/// erase requirements contributed by another.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// Scope used by [`Peer::update_connections`](crate::Peer::update_connections).
    Default,
    /// A single DON membership.
    Don(DonId),
    /// A DON-to-DON relationship registered through `update_connections_by_dons`.
    DonPair(DonPairId),
    /// Any other named controller.
    Named(String),
    /// Static bootstrap configuration. Reserved; callers cannot update it.
    Bootstrap,
    /// Peers that opened a link to this bootstrap node. Reserved.
    Inbound,
}

impl Scope {
    /// Returns true for scopes owned by the transport itself.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Bootstrap | Self::Inbound)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Don(id) => write!(f, "don/{id}"),
            Self::DonPair(id) => write!(f, "don-pair/{id}"),
            Self::Named(name) => write!(f, "named/{name}"),
            Self::Bootstrap => write!(f, "bootstrap"),
            Self::Inbound => write!(f, "inbound"),
        }
    }
}
