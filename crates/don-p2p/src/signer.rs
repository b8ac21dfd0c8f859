//! Message authentication.
//!
//! Every outbound payload travels as `signature || payload`. The signature
//! covers a domain tag, the sender, the recipient and the payload, so a frame
//! captured on one link cannot be replayed to another recipient. Because a
//! [`PeerId`] is the sender's Ed25519 public key, any peer can verify a frame
//! without a key exchange.

use std::fmt;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use tracing::debug;

use crate::error::{P2pError, P2pResult};
use crate::protocol::PeerId;

/// Length of the signature prefix on every frame.
pub const SIGNATURE_LEN: usize = 64;

const DOMAIN: &[u8] = b"don-p2p/v1/message";

/// Produces signatures verifiable against the signer's [`PeerId`].
pub trait Signer: Send + Sync + fmt::Debug {
    /// Acquires key material. Must succeed before the first [`sign`](Self::sign).
    ///
    /// Calling it again is a no-op.
    fn initialize(&self) -> P2pResult<()>;

    /// Signs `data`.
    fn sign(&self, data: &[u8]) -> P2pResult<Vec<u8>>;

    /// Public identity of the signer.
    fn peer_id(&self) -> P2pResult<PeerId>;
}

/// Where an [`Ed25519Signer`] gets its key.
#[derive(Clone)]
pub enum KeySource {
    /// A fixed 32-byte secret seed.
    Seed([u8; 32]),
    /// A fresh random key generated at initialization.
    Generate,
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seed(_) => write!(f, "Seed(<redacted>)"),
            Self::Generate => write!(f, "Generate"),
        }
    }
}

/// [`Signer`] backed by an in-process Ed25519 key.
pub struct Ed25519Signer {
    source: KeySource,
    key: RwLock<Option<SigningKey>>,
}

impl Ed25519Signer {
    /// Creates an uninitialized signer.
    #[must_use]
    pub const fn new(source: KeySource) -> Self {
        Self {
            source,
            key: RwLock::new(None),
        }
    }

    /// Creates a signer from a seed and initializes it.
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&seed);
        Self {
            source: KeySource::Seed(seed),
            key: RwLock::new(Some(signing_key)),
        }
    }

    fn not_initialized() -> P2pError {
        P2pError::Signer("signer used before initialize()".to_string())
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("source", &self.source)
            .field("initialized", &self.key.read().is_some())
            .finish()
    }
}

impl Signer for Ed25519Signer {
    fn initialize(&self) -> P2pResult<()> {
        let mut key = self.key.write();
        if key.is_some() {
            return Ok(());
        }
        let signing_key = match &self.source {
            KeySource::Seed(seed) => SigningKey::from_bytes(seed),
            KeySource::Generate => SigningKey::generate(&mut OsRng),
        };
        debug!(
            peer_id = %PeerId::from_public_key(&signing_key.verifying_key()),
            "signer initialized"
        );
        *key = Some(signing_key);
        Ok(())
    }

    fn sign(&self, data: &[u8]) -> P2pResult<Vec<u8>> {
        let key = self.key.read();
        let key = key.as_ref().ok_or_else(Self::not_initialized)?;
        Ok(key.sign(data).to_bytes().to_vec())
    }

    fn peer_id(&self) -> P2pResult<PeerId> {
        let key = self.key.read();
        let key = key.as_ref().ok_or_else(Self::not_initialized)?;
        Ok(PeerId::from_public_key(&key.verifying_key()))
    }
}

fn signing_message(sender: &PeerId, recipient: &PeerId, payload: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(DOMAIN.len() + 64 + payload.len());
    msg.extend_from_slice(DOMAIN);
    msg.extend_from_slice(sender.as_bytes());
    msg.extend_from_slice(recipient.as_bytes());
    msg.extend_from_slice(payload);
    msg
}

/// Verifies `signature` over `data` against `signer`'s identity.
///
/// # Errors
///
/// Returns [`P2pError::AuthenticationFailed`] if the signature is malformed
/// or does not match.
pub fn verify(signer: &PeerId, data: &[u8], signature: &[u8]) -> P2pResult<()> {
    let auth_failed = |reason: String| P2pError::AuthenticationFailed {
        peer_id: *signer,
        reason,
    };
    let signature: [u8; SIGNATURE_LEN] = signature
        .try_into()
        .map_err(|_| auth_failed(format!("signature is {} bytes", signature.len())))?;
    let key = signer
        .to_verifying_key()
        .map_err(|e| auth_failed(e.to_string()))?;
    key.verify(data, &Signature::from_bytes(&signature))
        .map_err(|e| auth_failed(format!("invalid signature: {e}")))
}

/// Builds the frame carrying `payload` from `sender` to `recipient`.
///
/// # Errors
///
/// Returns [`P2pError::Signer`] if signing fails.
pub fn seal(
    signer: &dyn Signer,
    sender: &PeerId,
    recipient: &PeerId,
    payload: &[u8],
) -> P2pResult<Vec<u8>> {
    let signature = signer.sign(&signing_message(sender, recipient, payload))?;
    if signature.len() != SIGNATURE_LEN {
        return Err(P2pError::Signer(format!(
            "signer produced {} byte signature",
            signature.len()
        )));
    }
    let mut frame = Vec::with_capacity(SIGNATURE_LEN + payload.len());
    frame.extend_from_slice(&signature);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Verifies a frame received from `sender` and returns its payload.
///
/// # Errors
///
/// Returns [`P2pError::AuthenticationFailed`] for truncated frames and bad signatures.
pub fn open<'a>(sender: &PeerId, recipient: &PeerId, frame: &'a [u8]) -> P2pResult<&'a [u8]> {
    if frame.len() < SIGNATURE_LEN {
        return Err(P2pError::AuthenticationFailed {
            peer_id: *sender,
            reason: format!("frame of {} bytes is shorter than a signature", frame.len()),
        });
    }
    let (signature, payload) = frame.split_at(SIGNATURE_LEN);
    verify(sender, &signing_message(sender, recipient, payload), signature)?;
    Ok(payload)
}
