//! Scenario files: named nodes, DON membership, and traffic to replay.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use don_p2p::{Don, DonId, DonPair, Ed25519Signer, PeerId, Signer, StreamConfig};

use crate::error::{SimError, SimResult};

/// Context string for deriving node keys from node names.
const SEED_CONTEXT: &str = "don-p2p-sim 2024-01 node seed";

/// A DON and the names of its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DonSpec {
    /// Registry id.
    pub id: DonId,
    /// Member node names.
    pub members: Vec<String>,
}

/// Messages to send once the network has settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageSpec {
    /// Sending node.
    pub from: String,
    /// Receiving node.
    pub to: String,
    /// UTF-8 payload.
    pub payload: String,
    /// How many times to send it back to back.
    #[serde(default = "default_repeat")]
    pub repeat: u32,
}

const fn default_repeat() -> u32 {
    1
}

/// A complete simulation input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    /// Node names. Keys are derived from the names, so runs are reproducible.
    pub nodes: Vec<String>,
    /// Nodes every other node keeps a link to.
    #[serde(default)]
    pub bootstrappers: Vec<String>,
    /// DON membership.
    #[serde(default)]
    pub dons: Vec<DonSpec>,
    /// DON pairs whose members talk across the pair.
    #[serde(default)]
    pub pairs: Vec<[DonId; 2]>,
    /// Stream policy for every DON pair and bootstrap link.
    #[serde(default)]
    pub stream_config: StreamConfig,
    /// Nodes the network refuses to reach.
    #[serde(default)]
    pub unreachable: Vec<String>,
    /// Traffic to replay.
    #[serde(default)]
    pub messages: Vec<MessageSpec>,
}

impl Scenario {
    /// Parses and validates a scenario.
    pub fn from_json(json: &str) -> SimResult<Self> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Loads a scenario from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> SimResult<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// A small two-DON scenario with one bootstrapper and one unreachable node.
    #[must_use]
    pub fn example() -> Self {
        let names = |names: &[&str]| names.iter().map(ToString::to_string).collect::<Vec<_>>();
        Self {
            nodes: names(&["boot", "alpha-1", "alpha-2", "beta-1", "beta-2", "beta-3"]),
            bootstrappers: names(&["boot"]),
            dons: vec![
                DonSpec {
                    id: 1,
                    members: names(&["alpha-1", "alpha-2"]),
                },
                DonSpec {
                    id: 2,
                    members: names(&["beta-1", "beta-2", "beta-3"]),
                },
            ],
            pairs: vec![[1, 2]],
            stream_config: StreamConfig::default().with_message_rate(10.0, 20),
            unreachable: names(&["beta-3"]),
            messages: vec![
                MessageSpec {
                    from: "alpha-1".to_string(),
                    to: "beta-1".to_string(),
                    payload: "report".to_string(),
                    repeat: 5,
                },
                MessageSpec {
                    from: "beta-2".to_string(),
                    to: "alpha-2".to_string(),
                    payload: "ack".to_string(),
                    repeat: 1,
                },
            ],
        }
    }

    /// Checks that every reference names a declared node or DON.
    pub fn validate(&self) -> SimResult<()> {
        let mut nodes = HashSet::new();
        for name in &self.nodes {
            if name.is_empty() {
                return Err(SimError::InvalidScenario("empty node name".to_string()));
            }
            if !nodes.insert(name.as_str()) {
                return Err(SimError::InvalidScenario(format!("duplicate node {name}")));
            }
        }
        let known = |name: &str, role: &str| {
            if nodes.contains(name) {
                Ok(())
            } else {
                Err(SimError::InvalidScenario(format!("unknown {role} {name}")))
            }
        };

        for name in &self.bootstrappers {
            known(name, "bootstrapper")?;
        }
        for name in &self.unreachable {
            known(name, "unreachable node")?;
        }
        let mut dons = HashSet::new();
        for don in &self.dons {
            if !dons.insert(don.id) {
                return Err(SimError::InvalidScenario(format!("duplicate DON {}", don.id)));
            }
            for member in &don.members {
                known(member, "DON member")?;
            }
        }
        for [a, b] in &self.pairs {
            for id in [a, b] {
                if !dons.contains(id) {
                    return Err(SimError::InvalidScenario(format!("pair references unknown DON {id}")));
                }
            }
        }
        for message in &self.messages {
            known(&message.from, "sender")?;
            known(&message.to, "recipient")?;
        }
        self.stream_config.validate()?;
        Ok(())
    }

    /// Resolves the DON pairs to peer ids.
    pub(crate) fn don_pairs(&self, ids: &BTreeMap<String, PeerId>) -> SimResult<Vec<DonPair>> {
        let resolve = |id: DonId| -> SimResult<Don> {
            let don = self
                .dons
                .iter()
                .find(|don| don.id == id)
                .ok_or_else(|| SimError::InvalidScenario(format!("unknown DON {id}")))?;
            let members = don
                .members
                .iter()
                .map(|name| lookup(ids, name))
                .collect::<SimResult<Vec<_>>>()?;
            Ok(Don::new(id, members))
        };
        self.pairs
            .iter()
            .map(|[a, b]| Ok(DonPair::new(resolve(*a)?, resolve(*b)?)))
            .collect()
    }
}

/// Key seed for a node, derived from its name.
#[must_use]
pub fn node_seed(name: &str) -> [u8; 32] {
    blake3::derive_key(SEED_CONTEXT, name.as_bytes())
}

/// Signer holding the node's derived key.
#[must_use]
pub fn node_signer(name: &str) -> Arc<Ed25519Signer> {
    Arc::new(Ed25519Signer::from_seed(node_seed(name)))
}

/// Peer id of the node called `name`.
pub fn node_id(name: &str) -> SimResult<PeerId> {
    Ok(node_signer(name).peer_id()?)
}

pub(crate) fn lookup(ids: &BTreeMap<String, PeerId>, name: &str) -> SimResult<PeerId> {
    ids.get(name)
        .copied()
        .ok_or_else(|| SimError::InvalidScenario(format!("unknown node {name}")))
}
