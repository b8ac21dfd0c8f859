//! Simulation results and their rendering.

use std::collections::BTreeMap;
use std::io::Write;

use serde::Serialize;

use don_p2p::{LinkPhase, LinkReport, P2pError, PeerId, PeerStats};

use crate::error::SimResult;

/// One link as seen from a node, labelled with the remote node's name.
#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    /// Remote node name.
    pub peer: String,
    /// Link state from the manager's health report.
    #[serde(flatten)]
    pub report: LinkReport,
}

/// End state of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    /// Node name.
    pub name: String,
    /// Derived peer id.
    pub peer_id: PeerId,
    /// Whether the node is a bootstrapper.
    pub bootstrap: bool,
    /// Whether every required link connected before the deadline.
    pub converged: bool,
    /// Required links still not connected.
    pub pending_links: usize,
    /// DON pairs the node recorded.
    pub don_pairs: usize,
    /// Every known link.
    pub links: Vec<LinkSummary>,
    /// Service counters.
    pub stats: PeerStats,
    /// Messages received, by sender name.
    pub received: BTreeMap<String, u64>,
}

impl NodeReport {
    /// Links in `phase`.
    #[must_use]
    pub fn count_in(&self, phase: LinkPhase) -> usize {
        self.links.iter().filter(|l| l.report.phase == phase).count()
    }
}

/// Outcome of one message line of the scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficReport {
    /// Sending node.
    pub from: String,
    /// Receiving node.
    pub to: String,
    /// Sends attempted.
    pub attempted: u32,
    /// Sends the manager accepted.
    pub accepted: u32,
    /// Refused sends, by reason.
    pub refused: BTreeMap<&'static str, u32>,
}

impl TrafficReport {
    pub(crate) fn record(&mut self, result: &Result<(), P2pError>) {
        self.attempted += 1;
        match result {
            Ok(()) => self.accepted += 1,
            Err(e) => *self.refused.entry(refusal_reason(e)).or_default() += 1,
        }
    }
}

fn refusal_reason(err: &P2pError) -> &'static str {
    match err {
        P2pError::NotFound { .. } => "no_link",
        P2pError::LinkUnavailable { .. } => "link_unavailable",
        P2pError::RateLimitExceeded { .. } => "rate_limited",
        P2pError::PayloadTooLarge { .. } => "too_large",
        P2pError::TransportFailed { .. } => "transport",
        _ => "other",
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    /// Per-node end state, in scenario order.
    pub nodes: Vec<NodeReport>,
    /// Per-message-line outcomes, in scenario order.
    pub traffic: Vec<TrafficReport>,
}

impl SimReport {
    /// The report for the node called `name`.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Returns true if every node converged.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.nodes.iter().all(|n| n.converged)
    }

    /// Writes the report as pretty JSON.
    pub fn write_json<W: Write>(&self, writer: &mut W) -> SimResult<()> {
        serde_json::to_writer_pretty(&mut *writer, self)?;
        writeln!(writer)?;
        Ok(())
    }

    /// Writes a human-readable summary.
    pub fn write_table<W: Write>(&self, writer: &mut W) -> SimResult<()> {
        writeln!(
            writer,
            "{:<16} {:>5} {:>9} {:>10} {:>7} {:>6} {:>8}",
            "NODE", "BOOT", "CONNECTED", "CONNECTING", "PENDING", "SENT", "RECEIVED"
        )?;
        for node in &self.nodes {
            writeln!(
                writer,
                "{:<16} {:>5} {:>9} {:>10} {:>7} {:>6} {:>8}",
                node.name,
                if node.bootstrap { "yes" } else { "-" },
                node.count_in(LinkPhase::Connected),
                node.count_in(LinkPhase::Connecting),
                node.pending_links,
                node.stats.messages_sent,
                node.stats.messages_received,
            )?;
        }

        if !self.traffic.is_empty() {
            writeln!(writer)?;
            writeln!(writer, "{:<16} {:<16} {:>8} {:>8}  REFUSED", "FROM", "TO", "SENT", "ACCEPTED")?;
            for line in &self.traffic {
                let refused = line
                    .refused
                    .iter()
                    .map(|(reason, n)| format!("{reason}={n}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(
                    writer,
                    "{:<16} {:<16} {:>8} {:>8}  {}",
                    line.from,
                    line.to,
                    line.attempted,
                    line.accepted,
                    if refused.is_empty() { "-" } else { refused.as_str() },
                )?;
            }
        }
        Ok(())
    }
}
