//! Runs a scenario on an in-memory network.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use don_p2p::{
    BootstrapperLocator, ConnectionManager, MemoryNetwork, MessageReceiver, P2pError, Peer,
    PeerConfig, PeerId,
};

use crate::error::SimResult;
use crate::report::{LinkSummary, NodeReport, SimReport, TrafficReport};
use crate::scenario::{Scenario, lookup, node_id, node_signer};

/// Timing knobs for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimOptions {
    /// Shared deadline for all nodes to connect their required links.
    pub converge_timeout: Duration,
    /// Time given to in-flight messages after the last send.
    pub settle: Duration,
    /// Interval at which nodes retry links that are down.
    pub reconnect_interval: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            converge_timeout: Duration::from_secs(2),
            settle: Duration::from_millis(200),
            reconnect_interval: Duration::from_secs(1),
        }
    }
}

impl SimOptions {
    /// Sets the convergence deadline.
    #[must_use]
    pub const fn with_converge_timeout(mut self, timeout: Duration) -> Self {
        self.converge_timeout = timeout;
        self
    }

    /// Sets the settle time.
    #[must_use]
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

struct SimNode {
    name: String,
    manager: Arc<ConnectionManager>,
    inbound: MessageReceiver,
}

/// Runs `scenario` to completion and reports the end state of every node.
///
/// Must be called from within a tokio runtime. Nodes are stopped before
/// returning.
pub async fn run(scenario: &Scenario, options: &SimOptions) -> SimResult<SimReport> {
    scenario.validate()?;
    let network = MemoryNetwork::new();

    let ids = scenario
        .nodes
        .iter()
        .map(|name| Ok((name.clone(), node_id(name)?)))
        .collect::<SimResult<BTreeMap<String, PeerId>>>()?;
    let names: HashMap<PeerId, String> = ids.iter().map(|(n, id)| (*id, n.clone())).collect();

    let bootstrappers = scenario
        .bootstrappers
        .iter()
        .map(|name| {
            Ok(BootstrapperLocator::new(
                lookup(&ids, name)?,
                vec![format!("memory://{name}")],
            ))
        })
        .collect::<SimResult<Vec<_>>>()?;
    let config = PeerConfig::new()
        .with_bootstrappers(bootstrappers)
        .with_bootstrap_stream_config(scenario.stream_config)
        .with_reconnect_interval(options.reconnect_interval);

    for name in &scenario.unreachable {
        network.set_unreachable(lookup(&ids, name)?, true);
    }

    let mut nodes = Vec::with_capacity(scenario.nodes.len());
    for name in &scenario.nodes {
        let id = lookup(&ids, name)?;
        let manager = Arc::new(ConnectionManager::new(
            config.clone(),
            network.transport(id),
            node_signer(name),
        )?);
        manager.start()?;
        let inbound = manager.receive()?;
        debug!(node = %name, peer_id = %id, bootstrap = manager.is_bootstrap(), "node started");
        nodes.push(SimNode {
            name: name.clone(),
            manager,
            inbound,
        });
    }

    let result = drive(scenario, options, &ids, &names, &mut nodes).await;
    for node in &nodes {
        node.manager.stop().await;
    }
    result
}

async fn drive(
    scenario: &Scenario,
    options: &SimOptions,
    ids: &BTreeMap<String, PeerId>,
    names: &HashMap<PeerId, String>,
    nodes: &mut [SimNode],
) -> SimResult<SimReport> {
    let pairs = scenario.don_pairs(ids)?;
    for node in nodes.iter() {
        node.manager
            .update_connections_by_dons(&pairs, scenario.stream_config)?;
    }

    let deadline = Instant::now() + options.converge_timeout;
    let mut converged = Vec::with_capacity(nodes.len());
    for node in nodes.iter() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match node.manager.await_converged(remaining).await {
            Ok(()) => converged.push(true),
            Err(P2pError::Timeout { pending }) => {
                warn!(node = %node.name, pending, "node did not converge");
                converged.push(false);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let by_name: HashMap<&str, &SimNode> = nodes.iter().map(|n| (n.name.as_str(), n)).collect();
    let mut traffic = Vec::with_capacity(scenario.messages.len());
    for message in &scenario.messages {
        let mut line = TrafficReport {
            from: message.from.clone(),
            to: message.to.clone(),
            ..TrafficReport::default()
        };
        let to = lookup(ids, &message.to)?;
        if let Some(sender) = by_name.get(message.from.as_str()) {
            for _ in 0..message.repeat {
                line.record(&sender.manager.send(to, message.payload.as_bytes()));
            }
        }
        traffic.push(line);
    }

    tokio::time::sleep(options.settle).await;

    let mut reports = Vec::with_capacity(nodes.len());
    for (node, converged) in nodes.iter_mut().zip(converged) {
        let mut received = BTreeMap::<String, u64>::new();
        while let Some(message) = node.inbound.try_recv() {
            let sender = names
                .get(&message.sender)
                .cloned()
                .unwrap_or_else(|| message.sender.to_string());
            *received.entry(sender).or_default() += 1;
        }

        let links = node
            .manager
            .health_report()
            .into_iter()
            .map(|report| LinkSummary {
                peer: names
                    .get(&report.peer_id)
                    .cloned()
                    .unwrap_or_else(|| report.peer_id.to_string()),
                report,
            })
            .collect();

        reports.push(NodeReport {
            name: node.name.clone(),
            peer_id: node.manager.local_id(),
            bootstrap: node.manager.is_bootstrap(),
            converged,
            pending_links: node.manager.pending_links(),
            don_pairs: node.manager.don_pairs().len(),
            links,
            stats: node.manager.stats(),
            received,
        });
    }

    let report = SimReport {
        nodes: reports,
        traffic,
    };
    info!(
        nodes = report.nodes.len(),
        converged = report.converged(),
        "simulation finished"
    );
    Ok(report)
}
