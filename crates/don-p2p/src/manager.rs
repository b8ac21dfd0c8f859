//! Connection-set reconciliation.
//!
//! [`ConnectionManager`] keeps, for every remote peer, the stream configs each
//! [`Scope`] asked for. A peer with at least one contribution gets a link
//! running with the field-wise maximum of those configs; a peer with none is
//! drained and forgotten. Bootstrap peers carry a permanent contribution under
//! [`Scope::Bootstrap`], so DON updates can never tear them down. A bootstrap
//! node in turn serves every peer that opens to it, under [`Scope::Inbound`],
//! until that peer's link goes away.
//!
//! Locking: the per-peer table is a sharded map of per-entry mutexes, and each
//! scope's updates are serialized by that scope's own mutex. Lock order is
//! DON-pair set, then scope, then peer entry. Shard locks are never held while
//! waiting on an entry. Transport callbacks ([`LinkEvents`]) never take any of
//! these locks; they report back through a channel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{PeerConfig, StreamConfig};
use crate::connection::{LinkCell, LinkHealth, LinkPhase, LinkReport};
use crate::error::{P2pError, P2pResult};
use crate::peer::{Peer, ServiceState, SharedPeer};
use crate::protocol::{DonPair, DonPairId, PeerId, Scope};
use crate::rate_limit::{LinkRateLimiter, RateLimiterSnapshot};
use crate::registry::DonRegistry;
use crate::router::{MessageReceiver, MessageRouter};
use crate::signer::{self, Signer, SIGNATURE_LEN};
use crate::stats::{bump, Counters, PeerStats};
use crate::transport::{InboundRequests, Link, LinkDown, LinkEvents, Transport};

/// One generation of a link to a peer.
#[derive(Debug)]
struct LinkSlot {
    generation: u64,
    cell: Arc<LinkCell>,
    /// `None` when the last open attempt failed.
    handle: Option<Arc<dyn Link>>,
    limiter: LinkRateLimiter,
    /// Config the link currently runs with.
    config: StreamConfig,
}

#[derive(Debug, Default)]
struct PeerEntry {
    desired_by: BTreeMap<Scope, StreamConfig>,
    link: Option<LinkSlot>,
    /// Set once the entry has been removed from the table.
    retired: bool,
}

impl PeerEntry {
    fn effective(&self) -> Option<StreamConfig> {
        StreamConfig::merge_all(self.desired_by.values())
    }

    fn is_required(&self) -> bool {
        !self.desired_by.is_empty()
    }

    fn is_idle(&self) -> bool {
        self.desired_by.is_empty() && self.link.is_none()
    }

    fn phase(&self) -> LinkPhase {
        self.link
            .as_ref()
            .map_or(LinkPhase::Unconnected, |slot| slot.cell.phase())
    }
}

#[derive(Debug, Default)]
struct ScopeState {
    peers: BTreeSet<PeerId>,
    retired: bool,
}

type Shared<T> = Arc<Mutex<T>>;

/// Reconciles desired peer sets into live links.
///
/// The concrete [`Peer`] / [`SharedPeer`] implementation.
pub struct ConnectionManager {
    config: PeerConfig,
    transport: Arc<dyn Transport>,
    signer: Arc<dyn Signer>,
    local_id: PeerId,
    is_bootstrap: bool,
    state: RwLock<ServiceState>,
    peers: DashMap<PeerId, Shared<PeerEntry>>,
    scopes: DashMap<Scope, Shared<ScopeState>>,
    don_pairs: Mutex<BTreeSet<DonPairId>>,
    router: MessageRouter,
    counters: Arc<Counters>,
    changed: Arc<Notify>,
    generation: AtomicU64,
    signals: mpsc::UnboundedSender<LinkDown>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<LinkDown>>>,
    inbound: mpsc::UnboundedSender<PeerId>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerId>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local_id", &self.local_id)
            .field("is_bootstrap", &self.is_bootstrap)
            .field("state", &*self.state.read())
            .field("peers", &self.peers.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Creates a manager. Initializes the signer to learn the local identity.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid or the signer cannot initialize.
    pub fn new(
        config: PeerConfig,
        transport: Arc<dyn Transport>,
        signer: Arc<dyn Signer>,
    ) -> P2pResult<Self> {
        config.validate()?;
        signer.initialize()?;
        let local_id = signer.peer_id()?;
        let is_bootstrap = config.is_bootstrapper(&local_id);
        let (signals, signal_rx) = mpsc::unbounded_channel();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            router: MessageRouter::new(config.receive_channel_size),
            config,
            transport,
            signer,
            local_id,
            is_bootstrap,
            state: RwLock::new(ServiceState::Created),
            peers: DashMap::new(),
            scopes: DashMap::new(),
            don_pairs: Mutex::new(BTreeSet::new()),
            counters: Arc::new(Counters::default()),
            changed: Arc::new(Notify::new()),
            generation: AtomicU64::new(0),
            signals,
            signal_rx: Mutex::new(Some(signal_rx)),
            inbound,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Starts the service: opens bootstrap links and the maintenance task.
    ///
    /// Must be called from within a tokio runtime. Starting a running
    /// service is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::NotRunning`] if the service was stopped, or
    /// [`P2pError::Runtime`] outside a runtime.
    pub fn start(self: &Arc<Self>) -> P2pResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                ServiceState::Created => {}
                ServiceState::Running => return Ok(()),
                ServiceState::Stopped => {
                    return Err(P2pError::NotRunning {
                        state: ServiceState::Stopped,
                    });
                }
            }
            let handle = Handle::try_current().map_err(|e| P2pError::Runtime(e.to_string()))?;
            self.router.start(handle.clone());
            let signals = self.signal_rx.lock().take();
            let inbound = self.inbound_rx.lock().take();
            if let (Some(signals), Some(inbound)) = (signals, inbound) {
                self.tracker.spawn_on(
                    maintain(
                        Arc::downgrade(self),
                        signals,
                        inbound,
                        self.config.reconnect_interval,
                        self.cancel.clone(),
                    ),
                    &handle,
                );
            }
            *state = ServiceState::Running;
        }

        if self.is_bootstrap {
            self.transport
                .listen(InboundRequests::new(self.local_id, self.inbound.clone()));
        }

        let bootstrap_config = self.config.bootstrap_stream_config;
        for locator in &self.config.bootstrappers {
            let peer = locator.peer_id;
            if peer == self.local_id {
                continue;
            }
            self.with_entry(peer, true, |entry| {
                entry.desired_by.insert(Scope::Bootstrap, bootstrap_config);
                self.reconcile(peer, entry);
            });
        }

        info!(
            peer_id = %self.local_id,
            bootstrap = self.is_bootstrap,
            bootstrappers = self.config.bootstrappers.len(),
            "peer service started"
        );
        Ok(())
    }

    /// Stops the service, closing every link and the receive channel.
    pub async fn stop(&self) {
        {
            let mut state = self.state.write();
            if *state == ServiceState::Stopped {
                return;
            }
            *state = ServiceState::Stopped;
        }
        self.cancel.cancel();

        for (_, entry) in self.entries() {
            let mut entry = entry.lock();
            entry.desired_by.clear();
            entry.retired = true;
            if let Some(slot) = entry.link.take() {
                slot.cell.transition(
                    &[LinkPhase::Connecting, LinkPhase::Connected],
                    LinkPhase::Draining,
                );
                if let Some(link) = slot.handle {
                    link.close();
                    bump(&self.counters.links_closed);
                }
            }
        }
        self.peers.clear();
        self.scopes.clear();
        self.don_pairs.lock().clear();
        self.changed.notify_waiters();

        self.router.shutdown().await;
        self.tracker.close();
        self.tracker.wait().await;
        info!(peer_id = %self.local_id, "peer service stopped");
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    /// Identity of the local node.
    #[must_use]
    pub const fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The configuration the service runs with.
    #[must_use]
    pub const fn config(&self) -> &PeerConfig {
        &self.config
    }

    fn running(&self) -> P2pResult<RwLockReadGuard<'_, ServiceState>> {
        let state = self.state.read();
        if state.is_running() {
            Ok(state)
        } else {
            Err(P2pError::NotRunning { state: *state })
        }
    }

    /// Replaces `scope`'s desired peers.
    ///
    /// Idempotent. Contributions from other scopes are untouched; the local
    /// peer is ignored if listed.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::InvalidConfig`] for a reserved scope or an invalid
    /// stream config (nothing is applied), or [`P2pError::NotRunning`].
    pub fn update_connections_for(
        &self,
        scope: Scope,
        desired: &HashMap<PeerId, StreamConfig>,
    ) -> P2pResult<()> {
        let _running = self.running()?;
        if scope.is_reserved() {
            return Err(P2pError::InvalidConfig(format!("scope {scope} is reserved")));
        }
        for config in desired.values() {
            config.validate()?;
        }

        self.apply_scope(&scope, desired);
        bump(&self.counters.updates);
        debug!(scope = %scope, peers = desired.len(), "connections updated");
        Ok(())
    }

    /// Replaces the DON pairs the node takes part in.
    ///
    /// Each pair gets its own scope. Pairs absent from `pairs` but present in
    /// the previous call are withdrawn after the new ones are applied, so a
    /// peer moving from one pair to another keeps its link.
    ///
    /// A bootstrap node serves every pair it is given, member or not, and
    /// keeps a link to each member of both sides using the bootstrap stream
    /// config; `config` is ignored there.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::InvalidConfig`] or [`P2pError::NotRunning`].
    pub fn update_connections_by_dons(
        &self,
        pairs: &[DonPair],
        config: StreamConfig,
    ) -> P2pResult<()> {
        let _running = self.running()?;
        config.validate()?;

        let mut contributions: BTreeMap<DonPairId, HashMap<PeerId, StreamConfig>> =
            BTreeMap::new();
        for pair in pairs {
            let remote = if self.is_bootstrap {
                pair.first
                    .members
                    .iter()
                    .chain(&pair.second.members)
                    .map(|peer| (*peer, self.config.bootstrap_stream_config))
                    .collect::<Vec<_>>()
            } else if pair.first.contains(&self.local_id) || pair.second.contains(&self.local_id) {
                pair.remote_members(&self.local_id)
                    .into_iter()
                    .map(|peer| (peer, config))
                    .collect()
            } else {
                continue;
            };
            contributions.entry(pair.id()).or_default().extend(remote);
        }
        let ids: BTreeSet<DonPairId> = contributions.keys().copied().collect();

        let mut known = self.don_pairs.lock();
        for (id, desired) in &contributions {
            self.apply_scope(&Scope::DonPair(*id), desired);
        }
        for stale in known.difference(&ids) {
            debug!(don_pair = %stale, "withdrawing DON pair");
            self.apply_scope(&Scope::DonPair(*stale), &HashMap::new());
        }
        *known = ids;
        bump(&self.counters.updates);
        info!(pairs = known.len(), "DON pair connections updated");
        Ok(())
    }

    /// Applies a registry snapshot as `scope`'s desired peers.
    ///
    /// # Errors
    ///
    /// Same as [`update_connections_for`](Self::update_connections_for).
    pub fn sync_from_registry(&self, scope: Scope, registry: &dyn DonRegistry) -> P2pResult<()> {
        self.update_connections_for(scope, &registry.desired_peers())
    }

    /// Sends `payload` to `peer`.
    ///
    /// Returns once the frame is handed to the link. Rate limit tokens are not
    /// returned if the transport then refuses the frame.
    ///
    /// # Errors
    ///
    /// [`P2pError::NotFound`] for unknown peers, [`P2pError::LinkUnavailable`]
    /// unless the link is connected, [`P2pError::PayloadTooLarge`],
    /// [`P2pError::RateLimitExceeded`], or the transport's error.
    pub fn send(&self, peer: PeerId, payload: &[u8]) -> P2pResult<()> {
        let _running = self.running()?;
        let not_found = || P2pError::NotFound { peer_id: peer };
        let entry = self
            .peers
            .get(&peer)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(not_found)?;
        let mut entry = entry.lock();
        if entry.retired {
            return Err(not_found());
        }
        let slot = entry.link.as_mut().ok_or_else(not_found)?;

        let phase = slot.cell.phase();
        let link = match &slot.handle {
            Some(link) if phase.is_usable() => Arc::clone(link),
            _ => return Err(P2pError::LinkUnavailable { peer_id: peer, phase }),
        };
        let max = slot.config.max_message_len_bytes;
        if payload.len() > max {
            return Err(P2pError::PayloadTooLarge {
                peer_id: peer,
                len: payload.len(),
                max,
            });
        }

        let frame = signer::seal(self.signer.as_ref(), &self.local_id, &peer, payload)?;
        if let Err(limit) = slot.limiter.try_acquire(payload.len()) {
            bump(&self.counters.rate_limited);
            debug!(peer_id = %peer, %limit, "send rate limited");
            return Err(P2pError::RateLimitExceeded {
                peer_id: peer,
                limit,
            });
        }
        if let Err(e) = link.send(frame) {
            slot.cell.with_health(|h| h.last_error = Some(e.to_string()));
            return Err(e);
        }
        slot.cell.with_health(|h| h.record_sent(payload.len()));
        bump(&self.counters.messages_sent);
        Ok(())
    }

    /// Hands out the merged inbound channel. Succeeds once.
    ///
    /// # Errors
    ///
    /// [`P2pError::ReceiverTaken`] on the second call, or [`P2pError::NotRunning`].
    pub fn receive(&self) -> P2pResult<MessageReceiver> {
        let _running = self.running()?;
        self.router.take_receiver()
    }

    /// Re-opens every required link that is down. Returns how many were opened.
    ///
    /// Runs periodically on its own; exposed for callers that want a retry now.
    pub fn retry_pending(&self) -> usize {
        let Ok(_running) = self.running() else {
            return 0;
        };
        let mut reopened = 0;
        for (peer, _) in self.entries() {
            self.with_entry(peer, false, |entry| {
                let Some(config) = entry.effective() else {
                    return;
                };
                if entry.phase() != LinkPhase::Unconnected {
                    return;
                }
                entry.link = Some(match entry.link.take() {
                    Some(previous) => {
                        debug!(
                            peer_id = %peer,
                            attempts = previous.cell.health().failed_attempts,
                            "retrying link"
                        );
                        self.reopen_link(peer, previous, config)
                    }
                    None => self.open_link(peer, config),
                });
                reopened += 1;
            });
        }
        reopened
    }

    /// Waits until every required link is connected.
    ///
    /// # Errors
    ///
    /// [`P2pError::Timeout`] with the number of links still pending.
    pub async fn await_converged(&self, timeout: Duration) -> P2pResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.running()?;
            if self.pending_links() == 0 {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let pending = self.pending_links();
                return if pending == 0 {
                    Ok(())
                } else {
                    Err(P2pError::Timeout { pending })
                };
            }
        }
    }

    /// Required links that are not connected.
    #[must_use]
    pub fn pending_links(&self) -> usize {
        self.entries()
            .into_iter()
            .filter(|(_, entry)| {
                let entry = entry.lock();
                entry.is_required() && entry.phase() != LinkPhase::Connected
            })
            .count()
    }

    /// Phase of the link to `peer`, if the peer is known.
    #[must_use]
    pub fn link_phase(&self, peer: &PeerId) -> Option<LinkPhase> {
        let entry = Arc::clone(self.peers.get(peer)?.value());
        let entry = entry.lock();
        Some(entry.phase())
    }

    /// Merged config required for `peer`.
    #[must_use]
    pub fn effective_config(&self, peer: &PeerId) -> Option<StreamConfig> {
        let entry = Arc::clone(self.peers.get(peer)?.value());
        let entry = entry.lock();
        entry.effective()
    }

    /// Scopes currently requiring `peer`.
    #[must_use]
    pub fn contributing_scopes(&self, peer: &PeerId) -> Vec<Scope> {
        let Some(entry) = self.peers.get(peer).map(|e| Arc::clone(e.value())) else {
            return Vec::new();
        };
        let entry = entry.lock();
        entry.desired_by.keys().cloned().collect()
    }

    /// Tokens left in the link's buckets.
    #[must_use]
    pub fn rate_limiter_snapshot(&self, peer: &PeerId) -> Option<RateLimiterSnapshot> {
        let entry = Arc::clone(self.peers.get(peer)?.value());
        let mut entry = entry.lock();
        entry.link.as_mut().map(|slot| slot.limiter.snapshot())
    }

    /// DON pairs recorded by the last [`update_connections_by_dons`](Self::update_connections_by_dons).
    #[must_use]
    pub fn don_pairs(&self) -> Vec<DonPairId> {
        self.don_pairs.lock().iter().copied().collect()
    }

    /// Every known peer's link, ordered by peer id.
    #[must_use]
    pub fn health_report(&self) -> Vec<LinkReport> {
        let mut entries = self.entries();
        entries.sort_unstable_by_key(|(peer, _)| *peer);
        entries
            .into_iter()
            .filter_map(|(peer_id, entry)| {
                let entry = entry.lock();
                if entry.retired {
                    return None;
                }
                let phase = entry.phase();
                Some(LinkReport {
                    peer_id,
                    phase,
                    retrying: entry.is_required() && phase == LinkPhase::Unconnected,
                    effective_config: entry.effective(),
                    scopes: entry.desired_by.keys().cloned().collect(),
                    bootstrap: self.config.is_bootstrapper(&peer_id),
                    queued_inbound: self.router.queued(&peer_id),
                    health: entry
                        .link
                        .as_ref()
                        .map_or_else(LinkHealth::new, |slot| slot.cell.health()),
                })
            })
            .collect()
    }

    /// Service-wide counters.
    #[must_use]
    pub fn stats(&self) -> PeerStats {
        self.counters.snapshot()
    }

    /// Snapshot of the table, so entry locks are never taken under a shard lock.
    fn entries(&self) -> Vec<(PeerId, Shared<PeerEntry>)> {
        self.peers
            .iter()
            .map(|e| (*e.key(), Arc::clone(e.value())))
            .collect()
    }

    /// Runs `f` on the peer's entry under its lock and drops the entry if it
    /// ends up idle. With `create`, a missing entry is inserted first.
    fn with_entry<R>(
        &self,
        peer: PeerId,
        create: bool,
        f: impl FnOnce(&mut PeerEntry) -> R,
    ) -> Option<R> {
        let mut f = Some(f);
        loop {
            let entry = if create {
                Arc::clone(self.peers.entry(peer).or_default().value())
            } else {
                Arc::clone(self.peers.get(&peer)?.value())
            };
            let mut guard = entry.lock();
            if guard.retired {
                // Removed while we waited; look again.
                continue;
            }
            let result = f.take().map(|f| f(&mut guard));
            if guard.is_idle() {
                guard.retired = true;
                self.peers.remove_if(&peer, |_, e| Arc::ptr_eq(e, &entry));
            }
            return result;
        }
    }

    fn apply_scope(&self, scope: &Scope, desired: &HashMap<PeerId, StreamConfig>) {
        loop {
            let state = Arc::clone(self.scopes.entry(scope.clone()).or_default().value());
            let mut guard = state.lock();
            if guard.retired {
                continue;
            }

            let wanted: BTreeSet<PeerId> = desired
                .keys()
                .copied()
                .filter(|peer| *peer != self.local_id)
                .collect();
            for (peer, config) in desired {
                if *peer == self.local_id {
                    continue;
                }
                self.with_entry(*peer, true, |entry| {
                    entry.desired_by.insert(scope.clone(), *config);
                    self.reconcile(*peer, entry);
                });
            }
            for peer in guard.peers.difference(&wanted) {
                self.with_entry(*peer, false, |entry| {
                    if entry.desired_by.remove(scope).is_some() {
                        self.reconcile(*peer, entry);
                    }
                });
            }
            guard.peers = wanted;

            if guard.peers.is_empty() {
                guard.retired = true;
                self.scopes.remove_if(scope, |_, s| Arc::ptr_eq(s, &state));
            }
            self.changed.notify_waiters();
            return;
        }
    }

    /// Brings the peer's link in line with its contributions.
    fn reconcile(&self, peer: PeerId, entry: &mut PeerEntry) {
        let Some(effective) = entry.effective() else {
            entry.link = entry.link.take().and_then(|slot| self.teardown(peer, slot));
            return;
        };
        entry.link = Some(match entry.link.take() {
            None => self.open_link(peer, effective),
            Some(slot) => self.refresh(peer, slot, effective),
        });
    }

    fn open_link(&self, peer: PeerId, config: StreamConfig) -> LinkSlot {
        self.open_link_with(peer, config, LinkHealth::new(), LinkRateLimiter::new(&config))
    }

    /// Opens a new generation of a link. The old one keeps its health record
    /// and its buckets, which start full again.
    fn reopen_link(&self, peer: PeerId, previous: LinkSlot, config: StreamConfig) -> LinkSlot {
        let mut limiter = previous.limiter;
        limiter.reconfigure(&config);
        limiter.reset();
        self.open_link_with(peer, config, previous.cell.health(), limiter)
    }

    fn open_link_with(
        &self,
        peer: PeerId,
        config: StreamConfig,
        health: LinkHealth,
        limiter: LinkRateLimiter,
    ) -> LinkSlot {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cell = Arc::new(LinkCell::new(
            peer,
            generation,
            config.max_message_len_bytes,
            health,
            Arc::clone(&self.changed),
        ));

        let opened = self
            .router
            .attach(peer, config.incoming_message_buffer_size)
            .and_then(|queue| {
                let events = LinkEvents::new(
                    self.local_id,
                    Arc::clone(&cell),
                    queue,
                    Arc::clone(&self.counters),
                    self.signals.clone(),
                );
                self.transport.open(peer, &config, events)
            });
        let handle = match opened {
            Ok(link) => {
                bump(&self.counters.links_opened);
                info!(peer_id = %peer, generation, "opening link");
                Some(link)
            }
            Err(e) => {
                // The transport may already have reported this failure.
                if cell.fail(&e.to_string()).is_some() {
                    bump(&self.counters.link_failures);
                }
                warn!(peer_id = %peer, error = %e, "link open failed, will retry");
                None
            }
        };
        self.changed.notify_waiters();

        LinkSlot {
            generation,
            cell,
            handle,
            limiter,
            config,
        }
    }

    /// Applies a changed effective config to an existing link.
    fn refresh(&self, peer: PeerId, mut slot: LinkSlot, effective: StreamConfig) -> LinkSlot {
        match slot.cell.phase() {
            // Required again while closing: the old link finishes on its own.
            LinkPhase::Draining => return self.reopen_link(peer, slot, effective),
            // The retry loop opens it with the current config.
            LinkPhase::Unconnected => {
                slot.config = effective;
                return slot;
            }
            LinkPhase::Connecting | LinkPhase::Connected => {}
        }
        if slot.config == effective {
            return slot;
        }

        let queued = slot
            .handle
            .as_ref()
            .map_or(0, |link| link.largest_queued_frame())
            .saturating_sub(SIGNATURE_LEN);
        if queued > effective.max_message_len_bytes {
            info!(
                peer_id = %peer,
                queued,
                max = effective.max_message_len_bytes,
                "max message length shrank below a queued message, reopening link"
            );
            bump(&self.counters.reopens);
            self.drain(peer, &slot);
            return self.reopen_link(peer, slot, effective);
        }

        if let Some(link) = &slot.handle {
            link.reconfigure(&effective);
        }
        slot.limiter.reconfigure(&effective);
        slot.cell.set_max_message_len(effective.max_message_len_bytes);
        self.router
            .set_capacity(&peer, effective.incoming_message_buffer_size);
        slot.config = effective;
        bump(&self.counters.reconfigurations);
        debug!(peer_id = %peer, "link reconfigured");
        slot
    }

    /// Starts closing the link. Returns true if it is draining.
    fn drain(&self, peer: PeerId, slot: &LinkSlot) -> bool {
        let Some(link) = &slot.handle else {
            return false;
        };
        if !slot.cell.transition(
            &[LinkPhase::Connecting, LinkPhase::Connected],
            LinkPhase::Draining,
        ) {
            return slot.cell.phase() == LinkPhase::Draining;
        }
        info!(peer_id = %peer, generation = slot.generation, "closing link");
        bump(&self.counters.links_closed);
        link.close();
        // The transport may have finished flushing inside close().
        slot.cell.phase() == LinkPhase::Draining
    }

    /// Closes a link no scope needs. Returns the slot while it drains.
    fn teardown(&self, peer: PeerId, slot: LinkSlot) -> Option<LinkSlot> {
        if self.drain(peer, &slot) {
            return Some(slot);
        }
        self.router.detach(&peer);
        None
    }

    fn handle_link_down(&self, signal: LinkDown) {
        let peer = signal.peer_id;
        self.with_entry(peer, false, |entry| {
            let Some(slot) = entry.link.as_mut() else {
                return;
            };
            if slot.generation != signal.generation {
                return;
            }
            slot.handle = None;
            // An inbound peer that went away has to open again to be served.
            if !signal.drained && entry.desired_by.remove(&Scope::Inbound).is_some() {
                debug!(peer_id = %peer, "inbound peer dropped");
            }
            if !entry.is_required() {
                entry.link = None;
                self.router.detach(&peer);
                debug!(peer_id = %peer, drained = signal.drained, "link released");
            }
        });
        self.changed.notify_waiters();
    }

    /// Serves a peer that opened a link to this bootstrap node.
    fn accept_inbound(&self, peer: PeerId) {
        let Ok(_running) = self.running() else {
            return;
        };
        if peer == self.local_id {
            return;
        }
        let config = self.config.bootstrap_stream_config;
        self.with_entry(peer, true, |entry| {
            entry.desired_by.insert(Scope::Inbound, config);
            let Some(effective) = entry.effective() else {
                return;
            };
            entry.link = Some(match entry.link.take() {
                None => self.open_link(peer, effective),
                // Waiting on the retry timer: answer now instead.
                Some(slot) if slot.cell.phase() == LinkPhase::Unconnected => {
                    self.reopen_link(peer, slot, effective)
                }
                Some(slot) => self.refresh(peer, slot, effective),
            });
        });
        debug!(peer_id = %peer, "serving inbound peer");
        self.changed.notify_waiters();
    }
}

async fn maintain(
    manager: Weak<ConnectionManager>,
    mut signals: mpsc::UnboundedReceiver<LinkDown>,
    mut inbound: mpsc::UnboundedReceiver<PeerId>,
    reconnect_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(reconnect_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            Some(signal) = signals.recv() => {
                let Some(manager) = manager.upgrade() else { return };
                manager.handle_link_down(signal);
            }
            Some(peer) = inbound.recv() => {
                let Some(manager) = manager.upgrade() else { return };
                manager.accept_inbound(peer);
            }
            _ = ticker.tick() => {
                let Some(manager) = manager.upgrade() else { return };
                let reopened = manager.retry_pending();
                if reopened > 0 {
                    debug!(reopened, "retried pending links");
                }
            }
        }
    }
}

impl Peer for ConnectionManager {
    fn id(&self) -> PeerId {
        self.local_id
    }

    fn update_connections(&self, desired: &HashMap<PeerId, StreamConfig>) -> P2pResult<()> {
        self.update_connections_for(Scope::Default, desired)
    }

    fn send(&self, peer: PeerId, payload: &[u8]) -> P2pResult<()> {
        Self::send(self, peer, payload)
    }

    fn receive(&self) -> P2pResult<MessageReceiver> {
        Self::receive(self)
    }

    fn is_bootstrap(&self) -> bool {
        self.is_bootstrap
    }
}

impl SharedPeer for ConnectionManager {
    fn update_connections_by_dons(&self, pairs: &[DonPair], config: StreamConfig) -> P2pResult<()> {
        Self::update_connections_by_dons(self, pairs, config)
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
