//! Inbound message routing.
//!
//! Each peer with an open link owns a bounded [`PeerQueue`]. A pump task per
//! peer moves messages from that queue into the single delivery channel handed
//! out by [`MessageRouter::take_receiver`], one message per free channel slot.
//! The transport side never blocks: when a queue is full the newest message is
//! dropped.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::error::{P2pError, P2pResult};
use crate::protocol::{Message, PeerId};

/// Outcome of pushing a message into a peer queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueue {
    /// The message is buffered.
    Queued,
    /// The buffer is full; the message was dropped.
    Full,
    /// The queue no longer accepts messages.
    Closed,
}

#[derive(Debug)]
struct QueueState {
    messages: VecDeque<Message>,
    capacity: usize,
    closed: bool,
}

/// Bounded FIFO buffer of one peer's inbound messages.
#[derive(Debug)]
pub(crate) struct PeerQueue {
    peer_id: PeerId,
    state: Mutex<QueueState>,
    ready: Notify,
    dropped: AtomicU64,
}

impl PeerQueue {
    fn new(peer_id: PeerId, capacity: usize) -> Self {
        Self {
            peer_id,
            state: Mutex::new(QueueState {
                messages: VecDeque::with_capacity(capacity.min(1024)),
                capacity,
                closed: false,
            }),
            ready: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Buffers `message`, dropping it if the queue is full or closed.
    pub(crate) fn push(&self, message: Message) -> Enqueue {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Enqueue::Closed;
            }
            if state.messages.len() >= state.capacity {
                drop(state);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(peer_id = %self.peer_id, "peer queue full, dropping newest message");
                return Enqueue::Full;
            }
            state.messages.push_back(message);
        }
        self.ready.notify_one();
        Enqueue::Queued
    }

    fn pop(&self) -> Option<Message> {
        self.state.lock().messages.pop_front()
    }

    fn has_messages(&self) -> bool {
        !self.state.lock().messages.is_empty()
    }

    fn is_finished(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.messages.is_empty()
    }

    fn reopen(&self, capacity: usize) {
        let mut state = self.state.lock();
        state.closed = false;
        state.capacity = capacity;
    }

    /// Changes the bound. Messages already buffered beyond it are kept.
    pub(crate) fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_one();
    }

    /// Messages currently buffered.
    pub(crate) fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    /// Messages dropped because the queue was full.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Merges per-peer queues into one delivery channel.
#[derive(Debug)]
pub(crate) struct MessageRouter {
    tx: Mutex<Option<mpsc::Sender<Message>>>,
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    queues: Arc<DashMap<PeerId, Arc<PeerQueue>>>,
    handle: OnceLock<Handle>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl MessageRouter {
    pub(crate) fn new(channel_size: usize) -> Self {
        let (tx, rx) = mpsc::channel(channel_size);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            queues: Arc::new(DashMap::new()),
            handle: OnceLock::new(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Binds the router to the runtime its pumps run on.
    pub(crate) fn start(&self, handle: Handle) {
        // A second start keeps the first runtime.
        let _ = self.handle.set(handle);
    }

    /// Returns the peer's queue, creating it and its pump if needed.
    ///
    /// A queue that is still flushing after [`detach`](Self::detach) is
    /// reopened, so messages from consecutive links stay in order.
    pub(crate) fn attach(&self, peer_id: PeerId, capacity: usize) -> P2pResult<Arc<PeerQueue>> {
        let handle = self
            .handle
            .get()
            .ok_or_else(|| P2pError::Runtime("message router not started".to_string()))?;
        let tx = self
            .tx
            .lock()
            .clone()
            .ok_or_else(|| P2pError::Runtime("message router shut down".to_string()))?;

        let mut spawned = None;
        let queue = self
            .queues
            .entry(peer_id)
            .and_modify(|queue| queue.reopen(capacity))
            .or_insert_with(|| {
                let queue = Arc::new(PeerQueue::new(peer_id, capacity));
                spawned = Some(Arc::clone(&queue));
                queue
            })
            .clone();

        if let Some(queue) = spawned {
            debug!(peer_id = %peer_id, capacity, "starting inbound pump");
            self.tracker.spawn_on(
                pump(queue, Arc::clone(&self.queues), tx, self.cancel.clone()),
                handle,
            );
        }
        Ok(queue)
    }

    /// Stops accepting messages for the peer. Buffered messages are still delivered.
    pub(crate) fn detach(&self, peer_id: &PeerId) {
        if let Some(queue) = self.queues.get(peer_id) {
            queue.close();
        }
    }

    /// Adjusts the peer's buffer bound.
    pub(crate) fn set_capacity(&self, peer_id: &PeerId, capacity: usize) {
        if let Some(queue) = self.queues.get(peer_id) {
            queue.set_capacity(capacity);
        }
    }

    /// Messages buffered for the peer.
    pub(crate) fn queued(&self, peer_id: &PeerId) -> usize {
        self.queues.get(peer_id).map_or(0, |q| q.len())
    }

    /// Hands out the delivery channel. Succeeds once.
    pub(crate) fn take_receiver(&self) -> P2pResult<MessageReceiver> {
        self.rx
            .lock()
            .take()
            .map(MessageReceiver::new)
            .ok_or(P2pError::ReceiverTaken)
    }

    /// Stops every pump and closes the delivery channel.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();
        self.tx.lock().take();
        self.tracker.close();
        self.tracker.wait().await;
        self.queues.clear();
    }
}

async fn pump(
    queue: Arc<PeerQueue>,
    queues: Arc<DashMap<PeerId, Arc<PeerQueue>>>,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let peer_id = queue.peer_id;
    loop {
        if !queue.has_messages() {
            if queue.is_finished()
                && queues
                    .remove_if(&peer_id, |_, q| Arc::ptr_eq(q, &queue) && q.is_finished())
                    .is_some()
            {
                debug!(peer_id = %peer_id, "inbound pump finished");
                return;
            }
            tokio::select! {
                () = cancel.cancelled() => return,
                () = queue.ready.notified() => continue,
            }
        }

        // Take a message only once the channel has room for it.
        let permit = tokio::select! {
            () = cancel.cancelled() => return,
            permit = tx.reserve() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        if let Some(message) = queue.pop() {
            permit.send(message);
        }
    }
}

/// Receiving half of the delivery channel.
///
/// Yields `None` once the peer service has stopped.
#[derive(Debug)]
pub struct MessageReceiver {
    rx: mpsc::Receiver<Message>,
}

impl MessageReceiver {
    const fn new(rx: mpsc::Receiver<Message>) -> Self {
        Self { rx }
    }

    /// Waits for the next message.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Returns a message if one is ready.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Messages waiting in the delivery channel.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns true if no message is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Stream for MessageReceiver {
    type Item = Message;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
