//! Connected peers: registry, per-peer outbound queues, awareness cache.
//!
//! Ownership is one-directional. The registry owns every `Peer` record;
//! the rest of the server holds `Arc` clones obtained from `find` or
//! `snapshot` and never decides a peer's lifetime — a peer is created on
//! transport-established and destroyed on transport-closed, nothing else.
//!
//! Locking discipline:
//! - the registry lock guards membership and the snapshot traversal only;
//! - each peer's queue lock guards its outbound FIFO and awareness blob;
//! - lock order is always registry → peer, and neither lock is ever held
//!   across a socket write or a document apply.
//!
//! The writable signal is a `Notify`: `enqueue` arms it, the connection
//! task's pump (`next_outbound`) drains one message per wake.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};

/// Opaque transport handle for one connection. Monotonic per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

/// Queue and awareness state, guarded by the peer's own lock.
struct PeerInner {
    queue: VecDeque<Arc<Vec<u8>>>,
    awareness: Option<String>,
    /// Set when the queue overran its high-water mark; the pump returns
    /// `None` and the session unwinds as if the transport closed.
    condemned: bool,
}

/// One active client connection's server-side state.
pub struct Peer {
    id: PeerId,
    /// False until the handshake's sync-step-1 has been answered. Gates
    /// eligibility for update broadcasts, nothing else.
    synced: AtomicBool,
    /// Yjs client id learned from the peer's first awareness message;
    /// 0 while unknown.
    client_id: AtomicU32,
    inner: Mutex<PeerInner>,
    writable: Notify,
    high_water: usize,
}

impl Peer {
    fn new(id: PeerId, high_water: usize) -> Self {
        Self {
            id,
            synced: AtomicBool::new(false),
            client_id: AtomicU32::new(0),
            inner: Mutex::new(PeerInner {
                queue: VecDeque::new(),
                awareness: None,
                condemned: false,
            }),
            writable: Notify::new(),
            high_water,
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }

    /// Handshake answered; the peer now receives update broadcasts.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::SeqCst);
    }

    /// The client id this connection announced via awareness, if any.
    pub fn client_id(&self) -> Option<u32> {
        match self.client_id.load(Ordering::SeqCst) {
            0 => None,
            id => Some(id),
        }
    }

    pub fn set_client_id(&self, client_id: u32) {
        self.client_id.store(client_id, Ordering::SeqCst);
    }

    /// Append a message to the outbound queue and arm the writable signal.
    ///
    /// Returns `false` when the peer is already condemned or this message
    /// pushed the queue past its high-water mark; in the latter case the
    /// queue is discarded and the connection is condemned — a client that
    /// cannot drain its backlog is cut loose rather than buffered forever.
    pub async fn enqueue(&self, msg: Arc<Vec<u8>>) -> bool {
        let accepted = {
            let mut inner = self.inner.lock().await;
            if inner.condemned {
                false
            } else if inner.queue.len() >= self.high_water {
                log::warn!(
                    "{} outbound queue exceeded {} messages, dropping connection",
                    self.id,
                    self.high_water
                );
                inner.queue.clear();
                inner.condemned = true;
                false
            } else {
                inner.queue.push_back(msg);
                true
            }
        };
        // Wake the pump either way: it must observe a condemned peer too.
        self.writable.notify_one();
        accepted
    }

    /// Remove and return the head of the outbound queue.
    pub async fn dequeue(&self) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().await.queue.pop_front()
    }

    /// The writable pump. Yields queued messages in FIFO order, one per
    /// call, suspending between messages until `enqueue` re-arms the
    /// signal. Returns `None` once the peer is condemned.
    pub async fn next_outbound(&self) -> Option<Arc<Vec<u8>>> {
        loop {
            // Register for the wakeup before checking the queue, so an
            // enqueue racing with this check cannot be lost.
            let armed = self.writable.notified();
            {
                let mut inner = self.inner.lock().await;
                if inner.condemned {
                    return None;
                }
                if let Some(msg) = inner.queue.pop_front() {
                    return Some(msg);
                }
            }
            armed.await;
        }
    }

    pub async fn queue_len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Replace (or with `None` clear) the cached awareness blob. Clearing
    /// does not remove the peer; only transport-closed does that.
    pub async fn set_awareness(&self, state: Option<String>) {
        self.inner.lock().await.awareness = state;
    }

    /// Most recent non-removal awareness blob for this client.
    pub async fn awareness(&self) -> Option<String> {
        self.inner.lock().await.awareness.clone()
    }
}

/// The set of active peers. Owns every record; see the module docs for the
/// lifecycle and locking rules.
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    next_id: AtomicU64,
    high_water: usize,
}

impl PeerRegistry {
    /// `high_water` bounds each peer's outbound queue; past it the
    /// connection is condemned (see [`Peer::enqueue`]).
    pub fn new(high_water: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            high_water,
        }
    }

    /// Register a new connection and hand back its record.
    pub async fn add(&self) -> Arc<Peer> {
        let id = PeerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let peer = Arc::new(Peer::new(id, self.high_water));
        self.peers.write().await.insert(id, peer.clone());
        peer
    }

    /// Drop a connection's record. Idempotent: removing twice is a no-op.
    pub async fn remove(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.write().await.remove(&id)
    }

    pub async fn find(&self, id: PeerId) -> Option<Arc<Peer>> {
        self.peers.read().await.get(&id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Clone out the current membership. The critical section is O(n)
    /// pointer copies; callers iterate (and enqueue) with no lock held.
    pub async fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Drain the registry, discarding every peer's queue. Shutdown path.
    pub async fn clear(&self) -> usize {
        let mut peers = self.peers.write().await;
        let n = peers.len();
        peers.clear();
        n
    }
}
