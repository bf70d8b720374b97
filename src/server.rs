//! The relay server: accept loop, per-connection session state machine,
//! dispatch, and broadcast.
//!
//! ```text
//! Client A ──┐                        ┌── queue ──► Client A
//!            │   WebSocket frames     │
//! Client B ──┼──► decode ── dispatch ─┼── queue ──► Client B
//!            │         │              │
//! Client C ──┘         ▼              └── queue ──► Client C
//!                 SharedDoc ──► snapshot blob on disk
//! ```
//!
//! One task per connection owns both halves of the socket. Inbound frames
//! are dispatched inline; outbound traffic only ever leaves through the
//! peer's queue, drained one message per wake by the writable pump. The
//! broadcast path takes a registry snapshot, releases the lock, then
//! enqueues onto each eligible target — the critical section is O(n)
//! pointer copies.
//!
//! Per-peer session states: NEW (connected, awaiting sync-step-1),
//! SYNCED (handshake answered, receives update broadcasts), CLOSED
//! (removed from the registry). The only path to CLOSED is the transport
//! closing — client disconnect, write failure, or queue overrun.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::document::SharedDoc;
use crate::peer::{Peer, PeerId, PeerRegistry};
use crate::persistence::{self, DEFAULT_SNAPSHOT_PATH};
use crate::protocol::{self, Frame};

/// WebSocket sub-protocol token advertised to clients.
pub const SUBPROTOCOL: &str = "crdt-protocol";

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Name of the shared text root ("quill" matches y-quill clients).
    pub shared_type: String,
    /// Where the document snapshot lives.
    pub snapshot_path: PathBuf,
    /// Per-peer outbound queue bound; past it the connection is dropped.
    pub queue_high_water: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9000".to_string(),
            shared_type: "quill".to_string(),
            snapshot_path: PathBuf::from(DEFAULT_SNAPSHOT_PATH),
            queue_high_water: 1024,
        }
    }
}

/// Counter snapshot returned by [`RelayServer::stats`].
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_peers: usize,
    pub messages_received: u64,
    pub updates_applied: u64,
    pub frames_dropped: u64,
    pub snapshots_persisted: u64,
    pub broadcast_fanout: u64,
}

/// Lock-free counters; the hot paths never take a lock for bookkeeping.
#[derive(Default)]
struct AtomicRelayStats {
    total_connections: AtomicU64,
    messages_received: AtomicU64,
    updates_applied: AtomicU64,
    frames_dropped: AtomicU64,
    snapshots_persisted: AtomicU64,
    broadcast_fanout: AtomicU64,
}

/// The relay server. Owns the authoritative document, the peer registry,
/// and the counters; everything a session needs is reached through here,
/// so tests can run several instances side by side.
pub struct RelayServer {
    config: RelayConfig,
    doc: Arc<RwLock<SharedDoc>>,
    registry: Arc<PeerRegistry>,
    stats: Arc<AtomicRelayStats>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let doc = SharedDoc::new(&config.shared_type);
        let registry = PeerRegistry::new(config.queue_high_water);
        Self {
            config,
            doc: Arc::new(RwLock::new(doc)),
            registry: Arc::new(registry),
            stats: Arc::new(AtomicRelayStats::default()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Current text of the authoritative document, for diagnostics.
    pub async fn text_snapshot(&self) -> String {
        self.doc.read().await.text_snapshot()
    }

    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_peers: self.registry.count().await,
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
            updates_applied: self.stats.updates_applied.load(Ordering::Relaxed),
            frames_dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            snapshots_persisted: self.stats.snapshots_persisted.load(Ordering::Relaxed),
            broadcast_fanout: self.stats.broadcast_fanout.load(Ordering::Relaxed),
        }
    }

    /// Feed the persisted snapshot (if any) into the document. Returns
    /// whether a snapshot was loaded. Missing, empty, unreadable, and
    /// corrupt files all mean a fresh start; only the last two log about it.
    pub async fn load_snapshot(&self) -> bool {
        let path = &self.config.snapshot_path;
        match persistence::load(path) {
            Ok(Some(blob)) => {
                let mut doc = self.doc.write().await;
                match doc.apply_update(&blob) {
                    Ok(()) => {
                        log::info!(
                            "loaded snapshot ({} bytes) from {}",
                            blob.len(),
                            path.display()
                        );
                        true
                    }
                    Err(e) => {
                        log::warn!(
                            "snapshot at {} is corrupt ({e}); starting fresh",
                            path.display()
                        );
                        false
                    }
                }
            }
            Ok(None) => {
                log::info!("no snapshot at {}; starting fresh", path.display());
                false
            }
            Err(e) => {
                log::warn!(
                    "could not read snapshot at {} ({e}); starting fresh",
                    path.display()
                );
                false
            }
        }
    }

    /// Run the server: load the snapshot, bind, and accept until `INT` or
    /// `TERM` arrives. On shutdown the registry is drained (pending queues
    /// discarded) and the document is left as last persisted.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.load_snapshot().await;

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!(
            "relay listening on {} (sub-protocol {SUBPROTOCOL:?}, shared type {:?})",
            self.config.bind_addr,
            self.config.shared_type
        );

        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("new TCP connection from {addr}");
                            let doc = self.doc.clone();
                            let registry = self.registry.clone();
                            let stats = self.stats.clone();
                            let config = self.config.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(
                                    stream, addr, doc, registry, stats, config,
                                )
                                .await
                                {
                                    log::warn!("connection from {addr} failed: {e}");
                                }
                            });
                        }
                        Err(e) => log::warn!("accept failed: {e}"),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("received interrupt, shutting down");
                    break;
                }
                _ = sigterm.recv() => {
                    log::info!("received terminate, shutting down");
                    break;
                }
            }
        }

        let drained = self.registry.clear().await;
        log::info!(
            "shutdown complete: drained {drained} peer(s), final text {:?}",
            self.doc.read().await.text_snapshot()
        );
        Ok(())
    }

    /// Serve one connection start to finish. The error return covers the
    /// WebSocket upgrade only; once a peer exists, every exit path funnels
    /// through the transport-closed cleanup below the session loop.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        doc: Arc<RwLock<SharedDoc>>,
        registry: Arc<PeerRegistry>,
        stats: Arc<AtomicRelayStats>,
        config: RelayConfig,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = accept_ws(stream).await?;

        let peer = registry.add().await;
        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("{} connected from {addr} ({} total)", peer.id(), registry.count().await);

        // A newcomer learns everyone else's presence before anything else.
        prime_awareness(&registry, &peer).await;

        Self::serve_session(ws_stream, &peer, &doc, &registry, &stats, &config).await;

        // Transport closed: announce the departure, then forget the peer.
        if let Some(client_id) = peer.client_id() {
            let removal = Arc::new(protocol::encode_awareness(client_id, None));
            broadcast(&registry, &stats, removal, peer.id(), false).await;
        }
        registry.remove(peer.id()).await;
        log::info!(
            "{} disconnected ({} remaining)",
            peer.id(),
            registry.count().await
        );
        Ok(())
    }

    /// The session loop: inbound dispatch and the writable pump, one task.
    /// Returns when the transport is done — client close, socket error,
    /// write failure, or a condemned queue.
    async fn serve_session(
        ws_stream: WebSocketStream<TcpStream>,
        peer: &Arc<Peer>,
        doc: &RwLock<SharedDoc>,
        registry: &PeerRegistry,
        stats: &AtomicRelayStats,
        config: &RelayConfig,
    ) {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Binary(data))) => {
                            let bytes: Vec<u8> = data.into();
                            stats.messages_received.fetch_add(1, Ordering::Relaxed);
                            Self::dispatch(&bytes, peer, doc, registry, stats, &config.snapshot_path)
                                .await;
                        }
                        Some(Ok(Message::Text(_))) => {
                            // Binary-only protocol; a text frame is not ours.
                            stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            log::warn!("{} sent a text frame, dropping", peer.id());
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if let Err(e) = ws_sender.send(Message::Pong(payload)).await {
                                log::warn!("{} pong failed: {e}", peer.id());
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("{} closed the connection", peer.id());
                            break;
                        }
                        Some(Ok(_)) => {} // pong / raw frame: nothing to do
                        Some(Err(e)) => {
                            log::warn!("{} websocket error: {e}", peer.id());
                            break;
                        }
                    }
                }

                outbound = peer.next_outbound() => {
                    match outbound {
                        Some(msg) => {
                            // Copy out of the queue; the shared buffer must
                            // not be tied up by a slow socket.
                            if let Err(e) =
                                ws_sender.send(Message::Binary(msg.to_vec().into())).await
                            {
                                log::warn!("{} write failed: {e}", peer.id());
                                break;
                            }
                            log::trace!("{} sent {} bytes", peer.id(), msg.len());
                        }
                        None => {
                            log::warn!("{} condemned (queue overrun), closing", peer.id());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Dispatch one inbound frame. Every error here is non-fatal to the
    /// session: the frame is dropped and the connection stays up.
    async fn dispatch(
        data: &[u8],
        peer: &Arc<Peer>,
        doc: &RwLock<SharedDoc>,
        registry: &PeerRegistry,
        stats: &AtomicRelayStats,
        snapshot_path: &Path,
    ) {
        let frame = match protocol::decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("{} sent an undecodable frame ({e}), dropping", peer.id());
                return;
            }
        };

        match frame {
            Frame::SyncStep1 { state_vector } => {
                // Canonical handshake: answer with the complete state. The
                // client merges idempotently, and its first update can never
                // race ahead of a reply it has not seen.
                log::debug!(
                    "{} SYNC_STEP1 (state vector {} bytes)",
                    peer.id(),
                    state_vector.len()
                );
                let state = doc.read().await.state_as_update();
                let reply = Arc::new(protocol::encode_sync_step2(&state));
                peer.enqueue(reply).await;
                peer.mark_synced();
                log::info!(
                    "{} handshake answered ({} state bytes)",
                    peer.id(),
                    state.len()
                );
            }

            Frame::SyncStep2 { update } => {
                // Apply inside a short write transaction, snapshot the full
                // state while still exclusive, then persist and fan out with
                // no lock held.
                let applied = {
                    let mut doc = doc.write().await;
                    match doc.apply_update(update) {
                        Ok(()) => Ok(doc.state_as_update()),
                        Err(e) => Err(e),
                    }
                };

                let blob = match applied {
                    Ok(blob) => blob,
                    Err(e) => {
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        log::error!("{} update rejected ({e}), dropping", peer.id());
                        return;
                    }
                };

                stats.updates_applied.fetch_add(1, Ordering::Relaxed);
                log::debug!("{} applied update ({} bytes)", peer.id(), update.len());

                if let Err(e) = persistence::save(snapshot_path, &blob) {
                    // Nothing partial was published; peers that missed this
                    // update will fetch it again through a fresh handshake.
                    log::error!(
                        "failed to persist snapshot to {} ({e}); broadcast skipped",
                        snapshot_path.display()
                    );
                    return;
                }
                stats.snapshots_persisted.fetch_add(1, Ordering::Relaxed);

                // Relay the original framed bytes, untouched.
                let frame = Arc::new(data.to_vec());
                broadcast(registry, stats, frame, peer.id(), true).await;
            }

            Frame::Awareness { client_id, state } => {
                peer.set_client_id(client_id);
                match &state {
                    Some(json) => log::trace!(
                        "{} awareness update for client {client_id} ({} bytes)",
                        peer.id(),
                        json.len()
                    ),
                    None => log::debug!(
                        "{} awareness removal for client {client_id}",
                        peer.id()
                    ),
                }
                peer.set_awareness(state).await;

                // Presence is relayed to everyone, handshake or not.
                let frame = Arc::new(data.to_vec());
                broadcast(registry, stats, frame, peer.id(), false).await;
            }
        }
    }
}

/// Upgrade a TCP stream, echoing the `crdt-protocol` sub-protocol when the
/// client offers it. Clients that omit the header are still served.
async fn accept_ws(
    stream: TcpStream,
) -> Result<WebSocketStream<TcpStream>, tokio_tungstenite::tungstenite::Error> {
    tokio_tungstenite::accept_hdr_async(
        stream,
        |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            let offered = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|value| value.to_str().ok())
                .map(|value| value.split(',').any(|p| p.trim() == SUBPROTOCOL))
                .unwrap_or(false);
            if offered {
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(SUBPROTOCOL),
                );
            }
            Ok(resp)
        },
    )
    .await
}

/// Enqueue `frame` onto every eligible peer except the originator.
///
/// Update broadcasts (`updates_only_synced`) skip peers still in the
/// handshake — a peer that has not seen its sync-step-2 reply must not
/// observe an update whose base it lacks. Awareness ignores sync state.
///
/// The registry lock is only held while snapshotting the membership; the
/// enqueues run lock-free over the snapshot, one `Arc` clone per target.
async fn broadcast(
    registry: &PeerRegistry,
    stats: &AtomicRelayStats,
    frame: Arc<Vec<u8>>,
    origin: PeerId,
    updates_only_synced: bool,
) {
    let targets = registry.snapshot().await;
    let mut delivered = 0u64;

    for target in targets {
        if target.id() == origin {
            continue;
        }
        if updates_only_synced && !target.is_synced() {
            continue;
        }
        if target.enqueue(frame.clone()).await {
            delivered += 1;
        }
    }

    stats.broadcast_fanout.fetch_add(delivered, Ordering::Relaxed);
    log::debug!("broadcast {} bytes to {delivered} peer(s)", frame.len());
}

/// Queue a freshly encoded awareness message onto `newcomer` for every
/// existing peer whose presence is known. Runs before the handshake, so
/// both arrive ahead of any broadcast the newcomer becomes eligible for.
async fn prime_awareness(registry: &PeerRegistry, newcomer: &Arc<Peer>) {
    let peers = registry.snapshot().await;
    let mut primed = 0;

    for other in peers {
        if other.id() == newcomer.id() {
            continue;
        }
        let (Some(client_id), Some(state)) = (other.client_id(), other.awareness().await)
        else {
            continue;
        };
        let framed = Arc::new(protocol::encode_awareness(client_id, Some(&state)));
        newcomer.enqueue(framed).await;
        primed += 1;
    }

    if primed > 0 {
        log::debug!("{} primed with {primed} cached awareness state(s)", newcomer.id());
    }
}
