//! # crdt-relay — collaborative-document relay server
//!
//! A relay for real-time collaborative editing speaking the y-websocket
//! wire protocol. The server holds the single authoritative CRDT document
//! (a shared text, `yrs` under the hood), converges newly connected
//! clients through the two-step sync handshake, applies and persists
//! their updates, and fans each one out to every other synced client.
//! Presence (cursors, user identity) is relayed but never persisted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐  binary WS frames   ┌─────────────────────────────┐
//! │ client A │ ◄──────────────────► │ RelayServer                 │
//! └──────────┘                     │   ├── protocol (frame codec) │
//! ┌──────────┐                     │   ├── SharedDoc (yrs)        │
//! │ client B │ ◄──────────────────► │   ├── PeerRegistry + queues  │
//! └──────────┘                     │   └── snapshot sidecar       │
//!       ⋮                          └─────────────┬───────────────┘
//!                                                ▼
//!                                        crdt_document.bin
//! ```
//!
//! ## Modules
//!
//! - [`varint`] — length-prefix varints of the y-websocket framing
//! - [`protocol`] — the three message kinds (sync-step-1/2, awareness)
//! - [`document`] — the authoritative document, a thin `yrs` wrapper
//! - [`persistence`] — whole-state snapshot blob on disk
//! - [`peer`] — peer registry, per-peer outbound queues, awareness cache
//! - [`server`] — accept loop, session state machine, dispatch, broadcast

pub mod document;
pub mod peer;
pub mod persistence;
pub mod protocol;
pub mod server;
pub mod varint;

pub use document::{DocError, SharedDoc};
pub use peer::{Peer, PeerId, PeerRegistry};
pub use protocol::{Frame, FrameError};
pub use server::{RelayConfig, RelayServer, RelayStats, SUBPROTOCOL};
pub use varint::VarintError;
