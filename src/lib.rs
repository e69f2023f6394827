//! The per-peer protocol engine of a BitTorrent client.
//!
//! This crate sits between a raw byte-stream connection to a single remote
//! peer and a torrent-wide coordinator. It turns bytes into typed peer wire
//! messages in both directions, tracks the full pairwise protocol state
//! (choke and interest flags on both sides, the remote bitfield, negotiated
//! extensions, allowed-fast grants, in-flight requests) and enforces the
//! message-level policies of the base protocol, the fast extension (BEP 6),
//! the extension protocol (BEP 10) and the elastic extension that lets a
//! torrent grow after its initial info.
//!
//! The surrounding client supplies the collaborators: a [`Connection`] that
//! can move bytes, a [`PieceStore`] holding verified piece data, and a
//! [`PeerCoordinator`] that allocates requests and runs the choking
//! algorithm across all peers of a torrent. One [`PeerSession`] is created
//! per connected, handshake-complete peer and lives until either side closes
//! the connection or a protocol error is detected.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use peerwire::{PeerSession, PeerId};
//! # fn demo(
//! #     coordinator: Arc<dyn peerwire::PeerCoordinator>,
//! #     store: Arc<dyn peerwire::PieceStore>,
//! #     conn: Box<dyn peerwire::Connection>,
//! # ) -> Result<(), peerwire::Error> {
//! let mut session = PeerSession::new(
//!     coordinator,
//!     store,
//!     conn,
//!     PeerId::generate(),
//!     true, // fast extension negotiated
//!     true, // extension protocol negotiated
//! )?;
//!
//! // Driven by the connection multiplexer whenever the socket is ready.
//! session.connection_ready(true, true);
//! # Ok(())
//! # }
//! ```

pub mod bitfield;
pub mod counter;
pub mod error;
pub mod extensions;
pub mod peer;
pub mod storage;
pub mod wire;

pub use bitfield::Bitfield;
pub use counter::Counter;
pub use error::Error;
pub use extensions::ExtensionHandshake;
pub use peer::{Connection, PeerCoordinator, PeerId, PeerSession, PeerState};
pub use storage::{
    HashChain, InfoHash, PieceStore, PieceStyle, StorageLayout, TorrentInfo,
    ViewSignature,
};
pub use wire::{BlockInfo, Message};
