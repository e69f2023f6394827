//! The collaborator seams of the peer engine: the torrent-wide coordinator
//! and the byte-stream connection.

use std::{io, net::SocketAddr};

use bytes::BytesMut;

use crate::{
    bitfield::Bitfield,
    extensions::ExtensionHandshake,
    peer::PeerId,
    storage::{HashChain, ViewSignature},
    wire::BlockInfo,
};

/// The torrent-wide coordinator a session reports to.
///
/// One implementation serves every peer of a torrent, so it must be
/// internally thread safe. All methods except `lock`/`unlock` are invoked
/// with the peer context lock held and must not call back into the session
/// that is currently calling them.
pub trait PeerCoordinator: Send + Sync {
    /// The remote announced a single new piece. Returns whether we are now
    /// interested in the peer.
    fn add_available_piece(&self, peer: &PeerId, piece: u32) -> bool;

    /// The remote announced its full piece set. Returns whether we are
    /// interested in the peer.
    fn add_available_pieces(&self, peer: &PeerId, pieces: &Bitfield) -> bool;

    /// The remote granted allowed-fast status for a piece it has.
    fn set_piece_allowed_fast(&self, peer: &PeerId, piece: u32);

    /// The remote suggested downloading a piece it has.
    fn set_piece_suggested(&self, peer: &PeerId, piece: u32);

    /// Allocates up to `count` block requests for the peer. Under
    /// `allowed_fast_only`, only pieces the peer has allowed-fast granted us
    /// may be returned.
    fn allocate_requests(
        &self,
        peer: &PeerId,
        count: usize,
        allowed_fast_only: bool,
    ) -> Vec<BlockInfo>;

    /// Delivers a block that matched an outstanding request, together with
    /// the authentication material its piece style carries.
    fn handle_block(
        &self,
        peer: &PeerId,
        block: BlockInfo,
        view_signature: Option<ViewSignature>,
        hash_chain: Option<HashChain>,
        data: &[u8],
    );

    /// Verifies a view signature. Returns false if verification failed.
    fn handle_view_signature(&self, signature: &ViewSignature) -> bool;

    /// Re-evaluates choking across the torrent. `am_choking` is the calling
    /// session's current choke state towards the remote.
    fn adjust_choking(&self, am_choking: bool);

    /// The remote's extension handshake changed its enabled extension set.
    fn enable_disable_extensions(
        &self,
        peer: &PeerId,
        added: &[String],
        removed: &[String],
        handshake: &ExtensionHandshake,
    );

    /// An extension message for an extension the coordinator manages.
    fn process_extension_message(&self, peer: &PeerId, id: u8, payload: &[u8]);

    /// The session is gone. Called exactly once per session.
    fn peer_disconnected(&self, peer: &PeerId);

    /// Invited at construction time when the extension protocol is enabled,
    /// so the coordinator can offer its extensions to the new peer.
    fn offer_extensions(&self, peer: &PeerId);

    /// Coarse mutual exclusion around a session's ready cycle.
    fn lock(&self);
    fn unlock(&self);
}

/// Holds the coordinator lock for a scope; released on every exit path.
pub(crate) struct CoordinatorLock<'a> {
    coordinator: &'a dyn PeerCoordinator,
}

impl<'a> CoordinatorLock<'a> {
    pub fn acquire(coordinator: &'a dyn PeerCoordinator) -> Self {
        coordinator.lock();
        Self { coordinator }
    }
}

impl Drop for CoordinatorLock<'_> {
    fn drop(&mut self) {
        self.coordinator.unlock();
    }
}

/// A connected, handshake-complete byte stream to the remote peer.
///
/// The multiplexer that owns the socket signals readiness through
/// [`super::PeerSession::connection_ready`]; the session then moves as many
/// bytes as the connection will take through these methods.
pub trait Connection: Send {
    /// Address of the remote end.
    fn remote_addr(&self) -> SocketAddr;

    /// Appends available bytes to `buf`. Returns the number appended; zero
    /// means no bytes are available right now. A closed or failed transport
    /// is an error.
    fn read(&mut self, buf: &mut BytesMut) -> io::Result<usize>;

    /// Writes a prefix of `buf`. Returns the number accepted; zero means
    /// the transport cannot take more right now.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Closes the transport. Errors are reported but the connection is
    /// considered closed regardless.
    fn close(&mut self) -> io::Result<()>;
}
