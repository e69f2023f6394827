use std::{collections::BTreeMap, time::Instant};

use hashbrown::HashSet;

use crate::{
    bitfield::{self, Bitfield},
    peer::PeerId,
    storage::{StorageLayout, ViewSignature},
};

/// The protocol state of one peer pair. Passive: every transition is driven
/// by [`super::PeerSession`].
#[derive(Debug)]
pub struct PeerState {
    /// Id the remote presented in its handshake.
    pub remote_id: PeerId,

    /// If we are choking the peer, we don't allow them to download from us.
    pub am_choking: bool,

    /// If we are interested, the peer has pieces that we don't have.
    pub am_interested: bool,

    /// If the peer is choking us, they don't allow us to download from them.
    pub peer_choking: bool,

    /// If the peer is interested, they mean to download pieces that we have.
    pub peer_interested: bool,

    /// Whether the fast extension was negotiated in the handshake.
    pub fast_extension: bool,

    /// Whether the extension protocol was negotiated in the handshake.
    pub extension_protocol: bool,

    /// Pieces the remote claims to have. Always at least as long as the
    /// remote view's piece count.
    pub remote_pieces: Bitfield,

    /// The extent of the torrent as the remote has declared it. Grows, never
    /// shrinks, under the elastic extension.
    pub remote_view: StorageLayout,

    /// View signatures accepted from the remote, keyed by view length. At
    /// most two are kept: the current view and the previous one.
    pub remote_view_signatures: BTreeMap<u64, ViewSignature>,

    /// Extension protocol identifiers the remote has enabled.
    pub remote_extensions: HashSet<String>,

    /// When the last inbound bytes arrived. Keepalives count.
    pub last_data_received: Instant,
}

impl PeerState {
    /// Both directions start out choked and not interested.
    pub fn new(
        remote_id: PeerId,
        initial_view: StorageLayout,
        fast_extension: bool,
        extension_protocol: bool,
    ) -> Self {
        Self {
            remote_id,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            fast_extension,
            extension_protocol,
            remote_pieces: bitfield::empty(initial_view.num_pieces()),
            remote_view: initial_view,
            remote_view_signatures: BTreeMap::new(),
            remote_extensions: HashSet::new(),
            last_data_received: Instant::now(),
        }
    }
}
