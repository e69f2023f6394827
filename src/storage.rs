//! Torrent storage types and the read-only store interface the peer engine
//! consults.

use std::fmt::Display;

use bytes::Bytes;

use crate::{bitfield::Bitfield, error::Error, wire::BlockInfo};

/// How pieces of a torrent are authenticated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceStyle {
    /// A flat SHA1 hash per piece, carried in the torrent info.
    Plain,
    /// A single Merkle root; pieces ship with their sibling hash path.
    Merkle,
    /// An extendable Merkle tree with signed view roots; the torrent's
    /// length can grow after the initial info.
    Elastic,
}

/// The 20-byte identifier of a torrent's info dictionary.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// The extent of a torrent's storage: a fixed piece size and a total length.
/// The final piece may be shorter than the piece size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StorageLayout {
    piece_size: u32,
    length: u64,
}

impl StorageLayout {
    pub fn new(piece_size: u32, length: u64) -> Self {
        debug_assert!(piece_size > 0);
        Self { piece_size, length }
    }

    pub fn piece_size(&self) -> u32 {
        self.piece_size
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn num_pieces(&self) -> u32 {
        self.length.div_ceil(self.piece_size as u64) as u32
    }

    /// Length of piece `index`; the last piece covers the remainder.
    pub fn piece_len(&self, index: u32) -> u32 {
        let start = index as u64 * self.piece_size as u64;
        (self.length - start).min(self.piece_size as u64) as u32
    }
}

/// A signature over the Merkle root of an elastic torrent at a given view
/// length, allowing the torrent's extent to grow verifiably.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ViewSignature {
    pub view_length: u64,
    pub signature: Bytes,
}

impl ViewSignature {
    pub fn new(view_length: u64, signature: Bytes) -> Self {
        Self { view_length, signature }
    }
}

impl Display for ViewSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "view signature for length {}", self.view_length)
    }
}

/// The sibling hashes authenticating one piece against the Merkle root of a
/// tree covering `view_length` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashChain {
    pub view_length: u64,
    pub hashes: Bytes,
}

impl HashChain {
    pub fn new(view_length: u64, hashes: Bytes) -> Self {
        Self { view_length, hashes }
    }
}

/// Construction-time facts about a torrent.
#[derive(Clone, Debug)]
pub struct TorrentInfo {
    pub piece_style: PieceStyle,
    /// The layout declared by the torrent info. Under the elastic style the
    /// store's current layout may have grown past this.
    pub layout: StorageLayout,
    pub info_hash: InfoHash,
}

/// The slice of the piece database a peer session reads.
///
/// Implementations are shared between every session of a torrent and must be
/// internally thread safe. The engine never writes through this interface;
/// verified inbound blocks travel to the store via the coordinator.
pub trait PieceStore: Send + Sync {
    fn info(&self) -> &TorrentInfo;

    /// The current storage layout. Equal to `info().layout` except for an
    /// elastic torrent that has grown.
    fn layout(&self) -> StorageLayout;

    fn have_piece(&self, piece: u32) -> bool;

    /// Bitfield of verified pieces, sized to the current layout.
    fn present_pieces(&self) -> Bitfield;

    /// Reads the payload of a verified block for upload.
    fn read_block(&self, block: &BlockInfo) -> Result<Bytes, Error>;

    /// The sibling hash path for a piece, when the style carries one.
    fn hash_chain(&self, piece: u32) -> Option<HashChain>;

    /// The signature covering the view of the given length, if known.
    fn view_signature(&self, view_length: u64) -> Option<ViewSignature>;
}
