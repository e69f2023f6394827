//! Peer wire protocol constants and primitive types.

mod codec;

pub use codec::{ExtendedMessage, Message, MessageCodec, PieceBlock};

use std::fmt::Display;

use bytes::{BufMut, BytesMut};

/// Seconds without any inbound bytes after which the session closes itself
/// on the next keepalive tick.
pub const IDLE_INTERVAL_SECS: u64 = 240;

/// Size of the allowed-fast set, and the remote piece count at or below
/// which one is offered.
pub const ALLOWED_FAST_THRESHOLD: u32 = 10;

/// The largest block a request may ask for. Requests beyond this are a
/// protocol violation.
pub const MAX_BLOCK_LEN: u32 = 128 * 1024;

/// The block size this client requests.
pub const BLOCK_LEN: u32 = 16384;

/// Number of requests kept in flight towards a remote peer.
pub const TARGET_REQUEST_QUEUE_LEN: usize = 50;

/// Upper bound on a single wire frame: a maximum-size block plus the piece
/// header and an elastic hash chain.
pub const MAX_FRAME_LEN: usize = MAX_BLOCK_LEN as usize + 4 * 1024;

/// Extension protocol name advertised for the elastic extension.
pub const EXTENSION_ELASTIC: &str = "elastic";

/// Extension protocol name advertised for the Merkle piece style.
pub const EXTENSION_MERKLE: &str = "merkle";

/// The IDs of the wire messages.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    // fast extension (BEP 6)
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    Reject = 16,
    AllowedFast = 17,
    // extension protocol (BEP 10)
    Extended = 20,
    // elastic extension
    Elastic = 21,
}

/// Subtypes of the elastic message.
pub(crate) const ELASTIC_SIGNATURE: u8 = 0;
pub(crate) const ELASTIC_BITFIELD: u8 = 1;

/// A block of a piece: the unit of request and transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    /// The piece the block belongs to.
    pub index: u32,
    /// Byte offset of the block within its piece.
    pub begin: u32,
    /// Length of the block in bytes.
    pub len: u32,
}

impl BlockInfo {
    pub fn new(index: u32, begin: u32, len: u32) -> Self {
        Self { index, begin, len }
    }

    /// Writes the wire form of the triple.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }
}

impl Display for BlockInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "block {}:{}..{}",
            self.index,
            self.begin,
            self.begin + self.len
        )
    }
}
