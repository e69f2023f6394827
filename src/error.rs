use std::io;

use thiserror::Error;

use crate::{storage::PieceStyle, wire::BlockInfo};

impl From<bendy::decoding::Error> for Error {
    fn from(_value: bendy::decoding::Error) -> Self {
        Self::Bencode
    }
}

impl From<bendy::encoding::Error> for Error {
    fn from(_value: bendy::encoding::Error) -> Self {
        Self::Bencode
    }
}

/// Errors raised while talking to a remote peer.
///
/// Every variant except [`Error::Bencode`] on the encode path is fatal for
/// the session that raised it: the connection is closed and the coordinator
/// is told the peer disconnected.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error")]
    Io(#[from] io::Error),

    #[error("Failed to decode or encode a bencode dictionary")]
    Bencode,

    #[error("Message of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("Truncated payload for message id {0}")]
    TruncatedMessage(u8),

    #[error("{0} is only valid as the first message of a session")]
    NotFirstMessage(&'static str),

    #[error("Received a fast extension message but fast was not negotiated")]
    FastNotNegotiated,

    #[error(
        "Received an extension protocol message but the extension protocol \
         was not negotiated"
    )]
    ExtensionProtocolNotNegotiated,

    #[error("Received an elastic message on a non-elastic torrent")]
    ElasticNotNegotiated,

    #[error("Bitfield does not match the torrent's piece count")]
    BitfieldSize,

    #[error("Piece index {0} is out of range")]
    PieceOutOfRange(u32),

    #[error("Invalid block {0}")]
    InvalidBlock(BlockInfo),

    #[error("Expected a {expected:?} piece, received a {received:?} piece")]
    PieceStyleMismatch { expected: PieceStyle, received: PieceStyle },

    #[error("Piece carries an unknown view length {0}")]
    UnknownViewLength(u64),

    #[error("Received a piece that was never requested: {0}")]
    UnrequestedPiece(BlockInfo),

    #[error("Received a reject for a request that was never made: {0}")]
    UnrequestedReject(BlockInfo),

    #[error("Request for piece {0} which we do not have")]
    PieceNotPresent(u32),

    #[error("View signature failed verification")]
    SignatureRejected,
}
