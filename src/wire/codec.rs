use std::io::Cursor;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::{
    bitfield,
    bitfield::Bitfield,
    error::Error,
    storage::{PieceStyle, ViewSignature},
    wire::{
        BlockInfo, MessageId, ELASTIC_BITFIELD, ELASTIC_SIGNATURE,
        MAX_FRAME_LEN,
    },
};

/// An extension protocol message: the inner extension id plus its payload.
/// Id 0 is the extension handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedMessage(pub u8, pub Vec<u8>);

impl ExtendedMessage {
    pub fn ext_id(&self) -> u8 {
        self.0
    }

    pub fn payload(&self) -> &[u8] {
        &self.1
    }
}

/// The payload of a piece message. The descriptor's length always equals the
/// data length; the hash fields are present only for the styles that carry
/// them, and then only on the first block of a piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceBlock {
    pub style: PieceStyle,
    pub block: BlockInfo,
    /// The view the hash chain authenticates against (elastic only).
    pub view_length: Option<u64>,
    /// Concatenated 20-byte sibling hashes (Merkle and elastic).
    pub hashes: Option<Bytes>,
    pub data: Bytes,
}

/// A peer wire message, either direction.
///
/// Bitfields travel as raw bytes; sizing them against the torrent's piece
/// count is the session's job, since only it knows the remote's view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece(PieceBlock),
    Cancel(BlockInfo),
    // fast extension
    SuggestPiece(u32),
    HaveAll,
    HaveNone,
    Reject(BlockInfo),
    AllowedFast(u32),
    // extension protocol
    Extended(ExtendedMessage),
    // elastic extension
    ElasticSignature(ViewSignature),
    ElasticBitfield(Bytes),
    /// A message id this client does not understand. Ignored.
    Unknown(u8, Bytes),
}

impl Message {
    /// Builds a bitfield message from a typed bitfield.
    pub fn bitfield(bitfield: &Bitfield) -> Self {
        Message::Bitfield(bitfield::to_wire(bitfield).into())
    }

    /// Builds an elastic bitfield message from a typed bitfield.
    pub fn elastic_bitfield(bitfield: &Bitfield) -> Self {
        Message::ElasticBitfield(bitfield::to_wire(bitfield).into())
    }
}

/// Tokeniser for the peer wire protocol.
///
/// The codec is constructed with the torrent's piece style and the feature
/// flags negotiated during the handshake, and enforces the framing rules
/// that depend on them: fast messages require the fast extension, id 20
/// requires the extension protocol, elastic frames require the elastic
/// style, and `HaveAll`/`HaveNone` are only legal as the first message.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    style: PieceStyle,
    fast_extension: bool,
    extension_protocol: bool,
    first_message_seen: bool,
}

impl MessageCodec {
    pub fn new(
        style: PieceStyle,
        fast_extension: bool,
        extension_protocol: bool,
    ) -> Self {
        Self {
            style,
            fast_extension,
            extension_protocol,
            first_message_seen: false,
        }
    }

    fn decode_piece(&self, mut payload: Bytes) -> Result<PieceBlock, Error> {
        let id = MessageId::Piece as u8;
        if payload.remaining() < 8 {
            return Err(Error::TruncatedMessage(id));
        }
        let index = payload.get_u32();
        let begin = payload.get_u32();

        let (view_length, hashes) = match self.style {
            PieceStyle::Plain => (None, None),
            PieceStyle::Merkle => {
                if payload.remaining() < 2 {
                    return Err(Error::TruncatedMessage(id));
                }
                let count = payload.get_u16() as usize;
                if payload.remaining() < count * 20 {
                    return Err(Error::TruncatedMessage(id));
                }
                let hashes = (count > 0)
                    .then(|| payload.copy_to_bytes(count * 20));
                (None, hashes)
            }
            PieceStyle::Elastic => {
                if payload.remaining() < 1 {
                    return Err(Error::TruncatedMessage(id));
                }
                if payload.get_u8() == 0 {
                    (None, None)
                } else {
                    if payload.remaining() < 10 {
                        return Err(Error::TruncatedMessage(id));
                    }
                    let view_length = payload.get_u64();
                    let count = payload.get_u16() as usize;
                    if payload.remaining() < count * 20 {
                        return Err(Error::TruncatedMessage(id));
                    }
                    (Some(view_length), Some(payload.copy_to_bytes(count * 20)))
                }
            }
        };

        let data = payload;
        let block = BlockInfo::new(index, begin, data.len() as u32);

        Ok(PieceBlock { style: self.style, block, view_length, hashes, data })
    }

    fn decode_elastic(&self, mut payload: Bytes) -> Result<Message, Error> {
        let id = MessageId::Elastic as u8;
        if payload.remaining() < 1 {
            return Err(Error::TruncatedMessage(id));
        }
        match payload.get_u8() {
            ELASTIC_SIGNATURE => {
                if payload.remaining() < 8 {
                    return Err(Error::TruncatedMessage(id));
                }
                let view_length = payload.get_u64();
                Ok(Message::ElasticSignature(ViewSignature::new(
                    view_length,
                    payload,
                )))
            }
            ELASTIC_BITFIELD => Ok(Message::ElasticBitfield(payload)),
            _ => Ok(Message::Unknown(id, payload)),
        }
    }
}

fn encode_block_message(id: MessageId, block: &BlockInfo, buf: &mut BytesMut) {
    buf.put_u32(13);
    buf.put_u8(id as u8);
    block.encode(buf);
}

fn encode_index_message(id: MessageId, index: u32, buf: &mut BytesMut) {
    buf.put_u32(5);
    buf.put_u8(id as u8);
    buf.put_u32(index);
}

fn encode_flag_message(id: MessageId, buf: &mut BytesMut) {
    buf.put_u32(1);
    buf.put_u8(id as u8);
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => encode_flag_message(MessageId::Choke, buf),
            Message::Unchoke => encode_flag_message(MessageId::Unchoke, buf),
            Message::Interested => {
                encode_flag_message(MessageId::Interested, buf)
            }
            Message::NotInterested => {
                encode_flag_message(MessageId::NotInterested, buf)
            }
            Message::HaveAll => encode_flag_message(MessageId::HaveAll, buf),
            Message::HaveNone => encode_flag_message(MessageId::HaveNone, buf),
            Message::Have(index) => {
                encode_index_message(MessageId::Have, index, buf)
            }
            Message::SuggestPiece(index) => {
                encode_index_message(MessageId::SuggestPiece, index, buf)
            }
            Message::AllowedFast(index) => {
                encode_index_message(MessageId::AllowedFast, index, buf)
            }
            Message::Request(block) => {
                encode_block_message(MessageId::Request, &block, buf)
            }
            Message::Cancel(block) => {
                encode_block_message(MessageId::Cancel, &block, buf)
            }
            Message::Reject(block) => {
                encode_block_message(MessageId::Reject, &block, buf)
            }
            Message::Bitfield(bytes) => {
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            Message::Piece(piece) => {
                let hashes_len =
                    piece.hashes.as_ref().map(|h| h.len()).unwrap_or(0);
                let style_overhead = match piece.style {
                    PieceStyle::Plain => 0,
                    PieceStyle::Merkle => 2 + hashes_len,
                    PieceStyle::Elastic => {
                        1 + if piece.hashes.is_some() { 10 + hashes_len } else { 0 }
                    }
                };
                buf.put_u32(
                    (9 + style_overhead + piece.data.len()) as u32,
                );
                buf.put_u8(MessageId::Piece as u8);
                buf.put_u32(piece.block.index);
                buf.put_u32(piece.block.begin);
                match piece.style {
                    PieceStyle::Plain => {}
                    PieceStyle::Merkle => {
                        buf.put_u16((hashes_len / 20) as u16);
                        if let Some(hashes) = &piece.hashes {
                            buf.extend_from_slice(hashes);
                        }
                    }
                    PieceStyle::Elastic => {
                        if let Some(hashes) = &piece.hashes {
                            buf.put_u8(1);
                            buf.put_u64(piece.view_length.unwrap_or_default());
                            buf.put_u16((hashes.len() / 20) as u16);
                            buf.extend_from_slice(hashes);
                        } else {
                            buf.put_u8(0);
                        }
                    }
                }
                buf.extend_from_slice(&piece.data);
            }
            Message::Extended(ExtendedMessage(ext_id, payload)) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                buf.extend_from_slice(&payload);
            }
            Message::ElasticSignature(signature) => {
                buf.put_u32(10 + signature.signature.len() as u32);
                buf.put_u8(MessageId::Elastic as u8);
                buf.put_u8(ELASTIC_SIGNATURE);
                buf.put_u64(signature.view_length);
                buf.extend_from_slice(&signature.signature);
            }
            Message::ElasticBitfield(bytes) => {
                buf.put_u32(2 + bytes.len() as u32);
                buf.put_u8(MessageId::Elastic as u8);
                buf.put_u8(ELASTIC_BITFIELD);
                buf.extend_from_slice(&bytes);
            }
            Message::Unknown(id, payload) => {
                buf.put_u32(1 + payload.len() as u32);
                buf.put_u8(id);
                buf.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the length header must be present before anything can be decided
        if src.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length without consuming it, the full frame may not
        // have arrived yet
        let mut peek = Cursor::new(&src[..]);
        let msg_len = peek.get_u32() as usize;

        if msg_len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge(msg_len));
        }

        if src.remaining() < 4 + msg_len {
            trace!(
                "buffer holds {} bytes, frame needs {}",
                src.remaining(),
                4 + msg_len
            );
            return Ok(None);
        }

        src.advance(4);

        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let id = src.split_to(1)[0];
        let mut payload = src.split_to(msg_len - 1).freeze();

        let first = !self.first_message_seen;
        self.first_message_seen = true;

        if (MessageId::SuggestPiece as u8..=MessageId::AllowedFast as u8)
            .contains(&id)
            && !self.fast_extension
        {
            return Err(Error::FastNotNegotiated);
        }

        let require_u32 = |payload: &mut Bytes| {
            if payload.remaining() < 4 {
                return Err(Error::TruncatedMessage(id));
            }
            Ok(payload.get_u32())
        };
        let require_block = |payload: &mut Bytes| {
            if payload.remaining() < 12 {
                return Err(Error::TruncatedMessage(id));
            }
            Ok(BlockInfo::new(
                payload.get_u32(),
                payload.get_u32(),
                payload.get_u32(),
            ))
        };

        let msg = match id {
            id if id == MessageId::Choke as u8 => Message::Choke,
            id if id == MessageId::Unchoke as u8 => Message::Unchoke,
            id if id == MessageId::Interested as u8 => Message::Interested,
            id if id == MessageId::NotInterested as u8 => {
                Message::NotInterested
            }
            id if id == MessageId::Have as u8 => {
                Message::Have(require_u32(&mut payload)?)
            }
            id if id == MessageId::Bitfield as u8 => Message::Bitfield(payload),
            id if id == MessageId::Request as u8 => {
                Message::Request(require_block(&mut payload)?)
            }
            id if id == MessageId::Piece as u8 => {
                Message::Piece(self.decode_piece(payload)?)
            }
            id if id == MessageId::Cancel as u8 => {
                Message::Cancel(require_block(&mut payload)?)
            }
            id if id == MessageId::SuggestPiece as u8 => {
                Message::SuggestPiece(require_u32(&mut payload)?)
            }
            id if id == MessageId::HaveAll as u8 => {
                if !first {
                    return Err(Error::NotFirstMessage("have all"));
                }
                Message::HaveAll
            }
            id if id == MessageId::HaveNone as u8 => {
                if !first {
                    return Err(Error::NotFirstMessage("have none"));
                }
                Message::HaveNone
            }
            id if id == MessageId::Reject as u8 => {
                Message::Reject(require_block(&mut payload)?)
            }
            id if id == MessageId::AllowedFast as u8 => {
                Message::AllowedFast(require_u32(&mut payload)?)
            }
            id if id == MessageId::Extended as u8 => {
                if !self.extension_protocol {
                    return Err(Error::ExtensionProtocolNotNegotiated);
                }
                if payload.remaining() < 1 {
                    return Err(Error::TruncatedMessage(id));
                }
                let ext_id = payload.get_u8();
                Message::Extended(ExtendedMessage(ext_id, payload.to_vec()))
            }
            id if id == MessageId::Elastic as u8 => {
                if self.style != PieceStyle::Elastic {
                    return Err(Error::ElasticNotNegotiated);
                }
                self.decode_elastic(payload)?
            }
            id => Message::Unknown(id, payload),
        };

        Ok(Some(msg))
    }
}
