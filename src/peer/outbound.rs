use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use hashbrown::HashSet;
use tokio_util::codec::Encoder;
use tracing::trace;

use crate::{
    counter::Counter,
    error::Error,
    peer::services::Connection,
    storage::{PieceStore, PieceStyle},
    wire::{
        BlockInfo, Message, MessageCodec, PieceBlock, TARGET_REQUEST_QUEUE_LEN,
    },
};

/// Ordered buffer of outbound messages for one peer.
///
/// Three queues leave the wire in rank order: control messages, then unsent
/// requests, then piece payloads. Order within a queue is FIFO. A message is
/// committed once its serialisation has started; until then it can be
/// cancelled by its opposite (interested by not-interested, a request by its
/// cancel) or discarded by a choke or a piece rejection.
pub(crate) struct OutboundQueue {
    store: Arc<dyn PieceStore>,
    counter: Arc<Counter>,
    codec: MessageCodec,

    messages: VecDeque<Message>,
    /// Requests not yet on the wire.
    requests: VecDeque<BlockInfo>,
    /// Piece responses not yet on the wire.
    pieces: VecDeque<BlockInfo>,
    /// Requests on the wire, awaiting a piece or a reject.
    sent_requests: VecDeque<BlockInfo>,

    /// Serialised head message and how much of it has been written.
    pending: Option<(Bytes, usize)>,

    /// While plugged, only requests for pieces the remote has allowed-fast
    /// granted us are serialised; the rest stay buffered.
    requests_plugged: bool,
    keepalive_queued: bool,

    /// Pieces we granted the remote: requestable from us while choked.
    allowed_fast_out: HashSet<u32>,
    /// Pieces the remote granted us: requestable by us while choked.
    allowed_fast_in: HashSet<u32>,
}

impl OutboundQueue {
    pub fn new(
        store: Arc<dyn PieceStore>,
        counter: Arc<Counter>,
        codec: MessageCodec,
    ) -> Self {
        Self {
            store,
            counter,
            codec,
            messages: VecDeque::new(),
            requests: VecDeque::new(),
            pieces: VecDeque::new(),
            sent_requests: VecDeque::new(),
            pending: None,
            requests_plugged: false,
            keepalive_queued: false,
            allowed_fast_out: HashSet::new(),
            allowed_fast_in: HashSet::new(),
        }
    }

    /// Enqueues a control message verbatim.
    pub fn send_message(&mut self, msg: Message) {
        self.messages.push_back(msg);
    }

    /// Queues Interested or NotInterested. If the opposite message is still
    /// waiting unsent, it is removed instead and nothing new is queued.
    pub fn send_interested(&mut self, interested: bool) {
        let opposite =
            if interested { Message::NotInterested } else { Message::Interested };
        if let Some(pos) = self.messages.iter().position(|m| *m == opposite) {
            self.messages.remove(pos);
            return;
        }
        self.messages.push_back(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    /// Queues Choke or Unchoke. Choking discards every unsent piece response
    /// except those for allowed-fast pieces; the discarded descriptors are
    /// returned so the session can reject them explicitly under the fast
    /// extension.
    pub fn send_choke(&mut self, choking: bool) -> Vec<BlockInfo> {
        self.messages.push_back(if choking {
            Message::Choke
        } else {
            Message::Unchoke
        });

        if !choking {
            return Vec::new();
        }

        let allowed = &self.allowed_fast_out;
        let mut discarded = Vec::new();
        self.pieces.retain(|block| {
            if allowed.contains(&block.index) {
                true
            } else {
                discarded.push(*block);
                false
            }
        });
        discarded
    }

    /// Queues a keepalive unless one is already waiting.
    pub fn send_keepalive(&mut self) {
        if !self.keepalive_queued {
            self.keepalive_queued = true;
            self.messages.push_back(Message::KeepAlive);
        }
    }

    pub fn send_requests(&mut self, blocks: Vec<BlockInfo>) {
        self.requests.extend(blocks);
    }

    pub fn send_piece(&mut self, block: BlockInfo) {
        self.pieces.push_back(block);
    }

    pub fn send_reject(&mut self, block: BlockInfo) {
        self.messages.push_back(Message::Reject(block));
    }

    pub fn send_rejects(&mut self, blocks: &[BlockInfo]) {
        for block in blocks {
            self.send_reject(*block);
        }
    }

    /// Records and announces the allowed-fast grants we make to the remote.
    pub fn send_allowed_fast(&mut self, pieces: &[u32]) {
        for &piece in pieces {
            self.allowed_fast_out.insert(piece);
            self.messages.push_back(Message::AllowedFast(piece));
        }
    }

    pub fn is_piece_allowed_fast(&self, piece: u32) -> bool {
        self.allowed_fast_out.contains(&piece)
    }

    /// Withdraws every grant we made. The announced messages already on the
    /// wire stay valid from the remote's point of view until it observes our
    /// choke state; we simply stop honouring them.
    pub fn clear_allowed_fast_pieces(&mut self) {
        self.allowed_fast_out.clear();
    }

    /// The remote granted us a piece: requests for it flow even while
    /// plugged.
    pub fn set_request_allowed_fast(&mut self, piece: u32) {
        self.allowed_fast_in.insert(piece);
    }

    pub fn set_requests_plugged(&mut self, plugged: bool) {
        self.requests_plugged = plugged;
    }

    /// Puts every sent-but-unanswered request back at the front of the
    /// unsent queue, preserving order.
    pub fn requeue_all_requests(&mut self) {
        let sent: Vec<BlockInfo> = self.sent_requests.drain(..).collect();
        for block in sent.into_iter().rev() {
            self.requests.push_front(block);
        }
    }

    /// Matches an inbound piece against the tracked requests. Clears and
    /// reports whether a tracked request existed.
    pub fn request_received(&mut self, block: &BlockInfo) -> bool {
        self.take_tracked(block)
    }

    /// Matches an inbound reject against the tracked requests.
    pub fn reject_received(&mut self, block: &BlockInfo) -> bool {
        self.take_tracked(block)
    }

    fn take_tracked(&mut self, block: &BlockInfo) -> bool {
        if let Some(pos) =
            self.sent_requests.iter().position(|b| b == block)
        {
            self.sent_requests.remove(pos);
            return true;
        }
        false
    }

    /// Cancels a request. Still unsent: removed outright, no wire traffic.
    /// Already sent: a Cancel goes out, and with `retain_tracking` the
    /// tracking entry stays so the remote's eventual piece or reject still
    /// matches.
    pub fn cancel_request(&mut self, block: &BlockInfo, retain_tracking: bool) {
        if let Some(pos) = self.requests.iter().position(|b| b == block) {
            self.requests.remove(pos);
            return;
        }
        if let Some(pos) = self.sent_requests.iter().position(|b| b == block)
        {
            self.messages.push_back(Message::Cancel(*block));
            if !retain_tracking {
                self.sent_requests.remove(pos);
            }
        }
    }

    /// Removes a matching unsent piece response. Reports whether one was
    /// removed.
    pub fn discard_piece(&mut self, block: &BlockInfo) -> bool {
        if let Some(pos) = self.pieces.iter().position(|b| b == block) {
            self.pieces.remove(pos);
            return true;
        }
        false
    }

    /// Purges every unsent piece response for a piece.
    pub fn reject_piece(&mut self, piece: u32) {
        self.pieces.retain(|block| block.index != piece);
    }

    /// How many new requests would fill the pipeline.
    pub fn requests_needed(&self) -> usize {
        TARGET_REQUEST_QUEUE_LEN
            .saturating_sub(self.requests.len() + self.sent_requests.len())
    }

    pub fn has_outstanding_requests(&self) -> bool {
        !self.sent_requests.is_empty() || !self.requests.is_empty()
    }

    pub fn unsent_piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Writes as many queued bytes as the connection accepts. Returns the
    /// count written; a partially written message keeps its cursor for the
    /// next call.
    pub fn send_data(
        &mut self,
        conn: &mut dyn Connection,
    ) -> Result<usize, Error> {
        let mut total = 0;
        loop {
            if self.pending.is_none() {
                let Some(msg) = self.next_message()? else { break };
                let mut buf = BytesMut::new();
                self.codec.encode(msg, &mut buf)?;
                self.pending = Some((buf.freeze(), 0));
            }
            let Some((bytes, offset)) = self.pending.as_mut() else { break };
            let written = conn.write(&bytes[*offset..])?;
            if written == 0 {
                trace!("connection full after {total} bytes");
                break;
            }
            total += written;
            *offset += written;
            if *offset == bytes.len() {
                self.pending = None;
            }
        }
        Ok(total)
    }

    /// The next message allowed on the wire: control first, then an
    /// eligible request, then a piece payload.
    fn next_message(&mut self) -> Result<Option<Message>, Error> {
        if let Some(msg) = self.messages.pop_front() {
            if msg == Message::KeepAlive {
                self.keepalive_queued = false;
            }
            return Ok(Some(msg));
        }

        if let Some(block) =
            self.next_request_pos().and_then(|pos| self.requests.remove(pos))
        {
            self.sent_requests.push_back(block);
            return Ok(Some(Message::Request(block)));
        }

        if let Some(block) = self.pieces.pop_front() {
            return Ok(Some(self.piece_message(block)?));
        }

        Ok(None)
    }

    fn next_request_pos(&self) -> Option<usize> {
        if !self.requests_plugged {
            return (!self.requests.is_empty()).then_some(0);
        }
        self.requests
            .iter()
            .position(|block| self.allowed_fast_in.contains(&block.index))
    }

    /// Assembles an outgoing piece message, attaching the hash material the
    /// piece style carries on the first block of a piece.
    fn piece_message(&self, block: BlockInfo) -> Result<Message, Error> {
        let style = self.store.info().piece_style;
        let data = self.store.read_block(&block)?;

        let (view_length, hashes) = if block.begin == 0 {
            match style {
                PieceStyle::Plain => (None, None),
                PieceStyle::Merkle => (
                    None,
                    self.store.hash_chain(block.index).map(|chain| chain.hashes),
                ),
                PieceStyle::Elastic => {
                    match self.store.hash_chain(block.index) {
                        Some(chain) => {
                            (Some(chain.view_length), Some(chain.hashes))
                        }
                        None => (None, None),
                    }
                }
            }
        } else {
            (None, None)
        };

        self.counter.record_block_upload(data.len() as u64);

        Ok(Message::Piece(PieceBlock {
            style,
            block,
            view_length,
            hashes,
            data,
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::{io, net::SocketAddr};

    use super::*;
    use crate::storage::{
        HashChain, InfoHash, StorageLayout, TorrentInfo, ViewSignature,
    };
    use tokio_util::codec::Decoder;

    struct TestStore {
        info: TorrentInfo,
    }

    impl TestStore {
        fn plain(num_pieces: u32) -> Arc<Self> {
            Arc::new(Self {
                info: TorrentInfo {
                    piece_style: PieceStyle::Plain,
                    layout: StorageLayout::new(16384, 16384 * num_pieces as u64),
                    info_hash: InfoHash([0; 20]),
                },
            })
        }
    }

    impl PieceStore for TestStore {
        fn info(&self) -> &TorrentInfo {
            &self.info
        }

        fn layout(&self) -> StorageLayout {
            self.info.layout
        }

        fn have_piece(&self, _piece: u32) -> bool {
            true
        }

        fn present_pieces(&self) -> crate::bitfield::Bitfield {
            crate::bitfield::full(self.info.layout.num_pieces())
        }

        fn read_block(&self, block: &BlockInfo) -> Result<Bytes, Error> {
            Ok(vec![0u8; block.len as usize].into())
        }

        fn hash_chain(&self, _piece: u32) -> Option<HashChain> {
            None
        }

        fn view_signature(&self, _view_length: u64) -> Option<ViewSignature> {
            None
        }
    }

    struct SinkConn {
        written: Vec<u8>,
        /// Max bytes accepted per write call; usize::MAX = unlimited.
        chunk: usize,
    }

    impl SinkConn {
        fn new() -> Self {
            Self { written: Vec::new(), chunk: usize::MAX }
        }

        fn drain_messages(&mut self) -> Vec<Message> {
            let mut codec = MessageCodec::new(PieceStyle::Plain, true, true);
            let mut buf = BytesMut::from(&self.written[..]);
            self.written.clear();
            let mut messages = Vec::new();
            while let Some(msg) = codec.decode(&mut buf).unwrap() {
                messages.push(msg);
            }
            messages
        }
    }

    impl Connection for SinkConn {
        fn remote_addr(&self) -> SocketAddr {
            "127.0.0.1:6881".parse().unwrap()
        }

        fn read(&mut self, _buf: &mut BytesMut) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn queue() -> OutboundQueue {
        OutboundQueue::new(
            TestStore::plain(32),
            Arc::new(Counter::new()),
            MessageCodec::new(PieceStyle::Plain, true, true),
        )
    }

    #[test]
    fn opposing_interest_cancels_unsent() {
        let mut q = queue();
        let mut conn = SinkConn::new();

        q.send_interested(true);
        q.send_interested(false);

        assert_eq!(q.send_data(&mut conn).unwrap(), 0);
        assert!(conn.written.is_empty());
    }

    #[test]
    fn interest_flips_after_flush_are_both_sent() {
        let mut q = queue();
        let mut conn = SinkConn::new();

        q.send_interested(true);
        q.send_data(&mut conn).unwrap();
        q.send_interested(false);
        q.send_data(&mut conn).unwrap();

        assert_eq!(
            conn.drain_messages(),
            vec![Message::Interested, Message::NotInterested]
        );
    }

    #[test]
    fn choke_discards_pieces_except_allowed_fast() {
        let mut q = queue();
        q.send_allowed_fast(&[2]);
        q.send_piece(BlockInfo::new(1, 0, 16384));
        q.send_piece(BlockInfo::new(2, 0, 16384));
        q.send_piece(BlockInfo::new(3, 0, 16384));

        let discarded = q.send_choke(true);

        assert_eq!(
            discarded,
            vec![BlockInfo::new(1, 0, 16384), BlockInfo::new(3, 0, 16384)]
        );
        assert_eq!(q.unsent_piece_count(), 1);
    }

    #[test]
    fn cancel_of_unsent_request_removes_it_silently() {
        let mut q = queue();
        let mut conn = SinkConn::new();
        let block = BlockInfo::new(0, 0, 16384);

        q.send_requests(vec![block]);
        q.cancel_request(&block, true);

        assert_eq!(q.send_data(&mut conn).unwrap(), 0);
        assert!(!q.has_outstanding_requests());
    }

    #[test]
    fn cancel_of_sent_request_emits_cancel() {
        let mut q = queue();
        let mut conn = SinkConn::new();
        let block = BlockInfo::new(0, 0, 16384);

        q.send_requests(vec![block]);
        q.send_data(&mut conn).unwrap();
        conn.drain_messages();

        // retained tracking still matches the eventual response
        q.cancel_request(&block, true);
        q.send_data(&mut conn).unwrap();

        assert_eq!(conn.drain_messages(), vec![Message::Cancel(block)]);
        assert!(q.request_received(&block));
    }

    #[test]
    fn cancel_without_retention_drops_tracking() {
        let mut q = queue();
        let mut conn = SinkConn::new();
        let block = BlockInfo::new(0, 0, 16384);

        q.send_requests(vec![block]);
        q.send_data(&mut conn).unwrap();
        q.cancel_request(&block, false);

        assert!(!q.request_received(&block));
    }

    #[test]
    fn requeue_restores_sent_requests_in_order() {
        let mut q = queue();
        let mut conn = SinkConn::new();
        let blocks: Vec<BlockInfo> =
            (0..3).map(|i| BlockInfo::new(i, 0, 16384)).collect();

        q.send_requests(blocks.clone());
        q.send_data(&mut conn).unwrap();
        conn.drain_messages();
        assert_eq!(q.requests_needed(), TARGET_REQUEST_QUEUE_LEN - 3);

        q.requeue_all_requests();
        assert_eq!(q.requests_needed(), TARGET_REQUEST_QUEUE_LEN - 3);

        q.send_data(&mut conn).unwrap();
        let resent: Vec<Message> =
            blocks.iter().map(|b| Message::Request(*b)).collect();
        assert_eq!(conn.drain_messages(), resent);
    }

    #[test]
    fn plugged_requests_stay_buffered() {
        let mut q = queue();
        let mut conn = SinkConn::new();

        q.send_requests(vec![BlockInfo::new(0, 0, 16384)]);
        q.set_requests_plugged(true);

        assert_eq!(q.send_data(&mut conn).unwrap(), 0);
        assert!(q.has_outstanding_requests());

        q.set_requests_plugged(false);
        q.send_data(&mut conn).unwrap();
        assert_eq!(
            conn.drain_messages(),
            vec![Message::Request(BlockInfo::new(0, 0, 16384))]
        );
    }

    #[test]
    fn plugged_allowed_fast_requests_flow() {
        let mut q = queue();
        let mut conn = SinkConn::new();

        q.set_requests_plugged(true);
        q.set_request_allowed_fast(5);
        q.send_requests(vec![
            BlockInfo::new(1, 0, 16384),
            BlockInfo::new(5, 0, 16384),
        ]);

        q.send_data(&mut conn).unwrap();

        assert_eq!(
            conn.drain_messages(),
            vec![Message::Request(BlockInfo::new(5, 0, 16384))]
        );
    }

    #[test]
    fn keepalives_coalesce_until_sent() {
        let mut q = queue();
        let mut conn = SinkConn::new();

        q.send_keepalive();
        q.send_keepalive();
        q.send_data(&mut conn).unwrap();
        assert_eq!(conn.drain_messages(), vec![Message::KeepAlive]);

        q.send_keepalive();
        q.send_data(&mut conn).unwrap();
        assert_eq!(conn.drain_messages(), vec![Message::KeepAlive]);
    }

    #[test]
    fn partial_writes_keep_a_cursor() {
        let mut q = queue();
        let mut conn = SinkConn::new();
        conn.chunk = 5;

        q.send_message(Message::Have(3));

        // 9 bytes total, 5 per call
        assert_eq!(q.send_data(&mut conn).unwrap(), 9);
        assert_eq!(conn.drain_messages(), vec![Message::Have(3)]);
    }

    #[test]
    fn reject_piece_purges_queued_blocks() {
        let mut q = queue();
        q.send_piece(BlockInfo::new(4, 0, 16384));
        q.send_piece(BlockInfo::new(4, 16384, 16384));
        q.send_piece(BlockInfo::new(5, 0, 16384));

        q.reject_piece(4);

        assert_eq!(q.unsent_piece_count(), 1);
        assert!(q.discard_piece(&BlockInfo::new(5, 0, 16384)));
    }

    #[test]
    fn control_messages_overtake_piece_payloads() {
        let mut q = queue();
        let mut conn = SinkConn::new();

        q.send_piece(BlockInfo::new(0, 0, 16384));
        q.send_message(Message::Have(1));

        q.send_data(&mut conn).unwrap();
        let msgs = conn.drain_messages();

        assert_eq!(msgs[0], Message::Have(1));
        assert!(matches!(msgs[1], Message::Piece(_)));
    }
}
