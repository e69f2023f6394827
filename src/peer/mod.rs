//! A remote peer and the engine that speaks the wire protocol with it.

pub mod allowed_fast;
mod outbound;
mod services;
mod state;
mod types;

pub use services::{Connection, PeerCoordinator};
pub use state::PeerState;
pub use types::PeerId;

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::{
    bitfield,
    counter::Counter,
    error::Error,
    extensions::ExtensionHandshake,
    peer::{outbound::OutboundQueue, services::CoordinatorLock},
    storage::{HashChain, PieceStore, PieceStyle, StorageLayout, ViewSignature},
    wire::{
        BlockInfo, ExtendedMessage, Message, MessageCodec, MessageId,
        PieceBlock, ALLOWED_FAST_THRESHOLD, EXTENSION_ELASTIC,
        EXTENSION_MERKLE, IDLE_INTERVAL_SECS, MAX_BLOCK_LEN,
    },
};

/// The protocol engine for one remote peer.
///
/// A session is created for a connected, handshake-complete byte channel and
/// mediates between that channel and the torrent's coordinator: inbound
/// bytes become typed messages and state transitions, coordinator decisions
/// become outbound messages. Sessions for different peers may run on
/// different threads; a single session is driven from one place at a time.
///
/// Every fatal condition, whether a protocol violation from the remote or an
/// I/O failure, funnels into [`PeerSession::close`], which reports the
/// disconnect to the coordinator exactly once.
pub struct PeerSession {
    services: Arc<dyn PeerCoordinator>,
    store: Arc<dyn PieceStore>,
    conn: Box<dyn Connection>,
    parser: MessageCodec,
    read_buf: BytesMut,
    outbound: OutboundQueue,
    state: PeerState,
    counter: Arc<Counter>,
    remote_addr: SocketAddr,
    disconnect_reported: bool,
}

impl PeerSession {
    /// Builds a session and queues the opening announcements: the piece
    /// inventory in the form the negotiated extensions call for, and the
    /// extension handshake when the piece style needs one. Nothing touches
    /// the wire until the connection signals writability.
    pub fn new(
        services: Arc<dyn PeerCoordinator>,
        store: Arc<dyn PieceStore>,
        conn: Box<dyn Connection>,
        remote_id: PeerId,
        fast_extension: bool,
        extension_protocol: bool,
    ) -> Result<Self, Error> {
        let info = store.info();
        let state = PeerState::new(
            remote_id,
            info.layout,
            fast_extension,
            extension_protocol,
        );
        let codec =
            MessageCodec::new(info.piece_style, fast_extension, extension_protocol);
        let counter = Arc::new(Counter::new());
        let outbound = OutboundQueue::new(
            store.clone(),
            counter.clone(),
            codec.clone(),
        );
        let remote_addr = conn.remote_addr();

        let mut session = Self {
            services,
            store,
            conn,
            parser: codec,
            read_buf: BytesMut::with_capacity(64 * 1024),
            outbound,
            state,
            counter,
            remote_addr,
            disconnect_reported: false,
        };

        session.announce_present_pieces()?;

        if session.state.extension_protocol {
            session.services.offer_extensions(&session.state.remote_id);
        }

        Ok(session)
    }

    pub fn state(&self) -> &PeerState {
        &self.state
    }

    pub fn counter(&self) -> &Counter {
        &self.counter
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Whether the remote has requested blocks we have not served yet.
    pub fn has_unsent_pieces(&self) -> bool {
        self.outbound.unsent_piece_count() > 0
    }

    pub fn has_outstanding_requests(&self) -> bool {
        self.outbound.has_outstanding_requests()
    }

    /* control surface for the coordinator */

    /// Changes our choke of the remote. Returns whether anything changed.
    /// Choking discards their unsent piece responses except allowed-fast
    /// ones; under the fast extension each discarded request is rejected
    /// explicitly.
    pub fn set_am_choking(&mut self, choking: bool) -> bool {
        if choking == self.state.am_choking {
            return false;
        }
        self.state.am_choking = choking;
        let discarded = self.outbound.send_choke(choking);
        if self.state.fast_extension {
            self.outbound.send_rejects(&discarded);
        }
        true
    }

    /// Changes our interest in the remote and tells them if it moved.
    pub fn set_am_interested(&mut self, interested: bool) {
        if interested != self.state.am_interested {
            self.state.am_interested = interested;
            self.outbound.send_interested(interested);
        }
    }

    /// Cancels in-flight requests. Under the fast extension the tracking
    /// entries are kept so that the remote's piece or reject still matches.
    pub fn cancel_requests(&mut self, requests: &[BlockInfo]) {
        for block in requests {
            self.outbound.cancel_request(block, self.state.fast_extension);
        }
    }

    /// A piece left our store; stop serving queued blocks of it.
    pub fn reject_piece(&mut self, piece: u32) {
        self.outbound.reject_piece(piece);
    }

    pub fn send_have_piece(&mut self, piece: u32) {
        self.outbound.send_message(Message::Have(piece));
    }

    /// Keepalive tick: closes the session if the remote has been silent past
    /// the idle interval, otherwise queues a keepalive.
    pub fn send_keepalive_or_close(&mut self) {
        let idle = Duration::from_secs(IDLE_INTERVAL_SECS);
        if self.state.last_data_received.elapsed() > idle {
            debug!("{} idle for more than {idle:?}", self.remote_addr);
            self.close();
        } else {
            self.outbound.send_keepalive();
        }
    }

    pub fn send_view_signature(&mut self, signature: ViewSignature) {
        self.outbound.send_message(Message::ElasticSignature(signature));
    }

    pub fn send_extension_handshake(
        &mut self,
        handshake: &ExtensionHandshake,
    ) -> Result<(), Error> {
        let payload = handshake.to_bytes()?;
        self.outbound
            .send_message(Message::Extended(ExtendedMessage(0, payload)));
        Ok(())
    }

    pub fn send_extension_message(&mut self, id: u8, payload: Vec<u8>) {
        self.outbound
            .send_message(Message::Extended(ExtendedMessage(id, payload)));
    }

    /// Closes the connection and reports the disconnect. Idempotent: the
    /// coordinator hears about it at most once, and close errors are only
    /// logged.
    pub fn close(&mut self) {
        if let Err(e) = self.conn.close() {
            debug!("{} error closing connection: {e}", self.remote_addr);
        }
        if !self.disconnect_reported {
            self.disconnect_reported = true;
            self.services.peer_disconnected(&self.state.remote_id);
        }
    }

    /* connection driver */

    /// Entry point from the connection multiplexer. Drains inbound bytes
    /// through the tokeniser, tops up the request pipeline, then pushes
    /// queued outbound bytes. The whole cycle runs under the coordinator
    /// lock so coordinator callbacks cannot interleave with another thread.
    pub fn connection_ready(&mut self, readable: bool, writable: bool) {
        let services = self.services.clone();
        let _lock = CoordinatorLock::acquire(&*services);

        if let Err(e) = self.ready_cycle(readable, writable) {
            warn!("{} closing session: {e}", self.remote_addr);
            self.close();
        }
    }

    fn ready_cycle(
        &mut self,
        readable: bool,
        writable: bool,
    ) -> Result<(), Error> {
        if readable {
            let drained = self.drain_inbound()?;
            if drained > 0 {
                self.counter.record_protocol_download(drained as u64);
                self.state.last_data_received = Instant::now();
            }
        }

        // handlers defer new requests to this point so the coordinator is
        // not re-entered mid-message; a write-only wakeup still tops up
        // because an earlier choke flip may have freed pipeline slots
        if self.state.am_interested {
            self.fill_request_queue();
        }

        if writable {
            let written = self.outbound.send_data(self.conn.as_mut())?;
            if written > 0 {
                self.counter.record_protocol_upload(written as u64);
            }
        }

        Ok(())
    }

    fn drain_inbound(&mut self) -> Result<usize, Error> {
        let mut total = 0;
        loop {
            let n = self.conn.read(&mut self.read_buf)?;
            if n == 0 {
                break;
            }
            total += n;
            while let Some(msg) = self.parser.decode(&mut self.read_buf)? {
                self.handle_message(msg)?;
            }
        }
        Ok(total)
    }

    /// Asks the coordinator for enough requests to fill the pipeline. When
    /// it has nothing for us and nothing is pending, our interest is spent:
    /// tell the remote.
    fn fill_request_queue(&mut self) {
        let needed = self.outbound.requests_needed();
        if needed == 0 {
            return;
        }

        let requests = self.services.allocate_requests(
            &self.state.remote_id,
            needed,
            self.state.peer_choking,
        );

        if !requests.is_empty() {
            self.outbound.send_requests(requests);
        } else if !self.state.peer_choking
            && !self.outbound.has_outstanding_requests()
        {
            self.state.am_interested = false;
            self.outbound.send_interested(false);
        }
    }

    /* inbound policy handlers */

    fn handle_message(&mut self, msg: Message) -> Result<(), Error> {
        let remote = self.remote_addr;
        match msg {
            // the idle timer is fed at the byte-drain level, so a keepalive
            // needs no handling of its own
            Message::KeepAlive => {}
            Message::Choke => self.handle_choke(true),
            Message::Unchoke => self.handle_choke(false),
            Message::Interested => self.handle_interested(true),
            Message::NotInterested => self.handle_interested(false),
            Message::Have(piece) => self.handle_have(piece)?,
            Message::Bitfield(bytes) => self.handle_bitfield(&bytes)?,
            Message::Request(block) => self.handle_request(block)?,
            Message::Piece(piece) => self.handle_piece(piece)?,
            Message::Cancel(block) => self.handle_cancel(block)?,
            Message::SuggestPiece(piece) => self.handle_suggest(piece)?,
            Message::HaveAll => self.handle_have_all(),
            Message::HaveNone => self.handle_have_none(),
            Message::Reject(block) => self.handle_reject(block)?,
            Message::AllowedFast(piece) => self.handle_allowed_fast(piece)?,
            Message::Extended(ext) => self.handle_extended(ext)?,
            Message::ElasticSignature(sig) => {
                self.handle_elastic_signature(sig)?
            }
            Message::ElasticBitfield(bytes) => self.handle_bitfield(&bytes)?,
            Message::Unknown(id, _) => {
                debug!("{remote} ignoring unknown message id {id}");
            }
        }
        Ok(())
    }

    fn handle_choke(&mut self, choked: bool) {
        debug!("{} {}", self.remote_addr, if choked { "choke" } else { "unchoke" });
        self.state.peer_choking = choked;
        self.outbound.set_requests_plugged(choked);

        // the base protocol drops outstanding requests on choke; the fast
        // extension keeps them pending an explicit reject
        if choked && !self.state.fast_extension {
            self.outbound.requeue_all_requests();
        }
    }

    fn handle_interested(&mut self, interested: bool) {
        debug!("{} interested={interested}", self.remote_addr);
        self.state.peer_interested = interested;
        self.services.adjust_choking(self.state.am_choking);
    }

    fn handle_have(&mut self, piece: u32) -> Result<(), Error> {
        if piece as usize >= self.state.remote_pieces.len() {
            return Err(Error::PieceOutOfRange(piece));
        }

        if !self.state.remote_pieces[piece as usize] {
            self.state.remote_pieces.set(piece as usize, true);
            if self.services.add_available_piece(&self.state.remote_id, piece)
                && !self.state.am_interested
            {
                self.state.am_interested = true;
                self.outbound.send_interested(true);
            }
        }

        // once the remote stops being piece-poor our grants lose their
        // purpose
        if self.state.remote_pieces.count_ones() as u32
            == ALLOWED_FAST_THRESHOLD
        {
            self.outbound.clear_allowed_fast_pieces();
        }

        Ok(())
    }

    fn handle_bitfield(&mut self, bytes: &[u8]) -> Result<(), Error> {
        let num_pieces = self.state.remote_view.num_pieces();
        self.state.remote_pieces = bitfield::from_wire(bytes, num_pieces)?;
        debug!(
            "{} bitfield with {} pieces",
            self.remote_addr,
            self.state.remote_pieces.count_ones()
        );

        if self
            .services
            .add_available_pieces(&self.state.remote_id, &self.state.remote_pieces)
        {
            self.state.am_interested = true;
            self.outbound.send_interested(true);
        }

        if self.state.fast_extension
            && self.store.info().piece_style != PieceStyle::Elastic
            && (self.state.remote_pieces.count_ones() as u32)
                < ALLOWED_FAST_THRESHOLD
        {
            self.generate_and_send_allowed_fast();
        }

        Ok(())
    }

    fn handle_request(&mut self, block: BlockInfo) -> Result<(), Error> {
        self.validate_block(&block)?;

        if self.store.have_piece(block.index) {
            if !self.state.am_choking {
                self.outbound.send_piece(block);
            } else if self.state.fast_extension {
                if self.outbound.is_piece_allowed_fast(block.index) {
                    self.outbound.send_piece(block);
                } else {
                    self.outbound.send_reject(block);
                }
            }
            // choked under the base protocol: the remote is out of line,
            // but there is no message to say so
        } else if self.state.fast_extension {
            self.outbound.send_reject(block);
        } else {
            return Err(Error::PieceNotPresent(block.index));
        }

        Ok(())
    }

    fn handle_piece(&mut self, piece: PieceBlock) -> Result<(), Error> {
        let style = self.store.info().piece_style;
        if piece.style != style {
            return Err(Error::PieceStyleMismatch {
                expected: style,
                received: piece.style,
            });
        }

        self.validate_block(&piece.block)?;

        if style == PieceStyle::Elastic {
            if let (Some(view_length), Some(_)) =
                (piece.view_length, piece.hashes.as_ref())
            {
                if !self
                    .state
                    .remote_view_signatures
                    .contains_key(&view_length)
                    && self.store.info().layout.length() != view_length
                {
                    return Err(Error::UnknownViewLength(view_length));
                }
            }
        }

        if self.outbound.request_received(&piece.block) {
            self.counter.record_block_download(piece.block.len as u64);

            let (view_signature, hash_chain) = match style {
                PieceStyle::Plain => (None, None),
                PieceStyle::Merkle => (
                    None,
                    piece.hashes.map(|hashes| {
                        HashChain::new(self.store.layout().length(), hashes)
                    }),
                ),
                PieceStyle::Elastic => {
                    match (piece.view_length, piece.hashes) {
                        (Some(view_length), Some(hashes)) => (
                            self.state
                                .remote_view_signatures
                                .get(&view_length)
                                .cloned(),
                            Some(HashChain::new(view_length, hashes)),
                        ),
                        _ => (None, None),
                    }
                }
            };

            self.services.handle_block(
                &self.state.remote_id,
                piece.block,
                view_signature,
                hash_chain,
                &piece.data,
            );
        } else if self.state.fast_extension {
            return Err(Error::UnrequestedPiece(piece.block));
        } else {
            // spam, or a request we cancelled; the base protocol cannot
            // tell the difference
            debug!("{} dropping unmatched {}", self.remote_addr, piece.block);
        }

        Ok(())
    }

    fn handle_cancel(&mut self, block: BlockInfo) -> Result<(), Error> {
        self.validate_block(&block)?;

        let removed = self.outbound.discard_piece(&block);
        if self.state.fast_extension && removed {
            self.outbound.send_reject(block);
        }

        Ok(())
    }

    fn handle_suggest(&mut self, piece: u32) -> Result<(), Error> {
        if piece >= self.store.layout().num_pieces() {
            return Err(Error::PieceOutOfRange(piece));
        }

        // a suggestion for a piece the remote doesn't hold is pointless;
        // drop it
        if self
            .state
            .remote_pieces
            .get(piece as usize)
            .is_some_and(|bit| *bit)
        {
            self.services.set_piece_suggested(&self.state.remote_id, piece);
        }

        Ok(())
    }

    fn handle_have_all(&mut self) {
        debug!("{} have all", self.remote_addr);
        let num_pieces = self.state.remote_pieces.len() as u32;
        self.state.remote_pieces = bitfield::full(num_pieces);

        if self
            .services
            .add_available_pieces(&self.state.remote_id, &self.state.remote_pieces)
        {
            self.state.am_interested = true;
            self.outbound.send_interested(true);
        }
    }

    fn handle_have_none(&mut self) {
        debug!("{} have none", self.remote_addr);
        // the remote bitfield starts all zero, nothing to update

        if self.store.info().piece_style != PieceStyle::Elastic {
            self.generate_and_send_allowed_fast();
        }
    }

    fn handle_reject(&mut self, block: BlockInfo) -> Result<(), Error> {
        if !self.outbound.reject_received(&block) {
            return Err(Error::UnrequestedReject(block));
        }
        Ok(())
    }

    fn handle_allowed_fast(&mut self, piece: u32) -> Result<(), Error> {
        if piece as usize >= self.state.remote_pieces.len() {
            return Err(Error::PieceOutOfRange(piece));
        }

        // grants for pieces the remote doesn't hold are explicitly legal
        // and explicitly useless
        if self.state.remote_pieces[piece as usize] {
            self.services.set_piece_allowed_fast(&self.state.remote_id, piece);
            self.outbound.set_request_allowed_fast(piece);
        }

        Ok(())
    }

    fn handle_extended(&mut self, msg: ExtendedMessage) -> Result<(), Error> {
        let ExtendedMessage(id, payload) = msg;

        if id == 0 {
            let handshake = ExtensionHandshake::from_bytes(&payload)?;
            let added: Vec<String> =
                handshake.added().map(Into::into).collect();
            let removed: Vec<String> =
                handshake.removed().map(Into::into).collect();

            for name in &added {
                self.state.remote_extensions.insert(name.clone());
            }
            for name in &removed {
                self.state.remote_extensions.remove(name.as_str());
            }

            self.services.enable_disable_extensions(
                &self.state.remote_id,
                &added,
                &removed,
                &handshake,
            );
        } else {
            self.services.process_extension_message(
                &self.state.remote_id,
                id,
                &payload,
            );
        }

        Ok(())
    }

    fn handle_elastic_signature(
        &mut self,
        signature: ViewSignature,
    ) -> Result<(), Error> {
        if signature.view_length > self.state.remote_view.length() {
            self.state.remote_view = StorageLayout::new(
                self.state.remote_view.piece_size(),
                signature.view_length,
            );
        }

        let piece_size = self.store.layout().piece_size() as u64;
        let view_pieces =
            signature.view_length.div_ceil(piece_size) as usize;
        if view_pieces > self.state.remote_pieces.len() {
            self.state.remote_pieces.resize(view_pieces, false);
        }

        if !self.services.handle_view_signature(&signature) {
            return Err(Error::SignatureRejected);
        }

        if self.state.remote_view_signatures.len() > 1 {
            self.state.remote_view_signatures.pop_first();
        }
        self.state
            .remote_view_signatures
            .insert(signature.view_length, signature);

        Ok(())
    }

    /* helpers */

    /// A block is acceptable if it addresses a real region of the current
    /// layout and stays within the maximum request size.
    fn validate_block(&self, block: &BlockInfo) -> Result<(), Error> {
        let layout = self.store.layout();
        let valid = block.index < layout.num_pieces()
            && block.len > 0
            && block.len <= MAX_BLOCK_LEN
            && block.begin as u64 + block.len as u64
                <= layout.piece_len(block.index) as u64;

        if valid {
            Ok(())
        } else {
            Err(Error::InvalidBlock(*block))
        }
    }

    fn generate_and_send_allowed_fast(&mut self) {
        let pieces = allowed_fast::allowed_fast_set(
            self.remote_addr.ip(),
            &self.store.info().info_hash,
            self.store.layout().num_pieces(),
            ALLOWED_FAST_THRESHOLD as usize,
        );

        if !pieces.is_empty() {
            debug!(
                "{} granting {} allowed fast pieces",
                self.remote_addr,
                pieces.len()
            );
            self.outbound.send_allowed_fast(&pieces);
        }
    }

    /// Queues the opening announcements in the order the remote expects
    /// them.
    fn announce_present_pieces(&mut self) -> Result<(), Error> {
        let present = self.store.present_pieces();
        let style = self.store.info().piece_style;

        match style {
            PieceStyle::Elastic => {
                self.outbound.send_message(Message::HaveNone);
            }
            _ if self.state.fast_extension => {
                let count = present.count_ones() as u32;
                if count == 0 {
                    self.outbound.send_message(Message::HaveNone);
                } else if count == self.store.layout().num_pieces() {
                    self.outbound.send_message(Message::HaveAll);
                } else {
                    self.outbound.send_message(Message::bitfield(&present));
                }
            }
            _ => {
                if present.any() {
                    self.outbound.send_message(Message::bitfield(&present));
                }
            }
        }

        match style {
            PieceStyle::Elastic => {
                let handshake = ExtensionHandshake::new(
                    [(EXTENSION_ELASTIC.to_owned(), MessageId::Elastic as u8)],
                    [],
                );
                self.outbound.send_message(Message::Extended(
                    ExtendedMessage(0, handshake.to_bytes()?),
                ));

                let current = self.store.layout();
                if current.length() > self.store.info().layout.length() {
                    if let Some(signature) =
                        self.store.view_signature(current.length())
                    {
                        self.outbound
                            .send_message(Message::ElasticSignature(signature));
                    }
                }

                self.outbound
                    .send_message(Message::elastic_bitfield(&present));
            }
            PieceStyle::Merkle => {
                let handshake = ExtensionHandshake::new(
                    [(EXTENSION_MERKLE.to_owned(), MessageId::Piece as u8)],
                    [],
                );
                self.outbound.send_message(Message::Extended(
                    ExtendedMessage(0, handshake.to_bytes()?),
                ));
            }
            PieceStyle::Plain => {}
        }

        Ok(())
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}
