mod codec;

use {
    futures::{
        select,
        stream::{Fuse, SplitSink},
        SinkExt, StreamExt,
    },
    std::{net::SocketAddr, sync::Arc},
    tokio::{
        net::TcpStream,
        sync::{
            mpsc::{self, UnboundedReceiver, UnboundedSender},
            RwLock,
        },
        time,
    },
    tokio_util::codec::{Framed, FramedParts},
};

use {
    crate::{
        assembler::{BlockOutcome, PieceAssembler, PieceCompletion},
        counter::TorrentCounters,
        disk::DiskHandle,
        download::PieceDownload,
        error::*,
        piece_picker::PiecePicker,
        torrent::{SharedStatus, TorrentEvent},
        Bitfield, BlockInfo, PeerId,
    },
    codec::*,
};

pub(crate) struct PeerSession {
    /// Shared information of the torrent.
    torrent: Arc<SharedStatus>,
    /// The piece picker picks the next most optimal piece to download and is
    /// shared by other entities in the same torrent.
    piece_picker: Arc<RwLock<PiecePicker>>,
    /// The block assembler and verifier, shared by other entities in the
    /// same torrent.
    assembler: Arc<RwLock<PieceAssembler>>,
    /// Per-torrent progress counters, shared by other entities in the same
    /// torrent.
    counters: Arc<TorrentCounters>,
    /// The entity used to save downloaded and verified pieces to disk.
    disk: DiskHandle,
    /// The channel on which the torrent controller is notified of this
    /// session's lifecycle and download events.
    events: UnboundedSender<TorrentEvent>,
    /// The port on which peer session receives commands.
    cmd_port: Fuse<Receiver>,
    /// The remote address of the peer.
    addr: SocketAddr,
    /// Session related information.
    status: Status,
    /// The piece this session is currently downloading, one block at a
    /// time. At most one piece is ever in flight per session: the
    /// cratetorrent pipeline this is derived from keeps several in flight
    /// to saturate bandwidth, but that throughput optimization is out of
    /// scope here.
    in_flight: Option<PieceDownload>,
    /// The single outstanding block request sent to peer, if any. Cleared
    /// when peer is choked, since in that case we don't expect outstanding
    /// requests to be served.
    outgoing_request: Option<BlockInfo>,
    /// Information about a peer that is set after a successful handshake.
    peer_info: Option<PeerInfo>,
}

impl PeerSession {
    /// Creates a new outbound session with the peer at the given address.
    ///
    /// The peer needs to be a seed in order for us to download a file through
    /// this peer session, otherwise the session is aborted with an error.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_picker: Arc<RwLock<PiecePicker>>,
        assembler: Arc<RwLock<PieceAssembler>>,
        counters: Arc<TorrentCounters>,
        disk: DiskHandle,
        events: UnboundedSender<TorrentEvent>,
        addr: SocketAddr,
    ) -> (Self, Sender) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_picker,
                assembler,
                counters,
                disk,
                events,
                cmd_port: cmd_port.fuse(),
                addr,
                status: Status::default(),
                in_flight: None,
                outgoing_request: None,
                peer_info: None,
            },
            cmd_chan,
        )
    }

    /// Starts the peer session and returns once the connection is closed or
    /// an error occurs.
    ///
    /// Regardless of how the session ends, the torrent controller is
    /// notified via [`TorrentEvent::PeerStopped`] and any piece this
    /// session had claimed is released back to the picker, so another
    /// session can pick up where this one left off.
    pub async fn start(&mut self) -> Result<()> {
        let result = self.run_to_completion().await;
        if let Err(e) = &result {
            log::info!("Peer {} session ended: {}", self.addr, e);
        }
        self.release_in_flight_claim().await;
        if self
            .events
            .send(TorrentEvent::PeerStopped { addr: self.addr })
            .is_err()
        {
            log::warn!(
                "Peer {} could not notify torrent of session end",
                self.addr
            );
        }
        result
    }

    /// Releases this session's claim on its in-flight piece, if any, so
    /// that the piece becomes available for another session to pick up.
    async fn release_in_flight_claim(&mut self) {
        if let Some(download) = self.in_flight.take() {
            log::debug!(
                "Peer {} releasing claim on piece {}",
                self.addr,
                download.piece_index()
            );
            self.piece_picker
                .write()
                .await
                .release_claim(download.piece_index(), self.addr);
        }
    }

    /// Drives the connection from handshake through to the main message
    /// loop.
    async fn run_to_completion(&mut self) -> Result<()> {
        log::info!("Starting peer {} session", self.addr);

        log::info!("Connecting to peer {}", self.addr);
        self.status.state = State::Connecting;
        let socket =
            time::timeout(self.torrent.conf.torrent.connect_timeout, TcpStream::connect(self.addr))
                .await
                .map_err(|_| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "connect timed out",
                    ))
                })??;
        log::info!("Connected to peer {}", self.addr);

        let mut socket = Framed::new(socket, HandshakeCodec);

        // this is an outbound connection, so we have to send the first
        // handshake
        self.status.state = State::Handshaking;
        let handshake =
            Handshake::new(self.torrent.info_hash, self.torrent.client_id);
        log::info!("Sending handshake to peer {}", self.addr);
        socket.send(handshake).await?;

        // receive peer's handshake
        log::info!("Waiting for peer {} handshake", self.addr);
        if let Some(peer_handshake) = socket.next().await {
            let peer_handshake = peer_handshake?;
            log::info!("Received handshake from peer {}", self.addr);
            log::debug!("Peer {} handshake: {:?}", self.addr, peer_handshake);
            // codec should only return handshake if the protocol string in it
            // is valid
            debug_assert_eq!(peer_handshake.prot, PROTOCOL_STRING.as_bytes());

            // verify that the advertised torrent info hash is the same as ours
            if peer_handshake.info_hash != self.torrent.info_hash {
                log::info!("Peer {} handshake invalid info hash", self.addr);
                // abort session, info hash is invalid
                return Err(Error::InvalidPeerInfoHash);
            }

            // set basic peer information
            self.peer_info = Some(PeerInfo {
                peer_id: peer_handshake.peer_id,
                pieces: None,
            });

            // now that we have the handshake, we need to switch to the peer
            // message codec and save the socket in self (note that we need to
            // keep the buffer from the original codec as it may contain bytes
            // of any potential message the peer may have sent after the
            // handshake)
            let old_parts = socket.into_parts();
            let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
            // reuse buffers of previous codec
            new_parts.read_buf = old_parts.read_buf;
            new_parts.write_buf = old_parts.write_buf;
            let socket = Framed::from_parts(new_parts);

            // enter the piece availability exchange state until peer sends a
            // bitfield (we don't send one as we currently only implement
            // downloading so we cannot have piece availability until multiple
            // peer connections or resuming a torrent is implemented)
            self.status.state = State::AvailabilityExchange;
            log::info!(
                "Peer {} session state: {:?}",
                self.addr,
                self.status.state
            );

            // run the session
            self.run(socket).await?;
        } else {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "peer closed connection before sending handshake",
            )));
        }

        Ok(())
    }

    /// Runs the session after connection to peer is established.
    ///
    /// This is the main session "loop" and performs the core of the session
    /// logic: exchange of messages, timeout logic, etc.
    async fn run(
        &mut self,
        socket: Framed<TcpStream, PeerCodec>,
    ) -> Result<()> {
        // split the sink and stream so that we can pass the sink while holding
        // a reference to the stream in the loop
        let (mut sink, stream) = socket.split();
        let mut stream = stream.fuse();

        // start the loop for receiving messages from peer and commands from
        // other parts of the engine
        loop {
            select! {
                msg = stream.select_next_some() => {
                    let msg = msg?;
                    log::debug!(
                        "Received message {} from peer {:?}",
                        self.addr,
                        msg.id()
                    );

                    // handle bitfield message separately as it may only be
                    // received directly after the handshake (later once we
                    // implement the FAST extension, there will be other piece
                    // availability related messages to handle)
                    if self.status.state == State::AvailabilityExchange {
                        if let Message::Bitfield(bitfield) = msg {
                            self.handle_bitfield_msg(&mut sink, bitfield).await?;
                        } else {
                            // since we expect peer to be a seed, we *must* get
                            // a bitfield message, as otherwise we assume the
                            // peer to be a leech with no pieces to share (which
                            // is not good for our purposes of downloading
                            // a file)
                            log::warn!(
                                "Peer {} hasn't sent bitfield, cannot download",
                                self.addr
                            );
                            return Err(Error::PeerNotSeed);
                        }

                        // enter connected state
                        self.status.state = State::Connected;
                        log::info!(
                            "Peer {} session state: {:?}",
                            self.addr,
                            self.status.state
                        );
                    } else {
                        self.handle_msg(&mut sink, msg).await?;
                    }
                }
                cmd = self.cmd_port.select_next_some() => {
                    match cmd {
                        Command::Shutdown => {
                            log::info!("Shutting down peer {} session", self.addr);
                            break;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Handles a message expected in the `AvailabilityExchange` state
    /// (currently only the bitfield message).
    async fn handle_bitfield_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        mut bitfield: Bitfield,
    ) -> Result<()> {
        debug_assert_eq!(self.status.state, State::AvailabilityExchange);
        log::info!("Handling peer {} Bitfield message", self.addr);
        log::trace!("Bitfield: {:?}", bitfield);

        // The bitfield raw data that is sent over the wire may be longer than
        // the logical pieces it represents, if there the number of pieces in
        // torrent is not a multiple of 8. Therefore, we need to slice off the
        // last part of the bitfield.
        bitfield.resize(self.torrent.storage.piece_count, false);

        // if peer is not a seed, we abort the connection as we only
        // support downloading and for that we must be connected to
        // a seed (otherwise we couldn't download the whole torrent)
        if !bitfield.all() {
            log::warn!("Peer {} is not a seed, cannot download", self.addr);
            return Err(Error::PeerNotSeed);
        }

        // register peer's pieces with piece picker
        let is_interested = self
            .piece_picker
            .write()
            .await
            .register_availability(&bitfield)?;
        self.status.is_interested = is_interested;
        if let Some(peer_info) = &mut self.peer_info {
            peer_info.pieces = Some(bitfield);
        }

        // send interested message to peer
        log::info!("Interested in peer {}", self.addr);
        sink.send(Message::Interested).await?;

        Ok(())
    }

    /// Handles messages expected in the `Connected` state.
    async fn handle_msg(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
        msg: Message,
    ) -> Result<()> {
        match msg {
            Message::Bitfield(_) => {
                log::info!(
                    "Peer {} sent bitfield message not after handshake",
                    self.addr
                );
                return Err(Error::BitfieldNotAfterHandshake);
            }
            Message::KeepAlive => {
                log::info!("Peer {} sent keep alive", self.addr);
            }
            Message::Choke => {
                if !self.status.is_choked {
                    log::info!("Peer {} choked us", self.addr);
                    // since we're choked we don't expect to receive a reply
                    // to our pending request; it'll be re-requested once
                    // we're unchoked again, since the download's next
                    // offset hasn't advanced
                    self.outgoing_request = None;
                    self.status.is_choked = true;
                }
            }
            Message::Unchoke => {
                if self.status.is_choked {
                    log::info!("Peer {} unchoked us", self.addr);
                    self.status.is_choked = false;
                    // now that we are allowed to request blocks again,
                    // resume driving the download
                    self.make_requests(sink).await?;
                }
            }
            Message::Interested => {
                if !self.status.is_peer_interested {
                    log::info!("Peer {} is interested", self.addr);
                    self.status.is_peer_interested = true;
                }
            }
            Message::NotInterested => {
                if self.status.is_peer_interested {
                    log::info!("Peer {} is not interested", self.addr);
                    self.status.is_peer_interested = false;
                }
            }
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let block_info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.handle_block_msg(block_info, data).await?;

                // we may be able to request the next block now
                self.make_requests(sink).await?;
            }
            // these messages are not expected until seed functionality is
            // added; tolerated but otherwise ignored
            Message::Have { .. } => {
                log::warn!(
                    "Seed {} sent unexpected message: {:?}",
                    self.addr,
                    MessageId::Have
                );
            }
            Message::Request(_) => {
                log::warn!(
                    "Seed {} sent unexpected message: {:?}",
                    self.addr,
                    MessageId::Request
                );
            }
            Message::Cancel(_) => {
                log::warn!(
                    "Seed {} sent unexpected message: {:?}",
                    self.addr,
                    MessageId::Cancel
                );
            }
            Message::Port(port) => {
                // the DHT isn't implemented, so the announced port is
                // tolerated but otherwise has no effect
                log::debug!("Peer {} announced DHT port {}", self.addr, port);
            }
        }

        Ok(())
    }

    /// Drives this session's single-piece, single-outstanding-request
    /// download: if nothing is currently in flight, claims a new piece from
    /// the picker; if a piece is in flight and no request is outstanding,
    /// requests its next block. If the picker has no piece left to claim
    /// from this peer, the session disconnects: there's nothing further
    /// for it to do.
    ///
    /// A request is never sent while we're choked, as per the race
    /// suppression rule: if we were unchoked and then choked again before
    /// this runs, the stale unchoke that triggered it no longer applies.
    async fn make_requests(
        &mut self,
        sink: &mut SplitSink<Framed<TcpStream, PeerCodec>, Message>,
    ) -> Result<()> {
        if self.status.is_choked {
            return Ok(());
        }
        if self.outgoing_request.is_some() {
            // still waiting for the reply to our one outstanding request
            return Ok(());
        }

        if self.in_flight.is_none() {
            let peer_has = match self
                .peer_info
                .as_ref()
                .and_then(|info| info.pieces.as_ref())
            {
                Some(bitfield) => bitfield.clone(),
                None => return Ok(()),
            };

            let picked = self
                .piece_picker
                .write()
                .await
                .pick_piece(&peer_has, self.addr);
            if let Some(index) = picked {
                log::info!("Peer {} picked piece {}", self.addr, index);
                let piece_len = self.torrent.storage.piece_len(index)?;
                let block_len = self.torrent.conf.torrent.block_len;
                self.in_flight =
                    Some(PieceDownload::new(index, piece_len, block_len));
            } else {
                // nothing left this peer has that we don't, or everything
                // it has is already claimed by another session: there's no
                // more work for this session to do, so it disconnects and
                // lets the torrent controller reap it
                log::info!(
                    "No piece left to pick from peer {}, disconnecting",
                    self.addr
                );
                return Err(Error::NoPieceToDownload);
            }
        }

        let download = self
            .in_flight
            .as_ref()
            .expect("in_flight must be set by now");
        if let Some(block) = download.next_request() {
            log::debug!("Peer {} requesting block {:?}", self.addr, block);
            sink.send(Message::Request(block)).await?;
            self.outgoing_request = Some(block);
        }

        Ok(())
    }

    /// Hands a received block to the assembler, advances the in-flight
    /// download, and reacts to piece completion (valid or not).
    async fn handle_block_msg(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<()> {
        log::info!("Received block from peer {}: {:?}", self.addr, block_info);

        if self.outgoing_request != Some(block_info) {
            log::warn!(
                "Peer {} sent block we didn't request: {:?}",
                self.addr,
                block_info,
            );
            return Ok(());
        }
        self.outgoing_request = None;
        self.counters.downloaded_bytes.add(block_info.len as u64);

        let download = match &mut self.in_flight {
            Some(d) => d,
            None => {
                // shouldn't happen: a request can only be outstanding while
                // a piece is in flight
                log::warn!(
                    "Peer {} received block with no piece in flight",
                    self.addr
                );
                return Ok(());
            }
        };
        debug_assert_eq!(download.piece_index(), block_info.piece_index);
        download.advance(block_info.offset);

        let outcome = self.assembler.write().await.add_block(
            block_info.piece_index,
            block_info.offset,
            data,
        );

        match outcome {
            BlockOutcome::AlreadyComplete => {
                // another session already completed this piece; drop it and
                // move on to a new one
                self.in_flight = None;
            }
            BlockOutcome::Duplicate | BlockOutcome::Accepted => {
                // keep driving the same piece
            }
            BlockOutcome::Completed(PieceCompletion::Valid(bytes)) => {
                log::info!(
                    "Piece {} complete and valid via peer {}",
                    block_info.piece_index,
                    self.addr
                );
                self.piece_picker
                    .write()
                    .await
                    .received_piece(block_info.piece_index);
                self.disk.write_piece(
                    self.torrent.id,
                    block_info.piece_index,
                    bytes,
                )?;
                if self
                    .events
                    .send(TorrentEvent::PieceVerified(block_info.piece_index))
                    .is_err()
                {
                    log::warn!(
                        "Peer {} could not notify torrent of piece completion",
                        self.addr
                    );
                }
                self.in_flight = None;
            }
            BlockOutcome::Completed(PieceCompletion::Invalid) => {
                log::warn!(
                    "Piece {} failed hash verification via peer {}",
                    block_info.piece_index,
                    self.addr
                );
                self.piece_picker
                    .write()
                    .await
                    .clear_claims(block_info.piece_index);
                self.in_flight = None;
            }
        }

        Ok(())
    }
}

/// The channel on which torrent can send a command to the peer session task.
pub(crate) type Sender = UnboundedSender<Command>;
type Receiver = UnboundedReceiver<Command>;

/// The commands peer session can receive.
pub(crate) enum Command {
    /// Eventually shut down the peer session.
    Shutdown,
}

/// The status of a peer session.
///
/// By default, both sides of the connection start off as choked and not
/// interested in the other.
#[derive(Clone, Copy, Debug)]
struct Status {
    /// The current state of the session.
    state: State,
    /// If we're choked, peer doesn't allow us to download pieces from them.
    is_choked: bool,
    /// If we're interested, peer has pieces that we don't have.
    is_interested: bool,
    /// If peer is choked, we don't allow them to download pieces from us.
    is_peer_choked: bool,
    /// If peer is interested in us, they mean to download pieces that we have.
    is_peer_interested: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            state: State::default(),
            is_choked: true,
            is_interested: false,
            is_peer_choked: true,
            is_peer_interested: false,
        }
    }
}

/// At any given time, a connection with a peer is in one of the below states.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum State {
    /// The peer connection has not yet been connected or it had been connected
    /// before but has been stopped.
    Disconnected,
    /// The state during which the TCP connection is established.
    Connecting,
    /// The state after establishing the TCP connection and exchanging the
    /// initial BitTorrent handshake.
    Handshaking,
    /// This state is optional, it is used to verify that the bitfield exchange
    /// occurrs after the handshake and not later. It is set once the handshakes
    /// are exchanged and changed as soon as we receive the bitfield or the the
    /// first message that is not a bitfield. Any subsequent bitfield messages
    /// are rejected and the connection is dropped, as per the standard.
    AvailabilityExchange,
    /// This is the normal state of a peer session, in which any messages, apart
    /// from the 'handshake' and 'bitfield', may be exchanged.
    Connected,
}

/// The default (and initial) state of a peer session is `Disconnected`.
impl Default for State {
    fn default() -> Self {
        Self::Disconnected
    }
}

/// Information about the peer we're connected to.
struct PeerInfo {
    /// Peer's 20 byte BitTorrent id.
    peer_id: PeerId,
    /// All pieces peer has, updated when it announces to us a new piece.
    pieces: Option<Bitfield>,
}
