//! The torrent controller.
//!
//! Owns everything that's shared across a torrent's peer sessions (piece
//! picker, block assembler, progress counters), drives the tracker announce
//! cadence, and manages the set of connected and standby peers: spawning
//! new sessions up to the configured ceiling, reaping ones that stop, and
//! backfilling from the standby list so the torrent always tries to stay at
//! its target peer count.

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use futures::{select, FutureExt};
use tokio::{
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        RwLock,
    },
    time::{self, Instant},
};

use crate::{
    assembler::PieceAssembler,
    conf::Conf,
    counter::TorrentCounters,
    disk::{DiskHandle, TorrentAlert, TorrentAlertReceiver},
    error::*,
    metainfo::Metainfo,
    peer::{self, PeerSession},
    piece_picker::PiecePicker,
    storage_info::StorageInfo,
    tracker, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// Information about a torrent shared, read-only, by every peer session
/// belonging to it.
pub(crate) struct SharedStatus {
    pub info_hash: Sha1Hash,
    pub client_id: PeerId,
    pub storage: StorageInfo,
    pub id: TorrentId,
    /// The torrent's configuration, including the connect timeout and peer
    /// count targets peer sessions and the reap/backfill loop both need.
    pub conf: Arc<Conf>,
}

/// Events a peer session reports back to the torrent controller.
pub(crate) enum TorrentEvent {
    /// A peer session's task has ended, for whatever reason (graceful
    /// shutdown, connection loss, protocol error).
    PeerStopped { addr: SocketAddr },
    /// A piece has been fully downloaded and passed hash verification.
    PieceVerified(PieceIndex),
}

/// A single peer's connection bookkeeping, as tracked by the controller.
struct ConnectedPeer {
    cmd_chan: peer::Sender,
}

/// Commands the engine can send to a running torrent.
pub(crate) enum Command {
    /// Disconnects every peer and terminates the torrent's event loop.
    Stop,
}

pub(crate) type CommandSender = UnboundedSender<Command>;
type CommandReceiver = UnboundedReceiver<Command>;

/// Drives a single torrent from announce through to completion.
pub(crate) struct Torrent {
    shared: Arc<SharedStatus>,
    metainfo: Metainfo,
    piece_picker: Arc<RwLock<PiecePicker>>,
    assembler: Arc<RwLock<PieceAssembler>>,
    counters: Arc<TorrentCounters>,
    disk: DiskHandle,
    disk_alert_port: TorrentAlertReceiver,
    /// Peers we haven't tried connecting to yet (announce results not yet
    /// spawned as sessions), in announce order. Tried exactly once; a peer
    /// that disconnects is never retried, per the reap/backfill policy.
    /// `fill_peers` always starts the peers at the front of this queue
    /// first, so newly announced peers backfill only once everyone
    /// announced earlier has been tried.
    standby_peers: VecDeque<SocketAddr>,
    connected_peers: HashMap<SocketAddr, ConnectedPeer>,
    events_chan: UnboundedSender<TorrentEvent>,
    events_port: UnboundedReceiver<TorrentEvent>,
    cmd_port: CommandReceiver,
}

impl Torrent {
    /// Creates a new torrent controller for an already disk-allocated
    /// torrent, along with the sender the engine uses to stop it.
    pub fn new(
        id: TorrentId,
        metainfo: Metainfo,
        storage: StorageInfo,
        conf: Arc<Conf>,
        disk: DiskHandle,
        disk_alert_port: TorrentAlertReceiver,
    ) -> (Self, CommandSender) {
        let piece_count = metainfo.piece_count();
        let piece_lens = (0..piece_count)
            .map(|i| storage.piece_len(i).expect("piece index out of bounds"))
            .collect();
        let piece_hashes = (0..piece_count)
            .map(|i| {
                metainfo
                    .piece_hash(i)
                    .expect("piece index out of bounds")
            })
            .collect();

        let shared = Arc::new(SharedStatus {
            info_hash: metainfo.info_hash,
            client_id: conf.engine.client_id,
            storage,
            id,
            conf,
        });

        let (events_chan, events_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();

        let torrent = Self {
            shared,
            metainfo,
            piece_picker: Arc::new(RwLock::new(PiecePicker::new(piece_count))),
            assembler: Arc::new(RwLock::new(PieceAssembler::new(
                piece_lens,
                piece_hashes,
            ))),
            counters: Arc::new(TorrentCounters::default()),
            disk,
            disk_alert_port,
            standby_peers: VecDeque::new(),
            connected_peers: HashMap::new(),
            events_chan,
            events_port,
            cmd_port,
        };
        (torrent, cmd_chan)
    }

    /// Runs the torrent to completion: announces to the tracker, connects
    /// peers, drives the download, and returns once every piece is
    /// verified.
    pub async fn start(&mut self) -> Result<()> {
        log::info!("Starting torrent {}", self.shared.id);

        self.announce().await?;
        self.fill_peers();

        let mut announce_timer =
            time::interval_at(
                Instant::now() + self.shared.conf.torrent.announce_interval,
                self.shared.conf.torrent.announce_interval,
            );

        loop {
            if self.piece_picker.read().await.is_complete() {
                log::info!("Torrent {} complete", self.shared.id);
                break;
            }

            select! {
                event = self.events_port.recv().fuse() => {
                    match event {
                        Some(TorrentEvent::PeerStopped { addr }) => {
                            self.handle_peer_stopped(addr);
                        }
                        Some(TorrentEvent::PieceVerified(index)) => {
                            self.counters.downloaded_pieces.add(1);
                            log::info!(
                                "Torrent {} piece {} verified ({}/{})",
                                self.shared.id,
                                index,
                                self.counters.downloaded_pieces.get(),
                                self.shared.storage.piece_count,
                            );
                        }
                        None => {
                            // every session sender is dropped along with
                            // every peer, which only happens once this
                            // loop itself drops `events_chan`; unreachable
                            // while the loop is alive since it holds its
                            // own clone
                            unreachable!("events_chan outlives events_port");
                        }
                    }
                }
                alert = self.disk_alert_port.recv().fuse() => {
                    if let Some(TorrentAlert::PieceWrite(Err(e))) = alert {
                        log::warn!(
                            "Torrent {} piece write failed: {}",
                            self.shared.id,
                            e
                        );
                    }
                }
                cmd = self.cmd_port.recv().fuse() => {
                    match cmd {
                        Some(Command::Stop) | None => {
                            log::info!("Stopping torrent {}", self.shared.id);
                            break;
                        }
                    }
                }
                _ = announce_timer.tick().fuse() => {
                    if let Err(e) = self.announce().await {
                        log::warn!(
                            "Torrent {} re-announce failed: {}",
                            self.shared.id,
                            e
                        );
                    }
                    self.fill_peers();
                }
            }
        }

        self.shutdown_peers();

        Ok(())
    }

    /// Announces to the tracker and appends any newly discovered peers to
    /// the standby list (peers already connected or already standby are
    /// not re-added).
    async fn announce(&mut self) -> Result<()> {
        let left = self.bytes_left();
        let resp = tracker::announce(
            &self.metainfo.announce,
            self.shared.info_hash,
            self.shared.client_id,
            6881,
            left,
        )
        .await?;

        log::info!(
            "Torrent {} announce returned {} peers",
            self.shared.id,
            resp.peers.len()
        );

        for peer in resp.peers {
            let addr = SocketAddr::new(IpAddr::V4(*peer.addr.ip()), peer.addr.port());
            if !self.connected_peers.contains_key(&addr)
                && !self.standby_peers.contains(&addr)
            {
                self.standby_peers.push_back(addr);
            }
        }

        Ok(())
    }

    /// Returns the number of bytes left to download, for the tracker's
    /// `left` parameter.
    fn bytes_left(&self) -> u64 {
        let piece_len = self.shared.storage.piece_len as u64;
        let downloaded = self.counters.downloaded_pieces.get() * piece_len;
        self.shared.storage.download_len.saturating_sub(downloaded)
    }

    /// Spawns new peer sessions from the standby list until the connected
    /// count reaches the configured ceiling, always drawing from the front
    /// of the standby queue: the peers announced earliest start (or
    /// backfill) first.
    fn fill_peers(&mut self) {
        let max = self.shared.conf.torrent.max_connected_peer_count;
        while self.connected_peers.len() < max {
            let addr = match self.standby_peers.pop_front() {
                Some(addr) => addr,
                None => break,
            };
            self.spawn_peer(addr);
        }
    }

    /// Spawns a new outbound peer session task for `addr`.
    fn spawn_peer(&mut self, addr: SocketAddr) {
        log::info!("Torrent {} spawning peer session {}", self.shared.id, addr);

        let (mut session, cmd_chan) = PeerSession::outbound(
            Arc::clone(&self.shared),
            Arc::clone(&self.piece_picker),
            Arc::clone(&self.assembler),
            Arc::clone(&self.counters),
            self.disk.clone(),
            self.events_chan.clone(),
            addr,
        );

        tokio::spawn(async move {
            if let Err(e) = session.start().await {
                log::info!("Peer {} session error: {}", addr, e);
            }
        });

        self.connected_peers.insert(addr, ConnectedPeer { cmd_chan });
    }

    /// Removes a stopped peer from the connected set. The standby list is
    /// never replenished with it: a peer that disconnects once is not
    /// retried, per the reap/backfill policy (`fill_peers` only draws from
    /// peers discovered by announce and never yet tried).
    fn handle_peer_stopped(&mut self, addr: SocketAddr) {
        log::info!("Torrent {} reaping peer {}", self.shared.id, addr);
        self.connected_peers.remove(&addr);
        self.fill_peers();
    }

    /// Broadcasts a shutdown command to every connected peer session.
    fn shutdown_peers(&mut self) {
        for (addr, peer) in self.connected_peers.drain() {
            if peer.cmd_chan.send(peer::Command::Shutdown).is_err() {
                log::debug!("Peer {} already gone", addr);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_metainfo() -> Metainfo {
        let mut buf = Vec::new();
        buf.extend_from_slice(
            b"d8:announce12:http://x.com4:infod6:lengthi8e4:name5:a.txt12:piece lengthi8e6:pieces",
        );
        let pieces = vec![b'A'; 20];
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");
        Metainfo::from_bytes(&buf).unwrap()
    }

    #[tokio::test]
    async fn bytes_left_is_full_length_before_any_piece_verified() {
        let metainfo = test_metainfo();
        let storage = StorageInfo::new(&metainfo, PathBuf::from("/tmp/leechtorrent-test"));
        let conf = Arc::new(Conf::new(PathBuf::from("/tmp/leechtorrent-test")));
        let (disk, _alert_port) = crate::disk::spawn().unwrap();
        let (_tx, alert_port) = mpsc::unbounded_channel();
        let (torrent, _cmd_chan) =
            Torrent::new(0, metainfo, storage, conf, disk, alert_port);
        assert_eq!(torrent.bytes_left(), 8);
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    #[tokio::test]
    async fn fill_peers_caps_at_max_and_backfills_on_reap() {
        let metainfo = test_metainfo();
        let storage =
            StorageInfo::new(&metainfo, PathBuf::from("/tmp/leechtorrent-test-backfill"));
        let mut conf = Conf::new(PathBuf::from("/tmp/leechtorrent-test-backfill"));
        conf.torrent.max_connected_peer_count = 2;
        let conf = Arc::new(conf);
        let (disk, _alert_port) = crate::disk::spawn().unwrap();
        let (_tx, alert_port) = mpsc::unbounded_channel();
        let (mut torrent, _cmd_chan) =
            Torrent::new(0, metainfo, storage, conf, disk, alert_port);

        torrent.standby_peers =
            vec![addr(1), addr(2), addr(3), addr(4), addr(5)].into();
        torrent.fill_peers();
        // the first two peers in announce order are started; the rest stay
        // idle in standby, still in order
        assert_eq!(torrent.connected_peers.len(), 2);
        assert!(torrent.connected_peers.contains_key(&addr(1)));
        assert!(torrent.connected_peers.contains_key(&addr(2)));
        assert_eq!(
            torrent.standby_peers,
            VecDeque::from(vec![addr(3), addr(4), addr(5)])
        );

        // reaping a connected peer backfills the first never-tried standby
        // peer, keeping the connected count at the ceiling
        torrent.handle_peer_stopped(addr(1));
        assert_eq!(torrent.connected_peers.len(), 2);
        assert!(torrent.connected_peers.contains_key(&addr(2)));
        assert!(torrent.connected_peers.contains_key(&addr(3)));
        assert_eq!(
            torrent.standby_peers,
            VecDeque::from(vec![addr(4), addr(5)])
        );
    }
}
