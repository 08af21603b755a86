//! The crate-wide error and result types.

use std::fmt;

use tokio::sync::mpsc::error::SendError;

/// The result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The different kinds of errors the engine may produce.
///
/// Each variant corresponds to one of the error dispositions named in the
/// design: a handful are fatal to the whole torrent (metainfo/tracker
/// failures), most are local to a single peer session and are handled by
/// the torrent controller's reap/backfill logic rather than by aborting
/// the torrent.
#[derive(Debug)]
pub enum Error {
    /// The `.torrent` file could not be parsed as a bencoded metainfo
    /// dictionary, or a required key was missing.
    InvalidMetainfo,
    /// The tracker response could not be parsed, or its `peers` field was
    /// in neither the dictionary nor the compact binary model.
    InvalidTrackerResponse,
    /// The tracker returned a textual failure reason instead of a peer
    /// list.
    TrackerFailure(String),
    /// The peer's handshake didn't start with the literal protocol string
    /// `"BitTorrent protocol"`.
    InvalidProtocol,
    /// The peer's handshake advertised an info hash that doesn't match the
    /// torrent we're trying to download.
    InvalidPeerInfoHash,
    /// The peer didn't send a bitfield directly after the handshake, or
    /// sent a bitfield later than that.
    BitfieldNotAfterHandshake,
    /// The peer's bitfield claimed to have a subset of pieces, but this
    /// client only implements downloading and therefore requires peers to
    /// be seeds.
    PeerNotSeed,
    /// The peer's message carried a `msg_id` this client doesn't
    /// recognize.
    UnknownMessageId(u8),
    /// An index into the piece array that is out of bounds.
    InvalidPieceIndex,
    /// No torrent is registered under the given id.
    InvalidTorrentId,
    /// Wraps an IO error (connect failure, broken pipe, disk IO, etc).
    Io(std::io::Error),
    /// An internal channel's receiver was dropped before a send completed.
    ChannelClosed,
    /// The disk task could not allocate a torrent's on-disk storage (the
    /// id was already taken, or a file/directory could not be created).
    TorrentAllocation(String),
    /// The piece picker had no piece left to claim from this peer: either
    /// every piece it has is already fully downloaded, or every piece it
    /// has left is claimed by another session. The session has nothing
    /// further to do and disconnects.
    NoPieceToDownload,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMetainfo => write!(f, "invalid metainfo"),
            Self::InvalidTrackerResponse => {
                write!(f, "invalid tracker response")
            }
            Self::TrackerFailure(reason) => {
                write!(f, "tracker failure: {}", reason)
            }
            Self::InvalidProtocol => write!(f, "invalid protocol string"),
            Self::InvalidPeerInfoHash => write!(f, "invalid peer info hash"),
            Self::BitfieldNotAfterHandshake => {
                write!(f, "bitfield not sent directly after handshake")
            }
            Self::PeerNotSeed => write!(f, "peer is not a seed"),
            Self::UnknownMessageId(id) => {
                write!(f, "unknown message id: {}", id)
            }
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidTorrentId => write!(f, "invalid torrent id"),
            Self::Io(e) => write!(f, "io error: {}", e),
            Self::ChannelClosed => write!(f, "internal channel closed"),
            Self::TorrentAllocation(reason) => {
                write!(f, "torrent storage allocation failed: {}", reason)
            }
            Self::NoPieceToDownload => {
                write!(f, "no piece left to download from this peer")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_bencode::Error> for Error {
    fn from(_e: serde_bencode::Error) -> Self {
        Self::InvalidMetainfo
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl<T> From<SendError<T>> for Error {
    fn from(_e: SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<crate::disk::NewTorrentError> for Error {
    fn from(e: crate::disk::NewTorrentError) -> Self {
        Self::TorrentAllocation(e.to_string())
    }
}
