//! The disk IO subsystem.
//!
//! Disk access is its own task so that the (potentially slow, syscall
//! heavy) work of writing a piece's bytes never blocks a peer session's
//! event loop. By the time a piece reaches this module it has already
//! been assembled and hash-verified by [`crate::assembler`], so the disk
//! task's only job is splitting it across the files it overlaps and
//! writing it. Torrents and peer sessions talk to it only through
//! [`DiskHandle`] and the per-torrent alert channel it hands back.

mod io;
mod iovecs;

use std::fmt;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{error::Result, storage_info::StorageInfo, PieceIndex, TorrentId};

/// A lightweight, cloneable handle used by the rest of the engine to talk
/// to the disk task.
#[derive(Clone)]
pub(crate) struct DiskHandle(CommandSender);

impl DiskHandle {
    /// Tells the disk task to allocate storage for a new torrent.
    pub fn allocate_new_torrent(
        &self,
        id: TorrentId,
        info: StorageInfo,
    ) -> Result<()> {
        Ok(self.0.send(Command::NewTorrent { id, info })?)
    }

    /// Queues an already hash-verified piece to be written to disk.
    pub fn write_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        Ok(self.0.send(Command::WritePiece { id, index, data })?)
    }

    /// Tells the disk task to shut down.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.0.send(Command::Shutdown)?)
    }
}

/// Spawns the disk IO event loop as a separate task and returns a handle
/// to it along with the channel on which it reports engine-wide alerts.
pub(crate) fn spawn() -> Result<(DiskHandle, AlertReceiver)> {
    let (mut disk, cmd_chan, alert_port) = io::Disk::new()?;
    tokio::task::spawn(async move {
        if let Err(e) = disk.start().await {
            log::error!("Disk IO event loop stopped with error: {}", e);
        }
    });
    Ok((DiskHandle(cmd_chan), alert_port))
}

/// Commands sent by the rest of the engine to the disk task.
pub(crate) enum Command {
    /// Allocates the on-disk layout (and in-memory bookkeeping) for a new
    /// torrent.
    NewTorrent { id: TorrentId, info: StorageInfo },
    /// Writes a complete, already hash-verified piece to the files it
    /// overlaps with.
    WritePiece {
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
    },
    /// Tells the disk task to stop its event loop.
    Shutdown,
}

pub(crate) type CommandSender = UnboundedSender<Command>;
pub(crate) type CommandReceiver = UnboundedReceiver<Command>;

/// Engine-wide alerts sent by the disk task.
pub(crate) enum Alert {
    /// The result of allocating a new torrent's storage, tagged with the
    /// id so the engine can tell which of its (possibly several)
    /// in-flight allocation requests this answers, including on failure.
    TorrentAllocation {
        id: TorrentId,
        result: std::result::Result<TorrentAlertReceiver, NewTorrentError>,
    },
}

pub(crate) type AlertSender = UnboundedSender<Alert>;
pub(crate) type AlertReceiver = UnboundedReceiver<Alert>;

/// Per-torrent alerts sent by the disk task.
pub(crate) enum TorrentAlert {
    /// The result of writing a piece's bytes to its files.
    PieceWrite(std::result::Result<PieceIndex, WriteError>),
}

pub(crate) type TorrentAlertSender = UnboundedSender<TorrentAlert>;
pub(crate) type TorrentAlertReceiver = UnboundedReceiver<TorrentAlert>;

/// Failure modes when allocating a new torrent's on-disk storage.
#[derive(Debug)]
pub(crate) enum NewTorrentError {
    /// A torrent with this id is already registered.
    AlreadyExists,
    /// Creating the download directory or opening a file failed.
    Io(std::io::Error),
}

impl fmt::Display for NewTorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists => {
                write!(f, "torrent is already allocated on disk")
            }
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for NewTorrentError {}

/// Failure modes when writing a piece to disk.
#[derive(Debug)]
pub(crate) enum WriteError {
    /// The piece index doesn't exist in this torrent.
    InvalidPieceIndex,
    /// The underlying syscall failed.
    Io(std::io::Error),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for WriteError {}

/// Local error/result aliases used by [`io`], distinct from the crate's
/// top-level [`crate::error`] types: most disk IO failures are reported
/// back to the torrent as an alert rather than propagated with `?`.
pub(crate) mod error {
    pub(crate) use crate::error::{Error, Result};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_returns_a_usable_handle() {
        // spawning requires a tokio runtime; this only checks that the
        // types involved line up, since DiskHandle itself is zero-cost to
        // construct and clone
        fn assert_clone<T: Clone>() {}
        assert_clone::<DiskHandle>();
    }
}
