use {
    nix::sys::uio::pwritev,
    std::{
        collections::HashMap,
        fs::{self, File, OpenOptions},
        os::unix::io::AsRawFd,
        sync::{Arc, Mutex},
    },
    tokio::{
        sync::{mpsc, RwLock},
        task,
    },
};

use {
    super::{
        error::*,
        iovecs::{IoVec, IoVecs},
        Alert, AlertReceiver, AlertSender, Command, CommandReceiver,
        CommandSender, NewTorrentError, TorrentAlert, TorrentAlertReceiver,
        TorrentAlertSender, WriteError,
    },
    crate::{
        error::Error,
        storage_info::{FsStructure, StorageInfo},
        FileInfo, PieceIndex, TorrentId,
    },
};

/// The entity responsible for saving downloaded pieces to disk.
pub(super) struct Disk {
    /// Each torrent in engine has a corresponding entry in this hashmap, which
    /// includes various metadata about torrent and the torrent specific alert
    /// channel.
    torrents: HashMap<TorrentId, RwLock<Torrent>>,
    /// Port on which disk IO commands are received.
    cmd_port: CommandReceiver,
    /// Channel on which `Disk` sends alerts to the torrent engine.
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new `Disk` instance and returns a command sender and an alert
    /// receiver.
    pub(super) fn new() -> Result<(Self, CommandSender, AlertReceiver)> {
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        Ok((
            Self {
                torrents: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        ))
    }

    /// Starts the disk event loop which is run until shutdown or an
    /// unrecoverable error occurs (e.g. mpsc channel failure).
    pub(super) async fn start(&mut self) -> Result<()> {
        log::info!("Starting disk IO event loop");
        while let Some(cmd) = self.cmd_port.recv().await {
            log::debug!("Disk received command");
            match cmd {
                Command::NewTorrent { id, info } => {
                    if self.torrents.contains_key(&id) {
                        log::warn!("Torrent {} already allocated", id);
                        self.alert_chan.send(Alert::TorrentAllocation {
                            id,
                            result: Err(NewTorrentError::AlreadyExists),
                        })?;
                        continue;
                    }

                    // NOTE: Do _NOT_ return on failure, we don't want to kill
                    // the disk task due to potential disk IO errors: we just
                    // want to log it and notify engine of it.
                    let torrent_res = Torrent::new(info);
                    match torrent_res {
                        Ok((torrent, alert_port)) => {
                            log::info!("Torrent {} successfully allocated", id);
                            self.torrents.insert(id, RwLock::new(torrent));
                            // send notificaiton of allocation success
                            self.alert_chan.send(Alert::TorrentAllocation {
                                id,
                                result: Ok(alert_port),
                            })?;
                        }
                        Err(e) => {
                            log::warn!(
                                "Torrent {} allocation failure: {}",
                                id,
                                e
                            );
                            // send notificaiton of allocation failure
                            self.alert_chan.send(Alert::TorrentAllocation {
                                id,
                                result: Err(e),
                            })?;
                        }
                    }
                }
                Command::WritePiece { id, index, data } => {
                    self.write_piece(id, index, data).await?;
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk event loop");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Queues a piece for writing and fails if the torrent id is invalid.
    ///
    /// If the piece could not be written due to IO failure, the torrent is
    /// notified of it.
    async fn write_piece(
        &self,
        id: TorrentId,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Saving torrent {} piece {} to disk", id, index);

        let torrent = self.torrents.get(&id).ok_or_else(|| {
            log::warn!("Torrent {} not found", id);
            Error::InvalidTorrentId
        })?;
        torrent.write().await.write_piece(index, data).await
    }
}

/// Torrent information related to disk IO.
struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,
    /// The channel used to alert a torrent that a piece has been written to
    /// disk (or failed to write).
    alert_chan: TorrentAlertSender,
    /// Handles of all files in torrent, opened in advance during torrent
    /// creation.
    ///
    /// Each writer thread will get exclusive access to the file handle it
    /// needs, referring to it directly in the vector (hence the arc).
    ///
    /// Later we will need to make file access more granular, as multiple
    /// concurrent writes to the same file that don't overlap are safe to do.
    files: Arc<Vec<Mutex<TorrentFile>>>,
    /// Disk IO statistics.
    stats: Stats,
}

impl Torrent {
    /// Creates the file system structure of the torrent and opens the file
    /// handles.
    ///
    /// For a single file, there is a path validity check and then the file is
    /// opened. For multi-file torrents, if there are any subdirectories in the
    /// torrent archive, they are created and all files are opened.
    fn new(
        info: StorageInfo,
    ) -> Result<(Self, TorrentAlertReceiver), NewTorrentError> {
        if info.download_dir.exists() {
            log::warn!("Download path {:?} exists", info.download_dir);
            return Err(NewTorrentError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "Download path already exists",
            )));
        }

        // Helper function for opening a file.
        let open_file = |info: FileInfo| {
            let handle = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&info.path)
                .map_err(|e| {
                    log::warn!("Failed to open file {:?}", &info.path);
                    NewTorrentError::Io(e)
                })?;
            Ok(Mutex::new(TorrentFile { info, handle }))
        };

        let files = match &info.structure {
            FsStructure::File(file) => {
                log::debug!(
                    "Torrent is single {} bytes long file {:?}",
                    file.len,
                    file.path
                );
                vec![open_file(file.clone())?]
            }
            FsStructure::Archive { files } => {
                debug_assert!(!files.is_empty());
                log::debug!("Torrent is multi file: {:?}", files);
                log::debug!("Setting up directory structure");
                let mut torrent_files = Vec::with_capacity(files.len());
                for file in files.iter() {
                    // file or subdirectory in download root must not exist if
                    // download root does not exists
                    debug_assert!(!file.path.exists());
                    debug_assert!(!file.path.is_absolute());

                    // get the parent of the file path: if there is one (i.e.
                    // this is not a file in the torrent root), and doesn't
                    // exist, create it
                    if let Some(subdir) = file.path.parent() {
                        if !subdir.exists() {
                            log::info!("Creating torrent subdir {:?}", subdir);
                            fs::create_dir_all(&subdir).map_err(|e| {
                                log::warn!(
                                    "Failed to create subdir {:?}",
                                    subdir
                                );
                                NewTorrentError::Io(e)
                            })?;
                        }
                    }

                    // open the file and get a handle to it
                    let file = FileInfo {
                        path: info.download_dir.join(&file.path),
                        torrent_offset: file.torrent_offset,
                        len: file.len,
                    };
                    torrent_files.push(open_file(file)?);
                }
                torrent_files
            }
        };

        let (alert_chan, alert_port) = mpsc::unbounded_channel();

        Ok((
            Self {
                info,
                alert_chan,
                files: Arc::new(files),
                stats: Stats::default(),
            },
            alert_port,
        ))
    }

    /// Splits a piece's bytes across the files it overlaps with and writes
    /// them, off the reactor thread since this performs blocking syscalls.
    async fn write_piece(
        &mut self,
        index: PieceIndex,
        data: Vec<u8>,
    ) -> Result<()> {
        log::trace!("Writing piece {} ({} bytes) to disk", index, data.len());

        let piece_len = self.info.piece_len;
        let files = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| WriteError::InvalidPieceIndex);
        let files_range = match files {
            Ok(range) => range,
            Err(e) => {
                self.alert_chan.send(TorrentAlert::PieceWrite(Err(e)))?;
                return Ok(());
            }
        };

        let files = Arc::clone(&self.files);
        let write_result = task::spawn_blocking(move || {
            let piece_torrent_offset = index as u64 * piece_len as u64;
            write_piece_data(
                piece_torrent_offset,
                &data,
                &files[files_range],
            )
        })
        .await
        // our code doesn't panic in the task so until better strategies
        // are devised, unwrap here
        .expect("disk IO write task panicked");

        // We don't error out on disk write failure as we don't want to
        // kill the disk task due to potential disk IO errors (which may
        // happen from time to time). We alert torrent of this failure and
        // return normally.
        match write_result {
            Ok(write_count) => {
                self.stats.write_count += write_count as u64;
                self.alert_chan
                    .send(TorrentAlert::PieceWrite(Ok(index)))?;
                log::debug!(
                    "Piece {} write complete ({} bytes)",
                    index,
                    write_count
                );
            }
            Err(e) => {
                self.stats.write_failure_count += 1;
                log::warn!("Disk write error: {}", e);
                self.alert_chan
                    .send(TorrentAlert::PieceWrite(Err(e)))?;
            }
        }

        Ok(())
    }
}

struct TorrentFile {
    info: FileInfo,
    handle: File,
}

impl TorrentFile {
    fn write_vectored_at<'a>(
        &self,
        iovecs: &mut IoVecs<'a>,
        offset: u64,
    ) -> Result<usize, WriteError> {
        // IO syscalls are not guaranteed to write the whole input buffer in one
        // go, so we need to write until all bytes have been confirmed to be
        // written to disk (or an error occurs)
        let mut total_write_count = 0;
        while !iovecs.buffers().is_empty() {
            let write_count = pwritev(
                self.handle.as_raw_fd(),
                iovecs.buffers(),
                offset as i64,
            )
            .map_err(|e| {
                log::warn!("File {:?} write error: {}", self.info.path, e);
                WriteError::Io(std::io::Error::last_os_error())
            })?;
            iovecs.advance(write_count);
            total_write_count += write_count;
        }
        Ok(total_write_count)
    }
}

#[derive(Default)]
struct Stats {
    /// The number of bytes successfully written to disk.
    write_count: u64,
    /// The number of times we failed to write to disk.
    write_failure_count: usize,
}

/// Writes a complete piece's bytes to the files it overlaps with.
///
/// This performs sync IO and is thus potentially blocking and should be
/// executed on a thread pool and not the executor.
fn write_piece_data(
    piece_torrent_offset: u64,
    data: &[u8],
    files: &[Mutex<TorrentFile>],
) -> Result<usize, WriteError> {
    let mut total_write_count = 0;
    let mut bufs = vec![IoVec::from_slice(data)];
    let mut write_torrent_offset = piece_torrent_offset;

    debug_assert!(!files.is_empty());
    // optimize for the common single-file case: no need to split the
    // buffer across a file boundary
    if files.len() == 1 {
        let file = files.first().unwrap().lock().unwrap();
        let slice = file.info.get_slice(write_torrent_offset, data.len() as u64);
        let mut iovecs = IoVecs::unbounded(bufs);
        debug_assert!(
            iovecs
                .buffers()
                .iter()
                .map(|iov| iov.as_slice().len() as u64)
                .sum::<u64>()
                <= slice.len
        );

        total_write_count += file.write_vectored_at(&mut iovecs, slice.offset)?;
        bufs = iovecs.into_tail();
    } else {
        for file in files.iter() {
            let file = file.lock().unwrap();
            let remaining = data.len() as u64 - (write_torrent_offset - piece_torrent_offset);
            let slice = file.info.get_slice(write_torrent_offset, remaining);
            debug_assert!(slice.len > 0);
            debug_assert!(!bufs.is_empty());
            debug_assert!(!bufs[0].as_slice().is_empty());

            let mut iovecs = IoVecs::bounded(bufs, slice.len as usize);
            debug_assert!(
                iovecs
                    .buffers()
                    .iter()
                    .map(|iov| iov.as_slice().len() as u64)
                    .sum::<u64>()
                    <= slice.len
            );

            let write_count =
                file.write_vectored_at(&mut iovecs, slice.offset)?;

            bufs = iovecs.into_tail();
            write_torrent_offset += write_count as u64;
            total_write_count += write_count;
        }
    }

    debug_assert!(bufs.is_empty());
    Ok(total_write_count)
}

#[cfg(test)]
mod tests {
    use super::*;
}
