//! Parsing of the `.torrent` bencoded metainfo file.
//!
//! This is an external collaborator of the download engine: it is
//! specified here only to the depth needed to drive the engine end to end
//! (decode the `announce` URL, the info hash, and the piece/file layout),
//! not hardened beyond that.

use std::path::PathBuf;

use serde_bencode::Error as BencodeError;
use sha1::{Digest, Sha1};

use crate::{
    error::{Error, Result},
    storage_info::{FileInfo, FsStructure},
    PieceIndex, Sha1Hash,
};

/// The decoded and derived contents of a `.torrent` file.
///
/// Unlike the raw bencoded dictionary, this flattens the nested `info`
/// dictionary and adds the fields the rest of the engine needs: the
/// computed info hash, the piece count, and the file system structure of
/// the download (single file vs. multi-file archive), with relative paths
/// exactly as they appear in the torrent (an absolute download location is
/// only known once [`crate::storage_info::StorageInfo`] is constructed).
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    /// The SHA-1 hash of the bencoded `info` dictionary, exactly as
    /// received (not re-serialized).
    pub info_hash: Sha1Hash,
    /// The suggested name of the torrent: the file name for single-file
    /// torrents, or the directory name for multi-file torrents.
    pub name: String,
    /// The nominal length of a piece. The last piece may be shorter.
    pub piece_len: u32,
    /// The concatenation of all expected SHA-1 piece hashes, 20 bytes each.
    pub pieces: Vec<u8>,
    /// The file layout of the download.
    pub structure: FsStructure,
}

impl Metainfo {
    /// Parses a metainfo file's raw bytes into a [`Metainfo`].
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let raw = RawMetainfo::from_bytes(buf)?;
        let info_hash = raw.info_hash()?;
        let info = raw.info;

        if info.piece_length == 0 {
            return Err(Error::InvalidMetainfo);
        }
        if info.pieces.len() % 20 != 0 {
            return Err(Error::InvalidMetainfo);
        }

        let structure = match (&info.length, &info.files) {
            (Some(len), None) => FsStructure::File(FileInfo {
                path: PathBuf::from(&info.name),
                len: *len,
                torrent_offset: 0,
            }),
            (None, Some(files)) if !files.is_empty() => {
                let mut torrent_offset = 0;
                let mut entries = Vec::with_capacity(files.len());
                for file in files {
                    if file.length < 0 {
                        return Err(Error::InvalidMetainfo);
                    }
                    let path: PathBuf = file.path.iter().collect();
                    let len = file.length as u64;
                    entries.push(FileInfo {
                        path,
                        len,
                        torrent_offset,
                    });
                    torrent_offset += len;
                }
                FsStructure::Archive { files: entries }
            }
            _ => return Err(Error::InvalidMetainfo),
        };

        Ok(Self {
            announce: raw.announce,
            info_hash,
            name: info.name,
            piece_len: info.piece_length as u32,
            pieces: info.pieces,
            structure,
        })
    }

    /// Returns the number of pieces in the torrent.
    pub fn piece_count(&self) -> usize {
        self.pieces.len() / 20
    }

    /// Returns the expected SHA-1 hash of the piece at `index`.
    pub fn piece_hash(&self, index: PieceIndex) -> Result<Sha1Hash> {
        let pos = index * 20;
        let slice = self
            .pieces
            .get(pos..pos + 20)
            .ok_or(Error::InvalidPieceIndex)?;
        let mut hash = [0; 20];
        hash.copy_from_slice(slice);
        Ok(hash)
    }
}

/// The raw bencoded dictionary, deserialized as-is before any derived
/// fields are computed.
#[derive(Debug, Deserialize)]
struct RawMetainfo {
    announce: String,
    info: RawInfo,
}

impl RawMetainfo {
    fn from_bytes(buf: &[u8]) -> std::result::Result<Self, BencodeError> {
        serde_bencode::from_bytes(buf)
    }

    /// The info hash is the SHA-1 digest of the bencoded `info`
    /// sub-dictionary, re-serialized exactly as it would appear in the
    /// original file (field order is preserved by `serde_bencode`).
    fn info_hash(&self) -> Result<Sha1Hash> {
        let bytes = serde_bencode::to_bytes(&self.info)?;
        let digest = Sha1::digest(&bytes);
        let mut info_hash = [0; 20];
        info_hash.copy_from_slice(&digest);
        Ok(info_hash)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(with = "serde_bytes")]
    pieces: Vec<u8>,
    #[serde(rename = "piece length")]
    piece_length: u64,
    length: Option<u64>,
    files: Option<Vec<RawFile>>,
    #[allow(dead_code)]
    private: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFile {
    path: Vec<String>,
    length: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_torrent(pieces: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce12:http://x.com4:infod6:lengthi8e4:name5:a.txt12:piece lengthi8e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(pieces);
        buf.extend_from_slice(b"ee");
        buf
    }

    #[test]
    fn parses_single_file_torrent() {
        let pieces = vec![b'A'; 20];
        let buf = single_file_torrent(&pieces);

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.announce, "http://x.com");
        assert_eq!(metainfo.name, "a.txt");
        assert_eq!(metainfo.piece_len, 8);
        assert_eq!(metainfo.piece_count(), 1);
        match &metainfo.structure {
            FsStructure::File(file) => {
                assert_eq!(file.len, 8);
                assert_eq!(file.path, PathBuf::from("a.txt"));
            }
            FsStructure::Archive { .. } => panic!("expected single file"),
        }
    }

    #[test]
    fn parses_multi_file_torrent() {
        let pieces = vec![b'B'; 40];
        let mut buf = Vec::new();
        buf.extend_from_slice(b"d8:announce12:http://x.com4:infod5:filesld6:lengthi3e4:pathl1:a1:beed6:lengthi4e4:pathl1:ceee4:name3:dir12:piece lengthi4e6:pieces");
        buf.extend_from_slice(format!("{}:", pieces.len()).as_bytes());
        buf.extend_from_slice(&pieces);
        buf.extend_from_slice(b"ee");

        let metainfo = Metainfo::from_bytes(&buf).unwrap();
        assert_eq!(metainfo.piece_count(), 2);
        match &metainfo.structure {
            FsStructure::Archive { files } => {
                assert_eq!(files.len(), 2);
                assert_eq!(files[0].path, PathBuf::from("a").join("b"));
                assert_eq!(files[0].torrent_offset, 0);
                assert_eq!(files[1].path, PathBuf::from("c"));
                assert_eq!(files[1].torrent_offset, 3);
            }
            FsStructure::File(_) => panic!("expected archive"),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(Metainfo::from_bytes(b"not bencode").is_err());
    }

    #[test]
    fn rejects_mismatched_piece_hash_length() {
        // 19 bytes is not a multiple of 20
        let pieces = vec![b'A'; 19];
        let buf = single_file_torrent(&pieces);
        assert!(Metainfo::from_bytes(&buf).is_err());
    }
}
