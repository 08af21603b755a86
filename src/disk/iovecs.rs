//! Helpers for turning a piece's in-memory blocks into the vectored I/O
//! buffers `pwritev` needs, including splitting them across a file
//! boundary and advancing past a short write.

use nix::sys::uio::IoVec as NixIoVec;

/// A reference to one block's bytes, as found in a piece's write buffer.
#[derive(Clone, Copy)]
pub(super) struct IoVec<'a>(&'a [u8]);

impl<'a> IoVec<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self(buf)
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.0
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

/// A window over a piece's blocks to be written in a single `pwritev`
/// call, bounded to the part of the piece that falls within one file.
///
/// Tracks the nix-compatible io vector list alongside the original
/// buffers so that [`IoVecs::advance`] (after a short write) doesn't have
/// to reallocate except to re-derive the nix list.
pub(super) struct IoVecs<'a> {
    bufs: Vec<IoVec<'a>>,
    nix_bufs: Vec<NixIoVec<&'a [u8]>>,
    /// The part of the original buffer list beyond this window's limit,
    /// handed back to the caller via [`IoVecs::into_tail`] to continue
    /// with the next file.
    tail: Vec<IoVec<'a>>,
}

impl<'a> IoVecs<'a> {
    /// Wraps the whole of `bufs`, imposing no upper bound on the total
    /// length.
    pub fn unbounded(bufs: Vec<IoVec<'a>>) -> Self {
        let nix_bufs = Self::to_nix(&bufs);
        Self {
            bufs,
            nix_bufs,
            tail: Vec::new(),
        }
    }

    /// Wraps a `limit`-byte-long prefix of `bufs`. If `limit` falls in the
    /// middle of a block, that block is split so that this window never
    /// exposes more than `limit` bytes; the remainder is kept for
    /// [`IoVecs::into_tail`].
    pub fn bounded(mut bufs: Vec<IoVec<'a>>, limit: usize) -> Self {
        let mut remaining = limit;
        let mut split_at = bufs.len();
        for (i, buf) in bufs.iter().enumerate() {
            if remaining == 0 || buf.len() > remaining {
                split_at = i;
                break;
            }
            remaining -= buf.len();
        }

        let mut tail = Vec::new();
        if split_at < bufs.len() {
            if remaining > 0 {
                let straddling = bufs[split_at];
                let (head, rest) = straddling.as_slice().split_at(remaining);
                bufs[split_at] = IoVec::from_slice(head);
                tail.push(IoVec::from_slice(rest));
                tail.extend_from_slice(&bufs[split_at + 1..]);
                bufs.truncate(split_at + 1);
            } else {
                tail.extend_from_slice(&bufs[split_at..]);
                bufs.truncate(split_at);
            }
        }

        let nix_bufs = Self::to_nix(&bufs);
        Self {
            bufs,
            nix_bufs,
            tail,
        }
    }

    fn to_nix(bufs: &[IoVec<'a>]) -> Vec<NixIoVec<&'a [u8]>> {
        bufs.iter().map(|b| NixIoVec::from_slice(b.as_slice())).collect()
    }

    /// Returns the buffers still left to write, in the form `pwritev`
    /// expects.
    pub fn buffers(&self) -> &[NixIoVec<&'a [u8]>] {
        &self.nix_bufs
    }

    /// Drops `write_count` bytes from the front, as `pwritev` isn't
    /// guaranteed to write the entire buffer list in one call.
    pub fn advance(&mut self, mut write_count: usize) {
        while write_count > 0 {
            match self.bufs.first().copied() {
                Some(front) if front.len() <= write_count => {
                    write_count -= front.len();
                    self.bufs.remove(0);
                }
                Some(front) => {
                    let remaining = &front.as_slice()[write_count..];
                    self.bufs[0] = IoVec::from_slice(remaining);
                    write_count = 0;
                }
                None => break,
            }
        }
        self.nix_bufs = Self::to_nix(&self.bufs);
    }

    /// Returns the part of the original buffer list beyond this window's
    /// limit, to continue writing into the next file.
    pub fn into_tail(self) -> Vec<IoVec<'a>> {
        self.tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unbounded_exposes_everything() {
        let a = vec![1, 2, 3];
        let b = vec![4, 5];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let iovecs = IoVecs::unbounded(bufs);
        assert_eq!(iovecs.buffers().len(), 2);
        assert!(iovecs.into_tail().is_empty());
    }

    #[test]
    fn bounded_splits_straddling_buffer() {
        let a = vec![1, 2, 3, 4];
        let b = vec![5, 6, 7, 8];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        // limit falls in the middle of the second buffer
        let iovecs = IoVecs::bounded(bufs, 6);
        let written: usize =
            iovecs.buffers().iter().map(|v| v.as_slice().len()).sum();
        assert_eq!(written, 6);
        let tail = iovecs.into_tail();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].as_slice(), &[7, 8]);
    }

    #[test]
    fn advance_consumes_front_buffers() {
        let a = vec![1, 2, 3];
        let b = vec![4, 5];
        let bufs = vec![IoVec::from_slice(&a), IoVec::from_slice(&b)];
        let mut iovecs = IoVecs::unbounded(bufs);
        iovecs.advance(4);
        let remaining: Vec<u8> = iovecs
            .buffers()
            .iter()
            .flat_map(|v| v.as_slice().to_vec())
            .collect();
        assert_eq!(remaining, vec![5]);
    }
}
