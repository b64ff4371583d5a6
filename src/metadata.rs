//! The per-entry capture record produced by the Carver and the Change Monitor.

use std::path::PathBuf;

use crate::hash::Hash;

/// The kind of filesystem entry a [`MetaData`] describes.
///
/// Device files, sockets and FIFOs are all folded into `Special`: the
/// fanotify mask this agent watches does not distinguish among them, and
/// neither did the original carver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// A regular file; may carry a non-empty `hash_list`.
    Regular,
    /// A directory; carved recursively, depth-first.
    Directory,
    /// A symbolic link; never followed, `link_target` records its target.
    Symlink,
    /// A device, socket, or FIFO.
    Special,
}

/// Describes one filesystem entry as observed at capture time.
///
/// A `MetaData` is immutable once built: every field is filled in by the
/// constructor that produced it (the Carver or the Change Monitor's re-carve
/// path) and never mutated afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaData {
    /// What kind of entry this is.
    pub file_type: FileType,
    /// Absolute path, UTF-8 encoded. Non-UTF-8 byte sequences are
    /// percent-encoded via [`crate::path_encoding::encode_path_lossless`]
    /// rather than dropping the entry or replacing bytes with U+FFFD.
    pub path: String,
    /// Inode number.
    pub inode: u64,
    /// Owning user name, resolved at capture time.
    pub owner: String,
    /// Owning group name, resolved at capture time.
    pub group: String,
    /// Numeric user id.
    pub uid: u32,
    /// Numeric group id.
    pub gid: u32,
    /// Last access time, seconds since the Unix epoch.
    pub atime: u64,
    /// Inode change time, seconds since the Unix epoch.
    pub ctime: u64,
    /// Last modification time, seconds since the Unix epoch.
    pub mtime: u64,
    /// POSIX mode bits.
    pub mode: u32,
    /// Size in bytes.
    pub size: u64,
    /// Present iff `file_type == Symlink`.
    pub link_target: Option<PathBuf>,
    /// Ordered block hashes, in file byte order. Present iff
    /// `file_type == Regular`; empty for zero-byte files.
    pub hash_list: Vec<Hash>,
}

impl MetaData {
    /// `len(hash_list) == ceil(size / blocksize)` for regular files, per the
    /// data model invariant; a trailing partial block still yields one hash.
    pub fn expected_hash_count(size: u64, blocksize: u64) -> u64 {
        if size == 0 {
            0
        } else {
            size.div_ceil(blocksize)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn expected_hash_count_rounds_up() {
        assert_eq!(MetaData::expected_hash_count(0, 4), 0);
        assert_eq!(MetaData::expected_hash_count(1, 4), 1);
        assert_eq!(MetaData::expected_hash_count(4, 4), 1);
        assert_eq!(MetaData::expected_hash_count(5, 4), 2);
        assert_eq!(MetaData::expected_hash_count(10, 4), 3);
    }
}
