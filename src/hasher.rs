//! Streaming, per-block SHA-256 hashing of regular files.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use sha2::{Digest, Sha256};

use crate::hash::Hash;

/// Errors the Block Hasher can surface. `ReadError` aborts the current file:
/// the caller must not emit a partial `MetaData` for it.
#[derive(Debug, thiserror::Error)]
pub enum HasherError {
    /// A read from the file failed partway through.
    #[error("error reading {path}: {source}")]
    ReadError {
        /// Path of the file being hashed.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Cancellation was observed between blocks; not a real error, but it
    /// aborts the file the same way `ReadError` does.
    #[error("cancelled while hashing {path}")]
    Cancelled {
        /// Path of the file being hashed.
        path: String,
    },
}

/// Streams `path` in fixed-size blocks and returns one SHA-256 digest per
/// block, in file byte order. Never observes cancellation.
pub fn hash_file(path: &Path, blocksize: u64) -> Result<Vec<Hash>, HasherError> {
    hash_file_cancelable(path, blocksize, &AtomicBool::new(false))
}

/// Like [`hash_file`], but checks `cancel` between blocks (a cancellation
/// checkpoint named explicitly in the concurrency model) and aborts with
/// [`HasherError::Cancelled`] if it is set.
///
/// At most one block (`blocksize` bytes) is held in memory at a time. The
/// checksum state is reset between blocks — each digest is independent, not
/// a rolling hash, by design: it lets the server deduplicate identical
/// blocks at any file offset. The final block may be shorter than
/// `blocksize`; its digest still covers only the bytes actually read.
pub fn hash_file_cancelable(
    path: &Path,
    blocksize: u64,
    cancel: &AtomicBool,
) -> Result<Vec<Hash>, HasherError> {
    let file = File::open(path).map_err(|source| HasherError::ReadError {
        path: path.display().to_string(),
        source,
    })?;
    hash_reader(file, blocksize, path, cancel)
}

fn hash_reader<R: Read>(
    mut reader: R,
    blocksize: u64,
    path: &Path,
    cancel: &AtomicBool,
) -> Result<Vec<Hash>, HasherError> {
    let blocksize = usize::try_from(blocksize).unwrap_or(usize::MAX).max(1);
    let mut buffer = vec![0u8; blocksize];
    let mut hashes = Vec::new();

    loop {
        if cancel.load(Ordering::Relaxed) {
            return Err(HasherError::Cancelled {
                path: path.display().to_string(),
            });
        }
        let read = read_full_or_partial(&mut reader, &mut buffer).map_err(|source| {
            HasherError::ReadError {
                path: path.display().to_string(),
                source,
            }
        })?;
        if read == 0 {
            break;
        }
        let mut hasher = Sha256::new();
        hasher.update(&buffer[..read]);
        let digest: [u8; 32] = hasher.finalize().into();
        hashes.push(Hash::new(digest));
        if read < buffer.len() {
            break;
        }
    }

    Ok(hashes)
}

/// Reads up to `buf.len()` bytes, stopping early only at EOF (unlike
/// `Read::read`, which may return short reads on some fallible readers).
fn read_full_or_partial<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod test {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::io::Cursor;

    fn digest_of(bytes: &[u8]) -> Hash {
        let mut h = Sha256::new();
        h.update(bytes);
        Hash::new(h.finalize().into())
    }

    fn hash_all(data: Vec<u8>, blocksize: u64) -> Vec<Hash> {
        let cancel = AtomicBool::new(false);
        hash_reader(Cursor::new(data), blocksize, Path::new("mem"), &cancel).unwrap()
    }

    #[test]
    fn ten_bytes_blocksize_four_yields_three_hashes() {
        let data: Vec<u8> = (0u8..10).collect();
        let hashes = hash_all(data.clone(), 4);
        assert_eq!(hashes.len(), 3);
        assert_eq!(hashes[0], digest_of(&data[0..4]));
        assert_eq!(hashes[1], digest_of(&data[4..8]));
        assert_eq!(hashes[2], digest_of(&data[8..10]));
    }

    #[test]
    fn empty_file_yields_no_hashes() {
        assert!(hash_all(Vec::new(), 4).is_empty());
    }

    #[test]
    fn exact_multiple_of_blocksize_has_no_trailing_empty_block() {
        assert_eq!(hash_all(vec![0u8; 8], 4).len(), 2);
    }

    #[test]
    fn duplicate_blocks_hash_identically() {
        let mut block = vec![7u8; 4096];
        block.extend_from_slice(&vec![7u8; 4096]);
        let hashes = hash_all(block, 4096);
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes[0], hashes[1]);
    }

    #[test]
    fn cancellation_between_blocks_aborts_file() {
        let cancel = AtomicBool::new(true);
        let data = vec![1u8; 16];
        let result = hash_reader(Cursor::new(data), 4, Path::new("mem"), &cancel);
        assert!(matches!(result, Err(HasherError::Cancelled { .. })));
    }
}
