//! The in-memory ordered set of hashes known to have been submitted,
//! reconciled with a persistent local store.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;

use crate::hash::{Hash, HASH_LEN};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `StorageUnavailable` at startup, degraded-but-alive at runtime — see
/// [`HashIndex::flush`].
#[derive(Debug, thiserror::Error)]
pub enum HashIndexError {
    /// The local store could not be opened; fatal at startup.
    #[error("hash store unavailable: {0}")]
    StorageUnavailable(#[from] std::io::Error),
}

/// The "local storage DB" external collaborator from the original spec's
/// interface list: `open`, `load_all_known_hashes`, `record_hash_batch`,
/// `close`.
pub trait HashStore {
    /// Return every hash persisted so far, in no particular order.
    fn load_all_known_hashes(&mut self) -> Result<Vec<Hash>, HashIndexError>;
    /// Persist a batch of hashes. Idempotent per hash.
    fn record_hash_batch(&mut self, hashes: &[Hash]) -> Result<(), HashIndexError>;
}

/// A `HashStore` backed by a flat, sorted, append-free file of 32-byte
/// records under `dircache`. Rewritten in full (in sorted order, for
/// deterministic iteration) on every flush — there is no live database
/// dependency in this rewrite's stack, so this is the simplest persistence
/// that satisfies "idempotent per hash" and deterministic ordering.
pub struct FlatFileHashStore {
    path: PathBuf,
}

impl FlatFileHashStore {
    /// Open (or prepare to create) the hash store at `dircache/dbname`.
    pub fn open(dircache: &Path, dbname: &str) -> Result<Self, HashIndexError> {
        std::fs::create_dir_all(dircache)?;
        Ok(Self {
            path: dircache.join(dbname),
        })
    }
}

impl HashStore for FlatFileHashStore {
    fn load_all_known_hashes(&mut self) -> Result<Vec<Hash>, HashIndexError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(bytes
            .chunks_exact(HASH_LEN)
            .filter_map(Hash::from_slice)
            .collect())
    }

    fn record_hash_batch(&mut self, hashes: &[Hash]) -> Result<(), HashIndexError> {
        let mut all: BTreeSet<Hash> = self.load_all_known_hashes()?.into_iter().collect();
        all.extend(hashes.iter().copied());
        let mut buf = Vec::with_capacity(all.len() * HASH_LEN);
        for h in &all {
            buf.extend_from_slice(h.as_bytes());
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &buf)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Process-wide ordered set of hashes known to have been submitted.
///
/// Built at startup from the local store, then mutated only through
/// [`HashIndex::insert_if_absent`]; entries are never removed during normal
/// operation. Internally an ordered `BTreeSet<Hash>` (O(log n) lookup,
/// unsigned byte-wise ordering) guarded by a single mutex — reads and writes
/// both go through it, since this index is mutated far more often than it
/// would benefit from a reader/writer split.
pub struct HashIndex {
    inner: Mutex<Inner>,
}

struct Inner {
    known: BTreeSet<Hash>,
    pending: Vec<Hash>,
    backoff: Duration,
}

impl HashIndex {
    /// Build a populated index from everything the store has persisted so
    /// far. Fatal (`StorageUnavailable`) if the store cannot be read.
    pub fn load_all(store: &mut dyn HashStore) -> Result<Self, HashIndexError> {
        let known: BTreeSet<Hash> = store.load_all_known_hashes()?.into_iter().collect();
        Ok(Self {
            inner: Mutex::new(Inner {
                known,
                pending: Vec::new(),
                backoff: INITIAL_BACKOFF,
            }),
        })
    }

    /// Pure membership check.
    pub fn seen(&self, hash: &Hash) -> bool {
        self.inner.lock().known.contains(hash)
    }

    /// Insert `hash` if absent, returning whether it was new. Newly-inserted
    /// hashes are appended to the pending-persist buffer for the next
    /// [`HashIndex::flush`].
    pub fn insert_if_absent(&self, hash: Hash) -> bool {
        let mut inner = self.inner.lock();
        let was_new = inner.known.insert(hash);
        if was_new {
            inner.pending.push(hash);
        }
        was_new
    }

    /// Number of hashes known to the index (mostly for tests and metrics).
    pub fn len(&self) -> usize {
        self.inner.lock().known.len()
    }

    /// Atomically write the pending buffer to `store` and clear it.
    ///
    /// On failure the index is left "degraded": in-memory lookups stay
    /// correct, but the pending buffer is retained and retried on the next
    /// call after an exponential backoff (1s, 2s, 4s, capped at 30s). The
    /// backoff resets to 1s as soon as a flush succeeds.
    pub fn flush(&self, store: &mut dyn HashStore) -> Result<(), HashIndexError> {
        let pending = {
            let inner = self.inner.lock();
            inner.pending.clone()
        };
        if pending.is_empty() {
            return Ok(());
        }
        match store.record_hash_batch(&pending) {
            Ok(()) => {
                let mut inner = self.inner.lock();
                inner.pending.clear();
                inner.backoff = INITIAL_BACKOFF;
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.backoff = (inner.backoff * 2).min(MAX_BACKOFF);
                Err(e)
            }
        }
    }

    /// The backoff duration the next failed flush would wait before the
    /// caller retries (exposed for the lifecycle controller's retry loop).
    pub fn current_backoff(&self) -> Duration {
        self.inner.lock().backoff
    }
}
