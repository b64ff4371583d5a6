//! Client-side carving, hashing and change-monitoring core for a
//! content-addressed backup agent.
//!
//! This crate implements the algorithmic core only: carving configured
//! directory subtrees, hashing regular files block-by-block, watching for
//! modifications via a kernel notification mechanism, maintaining a local
//! index of already-submitted hashes, and feeding finished captures to a
//! pluggable transport sink through a small bounded pipeline. The wire
//! protocol spoken to a real backup server, server-side deduplication, and
//! encryption are all out of scope; [`pipeline::TransportSink`] and
//! [`hash_index::HashStore`] are the seams where a real implementation of
//! each would plug in.

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

pub mod carver;
pub mod config;
pub mod hash;
pub mod hash_index;
pub mod hasher;
pub mod metadata;
pub mod monitor;
pub mod path_encoding;
pub mod pipeline;

pub use carver::{Carver, CarverError, MetaSink};
pub use config::{ConfigError, ConfigRecord, DEFAULT_BLOCKSIZE};
pub use hash::Hash;
pub use hash_index::{FlatFileHashStore, HashIndex, HashIndexError, HashStore};
pub use hasher::{HasherError, hash_file, hash_file_cancelable};
pub use metadata::{FileType, MetaData};
pub use monitor::{ChangeEvent, ChangeMonitor, EventKind, MonitorError, MonitorState, RecarveSink};
pub use path_encoding::{decode_path_lossless, encode_path_lossless};
pub use pipeline::{
    LifecycleController, LoggingTransport, PipelineError, QueueItem, StoreItem, TransportOutcome,
    TransportSink,
};

/// Aggregates every component's error enum behind one type, so `main.rs`
/// can use a single `Result<(), AgentError>` return type and let `?`
/// convert freely across component boundaries.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The local hash store could not be read or written.
    #[error(transparent)]
    HashIndex(#[from] HashIndexError),
    /// The change-notification backend failed.
    #[error(transparent)]
    Monitor(#[from] MonitorError),
    /// The pipeline or lifecycle controller failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}
