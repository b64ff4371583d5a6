//! The read-only configuration record the core is handed at startup.
//!
//! Parsing CLI flags and config files is out of scope for the core (see the
//! crate-level docs); this module only defines the record shape the rest of
//! the agent consumes. `backup-agentd`'s `main.rs` is responsible for
//! populating one.

use std::path::PathBuf;

/// Default block size used to chunk regular files for hashing: 16 KiB.
pub const DEFAULT_BLOCKSIZE: u64 = 16 * 1024;

/// Immutable, process-wide configuration handed to the core at startup.
#[derive(Debug, Clone)]
pub struct ConfigRecord {
    /// Absolute paths of the subtrees to carve and monitor.
    pub dirname_list: Vec<PathBuf>,
    /// Block size, in bytes, used by the Block Hasher. Must be positive.
    pub blocksize: u64,
    /// Directory used for the local hash cache and flat-file hash store.
    pub dircache: PathBuf,
    /// File name of the local database within `dircache`.
    pub dbname: String,
    /// Remote storage service host.
    pub host: String,
    /// Remote storage service port.
    pub port: u16,
}

impl ConfigRecord {
    /// Validate invariants that the rest of the core relies on holding for
    /// the whole process lifetime (`ConfigInvalid` is fatal at startup).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.blocksize == 0 {
            return Err(ConfigError::InvalidBlocksize(self.blocksize));
        }
        if self.dirname_list.is_empty() {
            return Err(ConfigError::NoDirectories);
        }
        for dir in &self.dirname_list {
            if !dir.is_absolute() {
                return Err(ConfigError::NotAbsolute(dir.clone()));
            }
        }
        Ok(())
    }
}

/// `ConfigInvalid` from the error taxonomy: fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// `blocksize` must be a positive integer.
    #[error("blocksize must be positive, got {0}")]
    InvalidBlocksize(u64),
    /// At least one directory must be configured.
    #[error("no directories configured to monitor")]
    NoDirectories,
    /// Every configured directory must be an absolute path.
    #[error("configured directory is not absolute: {}", .0.display())]
    NotAbsolute(PathBuf),
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample() -> ConfigRecord {
        ConfigRecord {
            dirname_list: vec![PathBuf::from("/tmp/t1")],
            blocksize: DEFAULT_BLOCKSIZE,
            dircache: PathBuf::from("/tmp/cache"),
            dbname: "hashes.db".to_string(),
            host: "localhost".to_string(),
            port: 9999,
        }
    }

    #[test]
    fn rejects_zero_blocksize() {
        let mut cfg = sample();
        cfg.blocksize = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidBlocksize(0))));
    }

    #[test]
    fn rejects_empty_directory_list() {
        let mut cfg = sample();
        cfg.dirname_list.clear();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoDirectories)));
    }

    #[test]
    fn rejects_relative_directory() {
        let mut cfg = sample();
        cfg.dirname_list.push(PathBuf::from("relative/path"));
        assert!(matches!(cfg.validate(), Err(ConfigError::NotAbsolute(_))));
    }

    #[test]
    fn accepts_valid_config() {
        assert!(sample().validate().is_ok());
    }
}
