// blockstore - in-process block storage engine
// Growable block-addressed buffers with live handles and compaction

#![warn(rust_2018_idioms)]

pub mod config;
pub mod metrics;
pub mod storage;

// Re-exports for convenience
pub use config::EngineConfig;
pub use storage::{
    BlockRange, BlockStore, EngineStats, StorageKind, StoredBytes, StoredInputStream,
    StoredOutputStream,
};

/// Block store error types
///
/// Medium failures (I/O against the mapped file, bad configuration) are
/// reported here. Broken internal invariants are not errors: they panic.
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("I/O error: {0}")]
        Io(#[from] std::io::Error),

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Configuration error: {0}")]
        Config(String),

        #[error("Block store is closed")]
        Closed,
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::Error;

    #[test]
    fn test_error_messages() {
        let err = Error::InvalidArgument("block_size must be > 0".to_string());
        assert_eq!(err.to_string(), "Invalid argument: block_size must be > 0");
        assert_eq!(Error::Closed.to_string(), "Block store is closed");

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err: Error = io.into();
        assert!(err.to_string().contains("disk full"));
    }
}
