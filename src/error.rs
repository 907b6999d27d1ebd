use std::io;
use std::path::PathBuf;
use std::result;

/// Custom result type for storage operations
pub type Result<T> = result::Result<T, Error>;

/// Storage engine errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Underlying file operation failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Memory map could not be created
    #[error("failed to map {path}: {source}")]
    Map {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// File could not be grown, disk space may be low
    #[error("failed to resize {path} to {size} bytes: {source}")]
    Resize {
        path: PathBuf,
        size: u64,
        #[source]
        source: io::Error,
    },
    /// Mapped file is not started or already closed
    #[error("mapped file {0} is closed")]
    FileClosed(PathBuf),
    /// Mapped file was stopped and may no longer grow
    #[error("mapped file {0} is stopped")]
    FileStopped(PathBuf),
    /// Mapped file was started twice
    #[error("mapped file {0} is already started")]
    AlreadyStarted(PathBuf),
    /// Another process holds the database directory
    #[error("database directory is locked by another process: {0}")]
    AlreadyLocked(PathBuf),
    /// File contents disagree with the persisted counters
    #[error("corrupted store: {0}")]
    Corrupted(String),
    /// Settings cannot be used to open a store
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Value does not fit the fixed row layout
    #[error("value of {size} bytes exceeds the {max} byte limit for {what}")]
    BadValueSize {
        what: &'static str,
        size: usize,
        max: usize,
    },
    /// In-place update of a missing key
    #[error("key not found")]
    KeyNotFound,
    /// Slab read past the allocation frontier
    #[error("offset {offset} is past the end of the payload ({size})")]
    OutOfBounds { offset: u64, size: u64 },
    /// Offset arithmetic overflowed
    #[error("offset arithmetic overflow")]
    Overflow,
    /// Multimap key has no rows left to delete
    #[error("no rows to delete for key")]
    EmptyChain,
    /// Coordinator logic issued an operation that breaks an index invariant
    #[error("invariant violated: {0}")]
    Invariant(String),
    /// Pop requested with nothing above genesis
    #[error("chain is empty above genesis")]
    ChainEmpty,
    /// Optimistic read kept observing concurrent writes
    #[error("read did not observe a stable snapshot after {0} attempts")]
    ReadConflict(usize),
}

impl Error {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("{}", message);
        Error::Invariant(message)
    }
}
