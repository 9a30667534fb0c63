use thiserror::Error;

/// A convenience `Result` alias using [`MemdexError`].
pub type MemdexResult<T> = Result<T, MemdexError>;

/// Top-level error type for memdex.
///
/// Each variant corresponds to a subsystem that can produce errors.
#[derive(Error, Debug)]
pub enum MemdexError {
    /// A failure inside the storage engine (SQL error, aborted transaction).
    #[error("Storage error: {0}")]
    Storage(String),

    /// An operation was attempted on a component that was never initialized
    /// or has already been closed. This is a programming error.
    #[error("Not initialized: {0}")]
    NotInitialized(String),

    /// The embedding provider failed or returned an unusable vector.
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// A file could not be chunked or indexed.
    #[error("Index error: {0}")]
    Index(String),

    /// The filesystem watcher could not be started or failed while running.
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// Caller supplied an argument the engine refuses to act on.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
