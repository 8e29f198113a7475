//! I/O error types.

use thiserror::Error;

/// Result type for I/O operations.
pub type Result<T> = std::result::Result<T, Error>;

/// I/O error types.
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HDF5 library error.
    #[cfg(feature = "hdf5")]
    #[error("HDF5 error: {0}")]
    Hdf5(#[from] hdf5::Error),

    /// Rejected submission or configuration.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Invalid file format.
    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    /// Storage backend misuse or failure.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Batches reached the writer in an inconsistent order.
    #[error("internal sequencing error: {0}")]
    Sequencing(String),

    /// The writer thread has already stopped.
    #[error("writer thread stopped after an earlier error")]
    WriterStopped,

    /// The writer thread panicked.
    #[error("writer thread panicked")]
    WriterPanicked,

    /// Core library error.
    #[error("core error: {0}")]
    CoreError(#[from] imswrite_core::Error),
}
