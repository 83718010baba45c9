//! Error types for the demo.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for demo operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the demo client and server.
#[derive(Debug, Error)]
pub enum Error {
    /// An RPC failed.
    #[error(transparent)]
    Rpc(#[from] proven_rpc::Error),

    /// The input file could not be read.
    #[error("cannot read input file {path:?}: {source}")]
    Input {
        /// File that was read.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}
