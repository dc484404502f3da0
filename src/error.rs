//! Crate-wide error type. Everything bubbles to the command layer and
//! terminates the process with a non-zero exit code.

use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by kestrel.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error with the offending path.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Invalid configuration (bad shape, window < span, zero threads, ...).
    #[error("Invalid configuration: {0}")]
    Config(String),
    /// Malformed index archive (wrong version, compressed flag, short read).
    #[error("Invalid index: {0}")]
    Format(String),
    /// Malformed layout file.
    #[error("Invalid layout: {0}")]
    Layout(String),
    /// Malformed sequence or minimizer input.
    #[error("Invalid input: {0}")]
    Input(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
