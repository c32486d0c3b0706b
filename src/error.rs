//! Error types for package operations

use crate::package::index::ResourceKey;
use thiserror::Error;

/// Main error type for DBPF package operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid DBPF package: {0}")]
    Format(String),

    #[error("Unsupported DBPF version {major}.{minor} (expected 2.1)")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("Corrupt resource data: {0}")]
    Corrupt(String),

    #[error("Resource {0} already exists")]
    DuplicateKey(ResourceKey),

    #[error("Resource {0} not found")]
    NotFound(ResourceKey),

    #[error("Package was opened read-only")]
    ReadOnly,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<binrw::Error> for Error {
    fn from(err: binrw::Error) -> Self {
        match err {
            binrw::Error::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Error::Format("unexpected end of data".to_string())
            }
            binrw::Error::Io(e) => Error::Io(e),
            other => Error::Format(other.to_string()),
        }
    }
}

/// Result type alias for package operations
pub type Result<T> = std::result::Result<T, Error>;
