//! Error types for the blob store

use std::fmt;

#[derive(Debug)]
pub enum BlobStoreError {
    Io(Box<std::io::Error>),
    /// A chunk file could not be attributed to an offset
    InvalidChunk(String),
}

impl fmt::Display for BlobStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobStoreError::Io(err) => write!(f, "Blob store IO error: {}", err),
            BlobStoreError::InvalidChunk(name) => write!(f, "Invalid chunk file: {}", name),
        }
    }
}

impl std::error::Error for BlobStoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BlobStoreError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for BlobStoreError {
    fn from(err: std::io::Error) -> Self {
        BlobStoreError::Io(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, BlobStoreError>;
