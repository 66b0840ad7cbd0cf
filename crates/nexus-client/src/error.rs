//! Error types for the Nexus client

use std::fmt;

/// Errors that can occur when talking to the Nexus repository
#[derive(Debug)]
pub enum NexusError {
    /// HTTP request failed
    Http(Box<reqwest::Error>),
    /// Reading the local artifact failed
    Io(Box<std::io::Error>),
    /// The configured repository URL cannot be used
    InvalidEndpoint(String),
    /// Nexus answered with a non-success status
    Status { status: u16, url: String },
}

impl fmt::Display for NexusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "Nexus HTTP error: {}", e),
            Self::Io(e) => write!(f, "Nexus upload IO error: {}", e),
            Self::InvalidEndpoint(msg) => write!(f, "Invalid Nexus endpoint: {}", msg),
            Self::Status { status, url } => write!(f, "Nexus returned status {} for {}", status, url),
        }
    }
}

impl std::error::Error for NexusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Http(e) => Some(e.as_ref()),
            Self::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for NexusError {
    fn from(e: reqwest::Error) -> Self {
        Self::Http(Box::new(e))
    }
}

impl From<std::io::Error> for NexusError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Box::new(e))
    }
}

/// Result type for Nexus operations
pub type Result<T> = std::result::Result<T, NexusError>;
