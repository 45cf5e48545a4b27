//! Session error taxonomy.
//!
//! Every variant is recoverable: the session reports it through the status
//! line and stays interactive.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    /// The user asked for something the current state does not allow.
    #[error("{0}")]
    Precondition(String),

    /// Endpoint selection, port open or handshake failed.
    #[error("{0}")]
    Connect(String),

    #[error("No firmware available for the selected device and board version")]
    Catalog,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Writing or resetting the device failed.
    #[error("{0}")]
    Write(String),

    /// The serial log stream failed.
    #[error("{0}")]
    Read(String),

    #[error("Failed to export logs: {0}")]
    Export(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl SessionError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }
}

/// Firmware fetch failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Failed to load firmware file (HTTP {0})")]
    Status(u16),

    #[error("Failed to load firmware file: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to load firmware file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid firmware location: {0}")]
    Locator(String),
}
