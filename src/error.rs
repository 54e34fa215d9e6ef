//! Error types for feed replication.

use thiserror::Error;

/// Main error type for feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown feed: {0}")]
    FeedNotFound(String),

    #[error("Entry not found: {0}")]
    EntryNotFound(String),

    /// A required wire element (or attribute) is absent. The message names
    /// the first one that was missing.
    #[error("{0}")]
    MissingElement(String),

    #[error("Malformed document: {0}")]
    Malformed(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Invalid entry: {0}")]
    InvalidEntry(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Hub request failed: {0}")]
    Hub(String),

    #[error("Hub rejected request with status {0}")]
    HubRejected(u16),

    /// The hub did not confirm within the deadline. Nothing was persisted and
    /// the request is safe to retry.
    #[error("Hub did not answer within {0:?}")]
    HubTimeout(std::time::Duration),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl FeedError {
    /// Whether the error was caused by the caller's input rather than by
    /// this instance or one of its collaborators.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            FeedError::MissingElement(_)
                | FeedError::Malformed(_)
                | FeedError::InvalidTimestamp(_)
                | FeedError::InvalidEntry(_)
        )
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

impl From<quick_xml::Error> for FeedError {
    fn from(e: quick_xml::Error) -> Self {
        FeedError::Malformed(e.to_string())
    }
}

impl From<chrono::ParseError> for FeedError {
    fn from(e: chrono::ParseError) -> Self {
        FeedError::InvalidTimestamp(e.to_string())
    }
}

/// Result type for feed operations.
pub type Result<T> = std::result::Result<T, FeedError>;
