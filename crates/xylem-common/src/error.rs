//! Error types for the xylem record store.

use crate::address::VirtualAddress;
use crate::page::PageId;
use thiserror::Error;

/// Result type alias using XylemError.
pub type Result<T> = std::result::Result<T, XylemError>;

/// Errors that can occur in record store operations.
#[derive(Debug, Error)]
pub enum XylemError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store is opened read-only")]
    ReadOnly,

    // Structural errors
    #[error("Corruption on page {page}: {reason}")]
    Corruption { page: PageId, reason: String },

    #[error("Page not found: {page}")]
    PageNotFound { page: PageId },

    #[error("Tuple ids exhausted on page {page}")]
    PageExhausted { page: PageId },

    #[error("Page size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    // Cache errors
    #[error("Page cache full, every frame is pinned")]
    CacheFull,

    // Record errors
    #[error("Key already exists")]
    KeyExists,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Record not found: {address}")]
    RecordNotFound { address: VirtualAddress },

    #[error("Cannot remove forwarding link {address} directly")]
    LinkRemoval { address: VirtualAddress },

    #[error("Value too large: {size} bytes (max {max})")]
    ValueTooLarge { size: usize, max: usize },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl XylemError {
    /// Builds a corruption error for the given page.
    pub fn corruption(page: PageId, reason: impl Into<String>) -> Self {
        Self::Corruption {
            page,
            reason: reason.into(),
        }
    }

    /// Returns true if this error reports a structural invariant violation.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}
