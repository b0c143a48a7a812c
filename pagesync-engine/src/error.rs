//! Error types for the sync engine library

use pagesync_store::StoreError;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Comprehensive error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Content-store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A required page could not be found by title
    #[error("Page not found: \"{title}\" in space \"{space}\"")]
    PageNotFound { space: String, title: String },

    /// Storage-format parse or shape errors
    #[error("Storage format error: {0}")]
    Storage(String),

    /// Worker task errors (panics, closed pool)
    #[error("Task error: {0}")]
    Task(String),

    /// Logic invariant violations; always indicate a bug
    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl SyncError {
    /// Create a new page-not-found error
    pub fn page_not_found(space: impl Into<String>, title: impl Into<String>) -> Self {
        Self::PageNotFound {
            space: space.into(),
            title: title.into(),
        }
    }

    /// Create a new storage format error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a new invariant violation error
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }
}

impl From<quick_xml::Error> for SyncError {
    fn from(error: quick_xml::Error) -> Self {
        Self::Storage(error.to_string())
    }
}
