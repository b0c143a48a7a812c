use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Page or attachment not found")]
    NotFound,

    #[error("Server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Network(_) => true,
            StoreError::Server { status, .. } if *status >= 500 => true,
            _ => false,
        }
    }

    /// Errors that out-of-hierarchy discovery logs and skips instead of
    /// aborting the run: a broken or restricted external reference.
    pub fn is_skippable_reference(&self) -> bool {
        matches!(self, StoreError::NotFound | StoreError::PermissionDenied(_))
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
