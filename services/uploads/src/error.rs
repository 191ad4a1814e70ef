use std::time::Duration;
use thiserror::Error;

/// Capability token verification failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed token: {0}")]
    Malformed(String),

    #[error("Invalid token signature")]
    BadSignature,

    #[error("Token has expired")]
    Expired,

    #[error("Token scope {actual:?} does not permit {expected:?}")]
    WrongScope { expected: String, actual: String },

    #[error("Token subject does not own this resource")]
    NotOwner,
}

/// Object store and catalog I/O failures
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object {bucket}/{key} not found")]
    ObjectNotFound { bucket: String, key: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    #[error("Unknown region: {0}")]
    UnknownRegion(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        StorageError::Catalog(e.to_string())
    }
}

/// Media transcoder failures
#[derive(Error, Debug)]
pub enum TranscodeError {
    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Failed to decode media: {0}")]
    Decode(String),

    #[error("Failed to encode media: {0}")]
    Encode(String),

    #[error("Transcode timed out after {0:?}")]
    Timeout(Duration),
}

/// Errors surfaced by the uploads engine
#[derive(Error, Debug)]
pub enum UploadsError {
    #[error("Unauthorized: {0}")]
    Unauthorized(#[from] AuthError),

    #[error("File not found")]
    NotFound,

    #[error("File is blocked")]
    Blocked,

    #[error("File is already claimed")]
    AlreadyClaimed,

    #[error("File belongs to a different bucket")]
    MismatchedBucket,

    #[error("File too large: {size} bytes exceeds limit of {max} bytes")]
    TooLarge { size: u64, max: u64 },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
}

impl UploadsError {
    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadsError::StorageUnavailable(StorageError::Timeout { .. })
                | UploadsError::StorageUnavailable(StorageError::ObjectStore(_))
                | UploadsError::StorageUnavailable(StorageError::Catalog(_))
        )
    }

    /// Stable machine-readable code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            UploadsError::Unauthorized(_) => "UNAUTHORIZED",
            UploadsError::NotFound => "NOT_FOUND",
            UploadsError::Blocked => "BLOCKED",
            UploadsError::AlreadyClaimed => "ALREADY_CLAIMED",
            UploadsError::MismatchedBucket => "MISMATCHED_BUCKET",
            UploadsError::TooLarge { .. } => "TOO_LARGE",
            UploadsError::UnsupportedMediaType(_) => "UNSUPPORTED_MEDIA_TYPE",
            UploadsError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
        }
    }
}

impl From<TranscodeError> for UploadsError {
    fn from(e: TranscodeError) -> Self {
        match e {
            TranscodeError::UnsupportedMediaType(mime) => UploadsError::UnsupportedMediaType(mime),
            TranscodeError::Timeout(after) => UploadsError::StorageUnavailable(StorageError::Timeout {
                operation: "transcode",
                after,
            }),
            other => UploadsError::UnsupportedMediaType(other.to_string()),
        }
    }
}

pub type Result<T, E = UploadsError> = std::result::Result<T, E>;
