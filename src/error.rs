//! Error types for Hoard.

use thiserror::Error;

/// Stable classification of a [`HoardError`].
///
/// Collaborators (HTTP layer, WebDAV adapter, share service) map this onto
/// their own status codes instead of matching on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    OwnerNotFound,
    QuotaExceeded,
    InvalidPolicyConfig,
    UnsupportedPolicyType,
    BackendWrite,
    BackendRead,
    BackendAuth,
    InvalidMove,
    Validation,
    Conflict,
    Cancelled,
    Internal,
}

impl ErrorKind {
    /// Machine-readable name of the error kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::OwnerNotFound => "owner_not_found",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::InvalidPolicyConfig => "invalid_policy_config",
            ErrorKind::UnsupportedPolicyType => "unsupported_policy_type",
            ErrorKind::BackendWrite => "backend_write",
            ErrorKind::BackendRead => "backend_read",
            ErrorKind::BackendAuth => "backend_auth",
            ErrorKind::InvalidMove => "invalid_move",
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Common error type for Hoard.
#[derive(Error, Debug)]
pub enum HoardError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant.
    #[error("database error: {0}")]
    Database(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Node, version or policy absent, or not owned by the caller.
    #[error("{0} not found")]
    NotFound(String),

    /// The owner record does not exist.
    #[error("owner {0} not found")]
    OwnerNotFound(i64),

    /// Pre-flight quota check failed.
    #[error("quota exceeded: {requested} bytes requested, {available} bytes available")]
    QuotaExceeded { requested: i64, available: i64 },

    /// Storage policy configuration does not match its type.
    #[error("invalid storage policy config: {0}")]
    InvalidPolicyConfig(String),

    /// Storage policy type tag is unknown.
    #[error("unsupported storage policy type: {0}")]
    UnsupportedPolicyType(String),

    /// Backend failed to store bytes.
    #[error("backend write error: {0}")]
    BackendWrite(String),

    /// Backend failed to produce bytes.
    #[error("backend read error: {0}")]
    BackendRead(String),

    /// Backend rejected our credentials.
    #[error("backend authorization error: {0}")]
    BackendAuth(String),

    /// Structural namespace violation.
    #[error("invalid move: {0}")]
    InvalidMove(String),

    /// Validation error for caller input.
    #[error("validation error: {0}")]
    Validation(String),

    /// The node changed underneath a content update.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Archive writer error during batch export.
    #[error("archive error: {0}")]
    Archive(String),

    /// Operation cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,
}

impl HoardError {
    /// Stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HoardError::NotFound(_) => ErrorKind::NotFound,
            HoardError::OwnerNotFound(_) => ErrorKind::OwnerNotFound,
            HoardError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            HoardError::InvalidPolicyConfig(_) => ErrorKind::InvalidPolicyConfig,
            HoardError::UnsupportedPolicyType(_) => ErrorKind::UnsupportedPolicyType,
            HoardError::BackendWrite(_) => ErrorKind::BackendWrite,
            HoardError::BackendRead(_) => ErrorKind::BackendRead,
            HoardError::BackendAuth(_) => ErrorKind::BackendAuth,
            HoardError::InvalidMove(_) => ErrorKind::InvalidMove,
            HoardError::Validation(_) | HoardError::Config(_) => ErrorKind::Validation,
            HoardError::Conflict(_) => ErrorKind::Conflict,
            HoardError::Cancelled => ErrorKind::Cancelled,
            HoardError::Database(_) | HoardError::Io(_) | HoardError::Archive(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Shorthand for a not-found error on a file node.
    pub fn node_not_found(id: i64) -> Self {
        HoardError::NotFound(format!("file {id}"))
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for HoardError {
    fn from(e: sqlx::Error) -> Self {
        HoardError::Database(e.to_string())
    }
}

/// Result type alias for Hoard operations.
pub type Result<T> = std::result::Result<T, HoardError>;
