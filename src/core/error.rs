use thiserror::Error;

/// Errors reported by a [`StorageClient`](crate::interface::StorageClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Bucket '{0}' already exists")]
    AlreadyExists(String),

    #[error("Bucket '{0}' not found")]
    NotFound(String),

    #[error("Bucket '{0}' is not empty yet")]
    NotEmpty(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Copy failed for {} object(s): {}", .0.len(), .0.join(", "))]
    PartialFailure(Vec<String>),

    #[error("Temporarily unavailable: {0}")]
    Transient(String),
}

impl StorageError {
    /// Whether the condition is expected to clear up without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::NotEmpty(_))
    }
}

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Lock error: {0}")]
    LockError(String),
}

pub type Result<T> = std::result::Result<T, MigrateError>;

/// Failure classes the engine distinguishes when deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
    Persistence,
    Configuration,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::Persistence => "persistence",
            Self::Configuration => "configuration",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MigrateError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Storage(err) if err.is_retryable() => FailureKind::Transient,
            Self::Storage(_) => FailureKind::Permanent,
            Self::Timeout(_) => FailureKind::Transient,
            Self::Persistence(_) | Self::LockError(_) => FailureKind::Persistence,
            Self::NotFound(_) => FailureKind::Permanent,
            Self::Configuration(_) => FailureKind::Configuration,
            Self::Cancelled => FailureKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }
}

impl<T> From<std::sync::PoisonError<T>> for MigrateError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}
