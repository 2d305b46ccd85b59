//! Error types for vaultsync

use thiserror::Error;

/// Result type alias for vaultsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for vaultsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Remote page not found: {0}")]
    NotFound(String),

    #[error("Rate limited{}", .retry_after.map(|s| format!(": retry after {} seconds", s)).unwrap_or_default())]
    RateLimited { retry_after: Option<u64> },

    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Version conflict on page {page_id}: expected version {expected}{}", .actual.map(|v| format!(", remote is at {}", v)).unwrap_or_default())]
    VersionConflict {
        page_id: String,
        expected: i64,
        actual: Option<i64>,
    },

    #[error("Remote error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Conversion error: {0}")]
    Conversion(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Identity store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Frontmatter error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimited { .. } | SyncError::Transient(_)
        )
    }

    /// Errors that abort the whole run instead of a single document
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth(_) | SyncError::Database(_) | SyncError::Store(_)
        )
    }

    /// Short machine-friendly tag used in reports and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "auth",
            SyncError::NotFound(_) => "not_found",
            SyncError::RateLimited { .. } => "rate_limited",
            SyncError::Transient(_) => "transient",
            SyncError::VersionConflict { .. } => "version_conflict",
            SyncError::Remote { .. } => "remote",
            SyncError::Conversion(_) => "conversion",
            SyncError::Database(_) | SyncError::Store(_) => "store",
            SyncError::Io(_) => "io",
            SyncError::Serialization(_) | SyncError::Yaml(_) => "serialization",
            SyncError::Config(_) => "config",
            SyncError::Internal(_) => "internal",
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return SyncError::Remote {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        // Connect, timeout and body errors are all worth another attempt
        SyncError::Transient(e.to_string())
    }
}
