//! Error types for catalogsync.
//!
//! Library crates use [`CatalogSyncError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.
//!
//! Only [`CatalogSyncError::Config`] is fatal to a run. Every other variant is
//! caught at the item boundary by the pipeline and surfaces in the run report.

use std::path::PathBuf;

/// Top-level error type for all catalogsync operations.
#[derive(Debug, thiserror::Error)]
pub enum CatalogSyncError {
    /// Missing or invalid configuration. Aborts the run before any I/O.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network failure or timeout while fetching a vendor page.
    #[error("fetch error: {0}")]
    Fetch(String),

    /// A response body that could not be decoded.
    #[error("malformed response: {message}")]
    MalformedResponse { message: String },

    /// Create/update/delete against the content service failed.
    #[error("content service error: {0}")]
    ContentService(String),

    /// Upsert/delete against the search index failed.
    #[error("index sync error: {0}")]
    IndexSync(String),

    /// Read/write against the commerce catalog failed.
    #[error("commerce catalog error: {0}")]
    Commerce(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (invariant violation, invalid format, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Another run holds the run lock.
    #[error("run lock held: {0}")]
    RunLocked(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CatalogSyncError>;

impl CatalogSyncError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a malformed-response error from any displayable message.
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedResponse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = CatalogSyncError::config("no approved vendors configured");
        assert_eq!(err.to_string(), "config error: no approved vendors configured");

        let err = CatalogSyncError::validation("duplicate vendor id 42 in batch");
        assert!(err.to_string().contains("duplicate vendor id 42"));
    }

    #[test]
    fn only_config_errors_are_fatal() {
        assert!(CatalogSyncError::config("x").is_fatal());
        assert!(!CatalogSyncError::Fetch("timeout".into()).is_fatal());
        assert!(!CatalogSyncError::IndexSync("503".into()).is_fatal());
        assert!(!CatalogSyncError::malformed("eof").is_fatal());
    }
}
