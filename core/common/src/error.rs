//! Common error types for Stowage.

use std::fmt;

use thiserror::Error;

/// Top-level error type for Stowage operations.
///
/// Leaf variants form the taxonomy callers test against; the wrapper
/// variants (`Backend`, `DiskInit`, `MaxRetriesExceeded`) add context
/// without hiding the root cause. Use [`Error::kind`] rather than matching
/// on wrappers directly.
#[derive(Debug, Error)]
pub enum Error {
    /// Object or resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The backend refused access.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Key is empty, malformed or escapes the backend root.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Capability not supported by the active backend.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// The backend has been closed.
    #[error("Storage is closed")]
    Closed,

    /// A driver with this name is already registered.
    #[error("Driver '{0}' is already registered")]
    DuplicateDriver(String),

    /// No driver registered under this name.
    #[error("Unknown driver '{0}' (is the driver registered before the manager resolves it?)")]
    UnknownDriver(String),

    /// Disk name absent from the configuration.
    #[error("Disk '{0}' is not configured")]
    DiskNotConfigured(String),

    /// Empty disk name requested and no default disk configured.
    #[error("No default disk configured")]
    NoDefaultConfigured,

    /// Configuration could not be parsed or materialized.
    #[error("Config parse error: {0}")]
    ConfigParse(String),

    /// Embedded configuration key path is missing.
    #[error("Config key '{0}' not found")]
    KeyNotFound(String),

    /// Invalid argument supplied by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation was cancelled before it started or while waiting.
    #[error("Operation cancelled")]
    Cancelled,

    /// The process-wide default manager has not been set up.
    #[error("Storage not initialized (call setup first)")]
    NotInitialized,

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Backend error annotated with the operation that produced it.
    #[error("{driver} {op} [{key}]: {source}")]
    Backend {
        driver: String,
        op: &'static str,
        key: String,
        #[source]
        source: Box<Error>,
    },

    /// Factory failed while constructing a disk.
    #[error("Failed to open disk '{disk}': {source}")]
    DiskInit {
        disk: String,
        #[source]
        source: Box<Error>,
    },

    /// All retry attempts failed; carries the last failure.
    #[error("Max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// One or more disks failed to close.
    #[error("Failed to close {}", CloseFailures(.failures))]
    Close { failures: Vec<(String, Error)> },
}

/// Error categories, independent of the context wrappers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    PermissionDenied,
    InvalidKey,
    NotImplemented,
    Closed,
    DuplicateDriver,
    UnknownDriver,
    DiskNotConfigured,
    NoDefaultConfigured,
    ConfigParse,
    KeyNotFound,
    InvalidArgument,
    Cancelled,
    NotInitialized,
    Io,
    Storage,
    Close,
}

impl Error {
    /// Wrap a backend error with operation context.
    pub fn backend(
        driver: impl Into<String>,
        op: &'static str,
        key: impl Into<String>,
        source: Error,
    ) -> Self {
        Error::Backend {
            driver: driver.into(),
            op,
            key: key.into(),
            source: Box::new(source),
        }
    }

    /// Innermost error, skipping context wrappers.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Backend { source, .. }
            | Error::DiskInit { source, .. }
            | Error::MaxRetriesExceeded { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Category of the root cause.
    ///
    /// I/O errors with a recognizable kind map onto the matching category,
    /// so a missing file reads as `NotFound` regardless of the backend.
    pub fn kind(&self) -> ErrorKind {
        match self.root_cause() {
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Error::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Error::InvalidKey(_) => ErrorKind::InvalidKey,
            Error::NotImplemented(_) => ErrorKind::NotImplemented,
            Error::Closed => ErrorKind::Closed,
            Error::DuplicateDriver(_) => ErrorKind::DuplicateDriver,
            Error::UnknownDriver(_) => ErrorKind::UnknownDriver,
            Error::DiskNotConfigured(_) => ErrorKind::DiskNotConfigured,
            Error::NoDefaultConfigured => ErrorKind::NoDefaultConfigured,
            Error::ConfigParse(_) => ErrorKind::ConfigParse,
            Error::KeyNotFound(_) => ErrorKind::KeyNotFound,
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::NotInitialized => ErrorKind::NotInitialized,
            Error::Io(err) => match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::NotFound,
                std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                _ => ErrorKind::Io,
            },
            Error::Storage(_) => ErrorKind::Storage,
            Error::Close { .. } => ErrorKind::Close,
            // root_cause never returns a wrapper
            Error::Backend { .. } | Error::DiskInit { .. } | Error::MaxRetriesExceeded { .. } => {
                ErrorKind::Storage
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub fn is_permission_denied(&self) -> bool {
        self.kind() == ErrorKind::PermissionDenied
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

struct CloseFailures<'a>(&'a [(String, Error)]);

impl fmt::Display for CloseFailures<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} disk(s)", self.0.len())?;
        for (disk, err) in self.0 {
            write!(f, "; {}: {}", disk, err)?;
        }
        Ok(())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
