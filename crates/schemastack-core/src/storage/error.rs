//! Storage error handling
//!
//! Typed errors for the SQLite storage engine, with descriptive messages
//! and recovery suggestions.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::value::AttributeKind;

/// Errors that can occur inside the storage engine
#[derive(Error, Debug)]
pub enum StorageError {
    /// Failed to create the directory holding a store
    #[error("Failed to create store directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Permission denied accessing path
    #[error("Permission denied: cannot access '{path}'. Check file permissions.")]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Disk is full or quota exceeded
    #[error(
        "Disk full or quota exceeded while writing to '{path}'. Free up disk space and try again."
    )]
    DiskFull {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Generic file system failure with path context
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Store file not found (when expected to exist)
    #[error("Store not found: '{path}'")]
    NotFound { path: PathBuf },

    /// Store file already exists (when creating a fresh store)
    #[error("Store already exists: '{path}'")]
    AlreadyExists { path: PathBuf },

    /// The store is already open by another handle in this process
    #[error("Store '{path}' is already open")]
    AlreadyOpen { path: PathBuf },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Store metadata is missing or cannot be decoded
    #[error("Invalid store metadata in '{path}': {details}")]
    Metadata { path: PathBuf, details: String },

    /// Store was written under a different schema than the one it is opened with
    #[error("Store '{path}' was written by model '{store_model}' and cannot be opened with '{model}'")]
    IncompatibleModel {
        path: PathBuf,
        store_model: String,
        model: String,
    },

    /// Entity is not part of the store's model
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    /// Attribute or relationship is not part of the entity
    #[error("Unknown property '{property}' on entity '{entity}'")]
    UnknownProperty { entity: String, property: String },

    /// Value does not match the declared attribute kind
    #[error("'{entity}.{property}' expects {expected}, got {found}")]
    TypeMismatch {
        entity: String,
        property: String,
        expected: AttributeKind,
        found: String,
    },

    /// Required property has no value and no default
    #[error("'{entity}.{property}' is required")]
    MissingValue { entity: String, property: String },

    /// Relationship points at a record that does not exist
    #[error("'{entity}.{property}' references missing {destination} record {key}")]
    DanglingReference {
        entity: String,
        property: String,
        destination: String,
        key: i64,
    },

    /// Record has no location (was never saved)
    #[error("Record of entity '{0}' has not been saved")]
    Unsaved(String),
}

impl StorageError {
    /// Create an error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        match error.kind() {
            io::ErrorKind::PermissionDenied => StorageError::PermissionDenied {
                path,
                source: error,
            },
            io::ErrorKind::NotFound => StorageError::NotFound { path },
            _ if is_disk_full_error(&error) => StorageError::DiskFull {
                path,
                source: error,
            },
            _ => StorageError::Io {
                path,
                source: error,
            },
        }
    }

    /// Check if the caller can reasonably retry after fixing the environment
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DiskFull { .. }
                | StorageError::PermissionDenied { .. }
                | StorageError::AlreadyOpen { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::DiskFull { .. } => Some("Free up disk space and try again."),
            StorageError::PermissionDenied { .. } => {
                Some("Check file and directory permissions on the data directory.")
            }
            StorageError::CreateDirectory { .. } => {
                Some("Check that the parent directory exists and you have write permissions.")
            }
            StorageError::AlreadyOpen { .. } => {
                Some("Close the other handle to this store before opening it again.")
            }
            StorageError::Metadata { .. } => {
                Some("The store header is unreadable. Restore the store from a backup.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
