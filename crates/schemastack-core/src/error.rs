//! Error taxonomy
//!
//! Migration-stage errors ([`Error::is_fatal`]) mean the store cannot be
//! initialized; the host decides whether to stop, retry after operator
//! intervention, or show a recovery screen. Access-layer errors are scoped
//! to a single operation and leave the store usable.

use std::path::PathBuf;
use thiserror::Error;

use crate::mapping::MappingError;
use crate::storage::StorageError;

#[derive(Error, Debug)]
pub enum Error {
    /// The named schema model is not in the resource bundle
    #[error("Schema model '{name}' not found in resource bundle")]
    ModelNotFound { name: String },

    /// A model or mapping resource exists but cannot be parsed or validated
    #[error("Invalid resource '{resource}': {details}")]
    InvalidModel { resource: String, details: String },

    /// No bundled model version matches the store on disk
    #[error("No version of model '{model}' is compatible with store '{path}'")]
    NoCompatibleVersion { model: String, path: PathBuf },

    /// Neither an explicit nor an inferred mapping exists for a version pair
    #[error("No mapping from version {source_version} to {destination_version}: {reason}")]
    NoMappingAvailable {
        source_version: u32,
        destination_version: u32,
        #[source]
        reason: MappingError,
    },

    /// A migration step failed; the store was left at its original version
    #[error("Migration step {step} (version {source_version} -> {destination_version}) failed: {cause}")]
    MigrationStepFailed {
        step: usize,
        source_version: u32,
        destination_version: u32,
        #[source]
        cause: StorageError,
    },

    /// The engine could not open the store (after any migration)
    #[error("Failed to open store at '{path}': {source}")]
    StoreOpenFailed {
        path: PathBuf,
        #[source]
        source: StorageError,
    },

    /// Read or commit failure inside a single access operation
    #[error("Persistence error: {0}")]
    PersistenceError(#[from] StorageError),

    /// Identifier string is not a location minted by this store
    #[error("Malformed identifier '{0}'")]
    MalformedIdentifier(String),

    /// The store's execution context has shut down
    #[error("Store context is closed")]
    ContextClosed,
}

impl Error {
    /// Whether this error prevents the store from being initialized
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ModelNotFound { .. }
                | Error::InvalidModel { .. }
                | Error::NoCompatibleVersion { .. }
                | Error::NoMappingAvailable { .. }
                | Error::MigrationStepFailed { .. }
                | Error::StoreOpenFailed { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ModelNotFound { .. } | Error::InvalidModel { .. } => {
                Some("Check that the application ships the model resources it was built with.")
            }
            Error::NoCompatibleVersion { .. } => {
                Some("The store predates every bundled model version. Restore it from a backup or export its data manually.")
            }
            Error::NoMappingAvailable { .. } => {
                Some("Add an explicit mapping file for this version pair to the resource bundle.")
            }
            Error::MigrationStepFailed { .. } => {
                Some("The store was left unchanged. Inspect the failing step with `schemastack status`.")
            }
            Error::StoreOpenFailed { source, .. } => source.recovery_suggestion(),
            Error::PersistenceError(source) => source.recovery_suggestion(),
            _ => None,
        }
    }
}

/// Result type for store-level operations
pub type Result<T> = std::result::Result<T, Error>;
