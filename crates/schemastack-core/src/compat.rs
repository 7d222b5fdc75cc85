//! Compatibility checks between schema models and stores on disk

use std::path::Path;

use tracing::warn;

use crate::model::SchemaModel;
use crate::storage::{read_metadata, StoreMetadata};

/// Whether the store at `path` can be opened under `model` without migration
///
/// A missing store is compatible with every model, since it will be created
/// fresh. A store whose metadata cannot be read is treated as incompatible.
pub fn is_compatible(model: &SchemaModel, path: &Path) -> bool {
    if !path.exists() {
        return true;
    }

    match read_metadata(path) {
        Ok(metadata) => matches_metadata(model, &metadata),
        Err(e) => {
            warn!("Could not read metadata of store {:?}: {}", path, e);
            false
        }
    }
}

/// Whether a store written with `metadata` matches `model`
pub fn matches_metadata(model: &SchemaModel, metadata: &StoreMetadata) -> bool {
    metadata.matches(model)
}

/// Index of the oldest version in `versions` compatible with `metadata`
pub fn oldest_compatible(versions: &[SchemaModel], metadata: &StoreMetadata) -> Option<usize> {
    versions.iter().position(|model| metadata.matches(model))
}
