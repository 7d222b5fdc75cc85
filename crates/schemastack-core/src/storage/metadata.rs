//! Store metadata
//!
//! Every store carries a small JSON header in its metadata table naming the
//! model it was last written under. [`read_metadata`] reads only that table
//! through a read-only connection, so it works for stores whose entity
//! tables no longer match any model this build can open.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::schema::{needs_init, METADATA_KEY, METADATA_TABLE};
use crate::model::SchemaModel;

/// Header persisted inside every store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMetadata {
    /// Identity of the store; part of every record location
    pub store_id: Uuid,
    /// Resource name of the model version the store was written under
    pub model_name: String,
    /// Ordinal of that model version
    pub model_version: u32,
    /// Content hash of that model version
    pub model_signature: String,
    /// Version hash of every entity, keyed by entity name
    pub entity_hashes: BTreeMap<String, String>,
    /// When this header was last written
    pub written_at: DateTime<Utc>,
}

impl StoreMetadata {
    pub fn for_model(store_id: Uuid, model: &SchemaModel) -> Self {
        Self {
            store_id,
            model_name: model.name().to_string(),
            model_version: model.version(),
            model_signature: model.signature().to_string(),
            entity_hashes: model.entity_hashes().clone(),
            written_at: Utc::now(),
        }
    }

    /// Whether a store with this header can be opened under `model`
    ///
    /// Compares per-entity version hashes, so two model versions with
    /// identical structure are interchangeable.
    pub fn matches(&self, model: &SchemaModel) -> bool {
        &self.entity_hashes == model.entity_hashes()
    }
}

/// Read the metadata of the store at `path` without opening the store
pub fn read_metadata(path: &Path) -> StorageResult<StoreMetadata> {
    if !path.exists() {
        return Err(StorageError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;

    load_metadata(&conn, path)?.ok_or_else(|| StorageError::Metadata {
        path: path.to_path_buf(),
        details: "store has no metadata".to_string(),
    })
}

/// Load the metadata row from an open connection
pub(crate) fn load_metadata(conn: &Connection, path: &Path) -> StorageResult<Option<StoreMetadata>> {
    // A file that was never initialized has no metadata table at all
    if needs_init(conn) {
        return Ok(None);
    }

    let json: Option<String> = conn
        .query_row(
            &format!("SELECT value FROM {} WHERE key = ?1", METADATA_TABLE),
            [METADATA_KEY],
            |row| row.get(0),
        )
        .optional()?;

    json.map(|json| {
        serde_json::from_str(&json).map_err(|e| StorageError::Metadata {
            path: path.to_path_buf(),
            details: e.to_string(),
        })
    })
    .transpose()
}

/// Write the metadata row
pub(crate) fn write_metadata(conn: &Connection, metadata: &StoreMetadata) -> StorageResult<()> {
    let json = serde_json::to_string(metadata).map_err(|e| StorageError::Metadata {
        path: Default::default(),
        details: e.to_string(),
    })?;

    conn.execute(
        &format!(
            "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
            METADATA_TABLE
        ),
        [METADATA_KEY, json.as_str()],
    )?;
    Ok(())
}
