//! SQLite storage engine
//!
//! [`SqliteStore`] is the only type that talks to SQLite. It is not `Sync`;
//! inside an application it lives on the worker thread of a
//! [`DataStack`](crate::stack::DataStack) and is reached through
//! `DataStack::perform`.
//!
//! Writes go through [`SqliteStore::write`], which runs a closure inside one
//! SQLite transaction and commits only if the closure succeeds.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use rusqlite::{params_from_iter, Connection, Row, Transaction};
use tracing::debug;
use uuid::Uuid;

use super::error::{StorageError, StorageResult};
use super::files::{destroy_store, ensure_parent, install, sibling, PARTIAL_SUFFIX};
use super::metadata::{load_metadata, write_metadata, StoreMetadata};
use super::query::{compile_order, compile_predicate, compile_window, FetchRequest, Predicate};
use super::schema::{get_sequence, init_schema, quote, raise_sequence};
use crate::identifier::ObjectLocation;
use crate::model::{EntityDescription, SchemaModel, PRIMARY_KEY};
use crate::record::Record;
use crate::value::{AttributeKind, Value};

/// An open store bound to one schema model
pub struct SqliteStore {
    conn: Connection,
    model: Arc<SchemaModel>,
    metadata: StoreMetadata,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open the store at `path`, creating it if it does not exist
    pub fn open(path: &Path, model: Arc<SchemaModel>) -> StorageResult<Self> {
        if path.exists() {
            Self::open_existing(path, model)
        } else {
            Self::create(path, model, Uuid::new_v4())
        }
    }

    /// Create a fresh store with the given identity
    pub fn create(path: &Path, model: Arc<SchemaModel>, store_id: Uuid) -> StorageResult<Self> {
        if path.exists() {
            return Err(StorageError::AlreadyExists {
                path: path.to_path_buf(),
            });
        }
        ensure_parent(path)?;

        let conn = Connection::open(path)?;
        let metadata = StoreMetadata::for_model(store_id, &model);
        if let Err(e) = initialize(&conn, &model, &metadata) {
            drop(conn);
            destroy_store(path)?;
            return Err(e);
        }

        debug!(
            "Created store {:?} for model '{}' ({})",
            path,
            model.name(),
            store_id
        );
        Ok(Self {
            conn,
            model,
            metadata,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an existing store; fails if it was written under another schema
    pub fn open_existing(path: &Path, model: Arc<SchemaModel>) -> StorageResult<Self> {
        if !path.exists() {
            return Err(StorageError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let conn = Connection::open(path)?;
        let metadata = load_metadata(&conn, path)?.ok_or_else(|| StorageError::Metadata {
            path: path.to_path_buf(),
            details: "store has no metadata".to_string(),
        })?;

        if !metadata.matches(&model) {
            return Err(StorageError::IncompatibleModel {
                path: path.to_path_buf(),
                store_model: metadata.model_name,
                model: model.name().to_string(),
            });
        }

        debug!("Opened store {:?} with model '{}'", path, model.name());
        Ok(Self {
            conn,
            model,
            metadata,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an empty store that lives only in memory
    pub fn open_in_memory(model: Arc<SchemaModel>) -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let metadata = StoreMetadata::for_model(Uuid::new_v4(), &model);
        initialize(&conn, &model, &metadata)?;

        Ok(Self {
            conn,
            model,
            metadata,
            path: None,
        })
    }

    /// Remove the store at `path` from disk
    pub fn destroy(path: &Path) -> StorageResult<()> {
        destroy_store(path)
    }

    /// Copy this store's content into a new store at `path` and open it
    ///
    /// The copy is a consistent snapshot taken by SQLite itself, so the new
    /// file never reflects a half-written state.
    pub fn migrate_to(&self, path: &Path) -> StorageResult<SqliteStore> {
        copy_content(&self.conn, path)?;
        Self::open_existing(path, self.model.clone())
    }

    pub fn store_id(&self) -> Uuid {
        self.metadata.store_id
    }

    pub fn metadata(&self) -> &StoreMetadata {
        &self.metadata
    }

    pub fn model(&self) -> &SchemaModel {
        &self.model
    }

    /// File backing this store; `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Resolve a location string minted by this store
    pub fn resolve(&self, raw: &str) -> Option<ObjectLocation> {
        locate(raw, self.store_id(), &self.model)
    }

    fn reader(&self) -> Reader<'_> {
        Reader {
            conn: &self.conn,
            model: &self.model,
            store_id: self.metadata.store_id,
        }
    }

    /// Fetch the record at `location`, `None` if it does not exist here
    pub fn fetch(&self, location: &ObjectLocation) -> StorageResult<Option<Record>> {
        self.reader().fetch(location)
    }

    /// Every record of an entity in primary key order
    pub fn read_all(&self, entity: &str) -> StorageResult<Vec<Record>> {
        self.reader().query(entity, &FetchRequest::all())
    }

    pub fn query(&self, entity: &str, request: &FetchRequest) -> StorageResult<Vec<Record>> {
        self.reader().query(entity, request)
    }

    pub fn count(&self, entity: &str, predicate: Option<&Predicate>) -> StorageResult<usize> {
        self.reader().count(entity, predicate)
    }

    /// Highest primary key ever issued for an entity
    pub fn sequence(&self, entity: &str) -> StorageResult<i64> {
        self.reader().entity(entity)?;
        Ok(get_sequence(&self.conn, entity)?)
    }

    /// Run `work` inside a transaction and commit it
    ///
    /// If `work` fails the transaction is rolled back and nothing it wrote
    /// is visible.
    pub fn write<T, F>(&mut self, work: F) -> StorageResult<T>
    where
        F: FnOnce(&mut StoreTransaction<'_>) -> StorageResult<T>,
    {
        let tx = self.conn.transaction()?;
        let mut transaction = StoreTransaction {
            tx,
            model: &self.model,
            store_id: self.metadata.store_id,
        };

        let result = work(&mut transaction)?;
        transaction.tx.commit()?;
        Ok(result)
    }
}

/// Write access to a store for the duration of one transaction
pub struct StoreTransaction<'a> {
    tx: Transaction<'a>,
    model: &'a SchemaModel,
    store_id: Uuid,
}

impl StoreTransaction<'_> {
    fn reader(&self) -> Reader<'_> {
        Reader {
            conn: &self.tx,
            model: self.model,
            store_id: self.store_id,
        }
    }

    pub fn fetch(&self, location: &ObjectLocation) -> StorageResult<Option<Record>> {
        self.reader().fetch(location)
    }

    pub fn query(&self, entity: &str, request: &FetchRequest) -> StorageResult<Vec<Record>> {
        self.reader().query(entity, request)
    }

    pub fn count(&self, entity: &str, predicate: Option<&Predicate>) -> StorageResult<usize> {
        self.reader().count(entity, predicate)
    }

    /// Insert a new record and return it as stored
    ///
    /// Unset attributes take their default; any location the record carries
    /// is ignored and a new one is issued.
    pub fn insert(&mut self, record: &Record) -> StorageResult<Record> {
        let entity = self.reader().entity(record.entity())?;
        let values = normalize(entity, record)?;
        self.check_references(entity, &values)?;
        self.insert_row(entity, values, None)
    }

    /// Insert a record under a fixed primary key
    ///
    /// Used by migration, which carries keys over unchanged. References are
    /// not checked because destination records may be inserted later in the
    /// same transaction.
    pub(crate) fn insert_with_key(&mut self, record: &Record, key: i64) -> StorageResult<Record> {
        let entity = self.reader().entity(record.entity())?;
        let values = normalize(entity, record)?;
        self.insert_row(entity, values, Some(key))
    }

    fn insert_row(
        &self,
        entity: &EntityDescription,
        values: BTreeMap<String, Value>,
        key: Option<i64>,
    ) -> StorageResult<Record> {
        let mut columns = Vec::with_capacity(values.len() + 1);
        let mut params = Vec::with_capacity(values.len() + 1);
        if let Some(key) = key {
            columns.push(quote(PRIMARY_KEY));
            params.push(Value::Integer(key));
        }
        for (name, value) in &values {
            columns.push(quote(name));
            params.push(value.clone());
        }

        let sql = if columns.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", quote(&entity.name))
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote(&entity.name),
                columns.join(", "),
                vec!["?"; columns.len()].join(", ")
            )
        };
        self.tx.execute(&sql, params_from_iter(params.iter()))?;

        let key = self.tx.last_insert_rowid();
        Ok(Record::stored(
            ObjectLocation::new(self.store_id, &entity.name, key),
            values,
        ))
    }

    /// Write the values of a saved record back to its row
    ///
    /// Returns `false` if the row no longer exists.
    pub fn update(&mut self, record: &Record) -> StorageResult<bool> {
        let location = record
            .location()
            .ok_or_else(|| StorageError::Unsaved(record.entity().to_string()))?;
        if location.store_id != self.store_id {
            return Ok(false);
        }

        let entity = self.reader().entity(record.entity())?;
        let values = normalize(entity, record)?;
        self.check_references(entity, &values)?;

        if values.is_empty() {
            return Ok(self.fetch(location)?.is_some());
        }

        let assignments: Vec<String> = values
            .keys()
            .map(|name| format!("{} = ?", quote(name)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            quote(&entity.name),
            assignments.join(", "),
            quote(PRIMARY_KEY)
        );

        let params = values
            .values()
            .cloned()
            .chain(std::iter::once(Value::Integer(location.key)));
        let changed = self
            .tx
            .execute(&sql, params_from_iter(params.collect::<Vec<_>>().iter()))?;
        Ok(changed > 0)
    }

    /// Delete the record at `location`; returns `false` if it did not exist
    pub fn delete(&mut self, location: &ObjectLocation) -> StorageResult<bool> {
        if location.store_id != self.store_id {
            return Ok(false);
        }
        let Some(entity) = self.model.entity(&location.entity) else {
            return Ok(false);
        };

        let changed = self.tx.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                quote(&entity.name),
                quote(PRIMARY_KEY)
            ),
            [location.key],
        )?;
        Ok(changed > 0)
    }

    /// Raise the key sequence of an entity so keys up to `seq` are never reissued
    pub(crate) fn raise_sequence(&mut self, entity: &str, seq: i64) -> StorageResult<()> {
        self.reader().entity(entity)?;
        Ok(raise_sequence(&self.tx, entity, seq)?)
    }

    fn check_references(
        &self,
        entity: &EntityDescription,
        values: &BTreeMap<String, Value>,
    ) -> StorageResult<()> {
        for relationship in &entity.relationships {
            let Some(key) = values.get(&relationship.name).and_then(Value::as_integer) else {
                continue;
            };
            let location = ObjectLocation::new(self.store_id, &relationship.destination, key);
            if self.fetch(&location)?.is_none() {
                return Err(StorageError::DanglingReference {
                    entity: entity.name.clone(),
                    property: relationship.name.clone(),
                    destination: relationship.destination.clone(),
                    key,
                });
            }
        }
        Ok(())
    }
}

/// Read access shared by stores and transactions
struct Reader<'a> {
    conn: &'a Connection,
    model: &'a SchemaModel,
    store_id: Uuid,
}

impl<'a> Reader<'a> {
    fn entity(&self, name: &str) -> StorageResult<&'a EntityDescription> {
        self.model
            .entity(name)
            .ok_or_else(|| StorageError::UnknownEntity(name.to_string()))
    }

    fn fetch(&self, location: &ObjectLocation) -> StorageResult<Option<Record>> {
        if location.store_id != self.store_id {
            return Ok(None);
        }
        let Some(entity) = self.model.entity(&location.entity) else {
            return Ok(None);
        };

        let sql = format!("{} WHERE {} = ?1", select_sql(entity), quote(PRIMARY_KEY));
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([location.key])?;

        match rows.next()? {
            Some(row) => Ok(Some(self.decode(entity, row)?)),
            None => Ok(None),
        }
    }

    fn query(&self, entity: &str, request: &FetchRequest) -> StorageResult<Vec<Record>> {
        let entity = self.entity(entity)?;

        let mut sql = select_sql(entity);
        let mut params = Vec::new();
        if let Some(predicate) = &request.predicate {
            let fragment = compile_predicate(predicate, entity)?;
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
            params = fragment.params;
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&compile_order(&request.sort, entity)?);
        sql.push_str(&compile_window(request.offset, request.limit));

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(params.iter()))?;

        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(self.decode(entity, row)?);
        }
        Ok(records)
    }

    fn count(&self, entity: &str, predicate: Option<&Predicate>) -> StorageResult<usize> {
        let entity = self.entity(entity)?;

        let mut sql = format!("SELECT COUNT(*) FROM {}", quote(&entity.name));
        let mut params = Vec::new();
        if let Some(predicate) = predicate {
            let fragment = compile_predicate(predicate, entity)?;
            sql.push_str(" WHERE ");
            sql.push_str(&fragment.sql);
            params = fragment.params;
        }

        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(params.iter()), |row| row.get(0))?;
        Ok(count as usize)
    }

    fn decode(&self, entity: &EntityDescription, row: &Row<'_>) -> StorageResult<Record> {
        let key: i64 = row.get(0)?;

        let mut values = BTreeMap::new();
        for (i, (name, kind)) in columns(entity).into_iter().enumerate() {
            let index = i + 1;
            let raw = row.get_ref(index)?;
            let value = Value::from_column(kind, raw).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(index, raw.data_type(), Box::new(e))
            })?;
            values.insert(name.to_string(), value);
        }

        Ok(Record::stored(
            ObjectLocation::new(self.store_id, &entity.name, key),
            values,
        ))
    }
}

/// Stored columns of an entity in table order (after the primary key)
fn columns(entity: &EntityDescription) -> Vec<(&str, AttributeKind)> {
    entity
        .attributes
        .iter()
        .map(|a| (a.name.as_str(), a.kind))
        .chain(
            entity
                .relationships
                .iter()
                .map(|r| (r.name.as_str(), AttributeKind::Integer)),
        )
        .collect()
}

fn select_sql(entity: &EntityDescription) -> String {
    let mut names = vec![quote(PRIMARY_KEY)];
    names.extend(columns(entity).into_iter().map(|(name, _)| quote(name)));
    format!("SELECT {} FROM {}", names.join(", "), quote(&entity.name))
}

/// Check a record against its entity and produce the values to store
///
/// Every attribute and relationship of the entity is present in the result.
fn normalize(entity: &EntityDescription, record: &Record) -> StorageResult<BTreeMap<String, Value>> {
    for name in record.values().keys() {
        if entity.property_kind(name).is_none() {
            return Err(StorageError::UnknownProperty {
                entity: entity.name.clone(),
                property: name.clone(),
            });
        }
    }

    let mut values = BTreeMap::new();

    for attribute in &entity.attributes {
        let mut value = record.get(&attribute.name).clone();
        if value.is_null() {
            if let Some(default) = &attribute.default {
                value = default.clone();
            }
        }

        let value = match (attribute.kind, value) {
            (AttributeKind::Real, Value::Integer(i)) => Value::Real(i as f64),
            // Stored with millisecond precision
            (_, Value::Date(date)) => Value::Date(
                Utc.timestamp_millis_opt(date.timestamp_millis())
                    .single()
                    .unwrap_or(date),
            ),
            (_, value) => value,
        };

        if value.is_null() && !attribute.optional {
            return Err(StorageError::MissingValue {
                entity: entity.name.clone(),
                property: attribute.name.clone(),
            });
        }
        if !value.fits(attribute.kind) {
            return Err(StorageError::TypeMismatch {
                entity: entity.name.clone(),
                property: attribute.name.clone(),
                expected: attribute.kind,
                found: value.kind().map(|k| k.to_string()).unwrap_or_default(),
            });
        }
        values.insert(attribute.name.clone(), value);
    }

    for relationship in &entity.relationships {
        let value = record.get(&relationship.name).clone();
        if value.is_null() && !relationship.optional {
            return Err(StorageError::MissingValue {
                entity: entity.name.clone(),
                property: relationship.name.clone(),
            });
        }
        if !value.fits(AttributeKind::Integer) {
            return Err(StorageError::TypeMismatch {
                entity: entity.name.clone(),
                property: relationship.name.clone(),
                expected: AttributeKind::Integer,
                found: value.kind().map(|k| k.to_string()).unwrap_or_default(),
            });
        }
        values.insert(relationship.name.clone(), value);
    }

    Ok(values)
}

fn initialize(conn: &Connection, model: &SchemaModel, metadata: &StoreMetadata) -> StorageResult<()> {
    let tx = conn.unchecked_transaction()?;
    init_schema(&tx, model)?;
    write_metadata(&tx, metadata)?;
    tx.commit()?;
    Ok(())
}

/// Snapshot the database behind `conn` into a new file at `path`
fn copy_content(conn: &Connection, path: &Path) -> StorageResult<()> {
    if path.exists() {
        return Err(StorageError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    ensure_parent(path)?;

    let partial = sibling(path, PARTIAL_SUFFIX);
    destroy_store(&partial)?;

    let written = conn
        .execute("VACUUM INTO ?1", [partial.to_string_lossy()])
        .map_err(StorageError::from)
        .and_then(|_| install(&partial, path));
    if written.is_err() {
        let _ = destroy_store(&partial);
    }
    written
}

/// Copy the store file at `from` to `to` without interpreting its schema
///
/// Used to save and restore stores whose model is not known to the caller.
pub fn copy_store(from: &Path, to: &Path) -> StorageResult<()> {
    if !from.exists() {
        return Err(StorageError::NotFound {
            path: from.to_path_buf(),
        });
    }
    let conn = Connection::open(from)?;
    copy_content(&conn, to)
}

/// Resolve a location string against a store identity and model
pub(crate) fn locate(raw: &str, store_id: Uuid, model: &SchemaModel) -> Option<ObjectLocation> {
    let location = ObjectLocation::parse(raw).ok()?;
    if location.store_id != store_id || model.entity(&location.entity).is_none() {
        return None;
    }
    Some(location)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttributeDescription;
    use crate::storage::metadata::read_metadata;
    use crate::storage::query::SortDescriptor;
    use tempfile::TempDir;

    fn model() -> Arc<SchemaModel> {
        let folder = EntityDescription::new("Folder")
            .with_attribute(AttributeDescription::new("name", AttributeKind::Text));
        let note = EntityDescription::new("Note")
            .with_attribute(AttributeDescription::new("text", AttributeKind::Text))
            .with_attribute(AttributeDescription::new("rank", AttributeKind::Integer).with_default(0i64))
            .with_attribute(AttributeDescription::new("score", AttributeKind::Real).optional())
            .with_attribute(AttributeDescription::new("createdAt", AttributeKind::Date).optional())
            .with_relationship("folder", "Folder");
        Arc::new(SchemaModel::new("Notes", 1, vec![folder, note]).unwrap())
    }

    fn insert_notes(store: &mut SqliteStore, texts: &[(&str, i64)]) -> Vec<Record> {
        store
            .write(|tx| {
                texts
                    .iter()
                    .map(|(text, rank)| tx.insert(&Record::new("Note").with("text", *text).with("rank", *rank)))
                    .collect()
            })
            .unwrap()
    }

    #[test]
    fn test_insert_and_fetch() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();

        let saved = store
            .write(|tx| tx.insert(&Record::new("Note").with("text", "hello")))
            .unwrap();

        let location = saved.location().unwrap().clone();
        assert_eq!(location.store_id, store.store_id());
        assert_eq!(saved.integer("rank"), Some(0));
        assert!(saved.get("score").is_null());

        let fetched = store.fetch(&location).unwrap().unwrap();
        assert_eq!(fetched, saved);
    }

    #[test]
    fn test_insert_validation() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();

        let err = store
            .write(|tx| tx.insert(&Record::new("Note")))
            .unwrap_err();
        assert!(matches!(err, StorageError::MissingValue { .. }));

        let err = store
            .write(|tx| tx.insert(&Record::new("Note").with("text", 5i64)))
            .unwrap_err();
        assert!(matches!(err, StorageError::TypeMismatch { .. }));

        let err = store
            .write(|tx| tx.insert(&Record::new("Note").with("text", "x").with("title", "y")))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownProperty { .. }));

        let err = store
            .write(|tx| tx.insert(&Record::new("Task")))
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownEntity(_)));
    }

    #[test]
    fn test_failed_write_rolls_back() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();

        let result = store.write(|tx| {
            tx.insert(&Record::new("Note").with("text", "first"))?;
            tx.insert(&Record::new("Note"))
        });

        assert!(result.is_err());
        assert_eq!(store.count("Note", None).unwrap(), 0);
    }

    #[test]
    fn test_relationship_reference_checked() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();

        let err = store
            .write(|tx| tx.insert(&Record::new("Note").with("text", "x").with("folder", 99i64)))
            .unwrap_err();
        assert!(matches!(err, StorageError::DanglingReference { key: 99, .. }));

        let note = store
            .write(|tx| {
                let folder = tx.insert(&Record::new("Folder").with("name", "inbox"))?;
                let key = folder.location().map(|l| l.key).unwrap();
                tx.insert(&Record::new("Note").with("text", "x").with("folder", key))
            })
            .unwrap();
        assert!(note.integer("folder").is_some());
    }

    #[test]
    fn test_update_and_delete() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let mut saved = insert_notes(&mut store, &[("draft", 1)]).remove(0);

        saved.set("text", "final");
        assert!(store.write(|tx| tx.update(&saved)).unwrap());

        let location = saved.location().unwrap().clone();
        let fetched = store.fetch(&location).unwrap().unwrap();
        assert_eq!(fetched.text("text"), Some("final"));

        assert!(store.write(|tx| tx.delete(&location)).unwrap());
        assert!(!store.write(|tx| tx.delete(&location)).unwrap());
        assert!(!store.write(|tx| tx.update(&saved)).unwrap());
        assert!(store.fetch(&location).unwrap().is_none());
    }

    #[test]
    fn test_update_unsaved_record() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let err = store
            .write(|tx| tx.update(&Record::new("Note").with("text", "x")))
            .unwrap_err();
        assert!(matches!(err, StorageError::Unsaved(_)));
    }

    #[test]
    fn test_keys_not_reused_after_delete() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let saved = insert_notes(&mut store, &[("a", 1), ("b", 2)]);
        let last = saved[1].location().unwrap().clone();

        store.write(|tx| tx.delete(&last)).unwrap();
        let again = insert_notes(&mut store, &[("c", 3)]).remove(0);

        assert!(again.location().unwrap().key > last.key);
        assert_eq!(store.sequence("Note").unwrap(), again.location().unwrap().key);
    }

    #[test]
    fn test_query_sort_and_window() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        insert_notes(&mut store, &[("a", 3), ("b", 1), ("c", 2), ("d", 5)]);

        let request = FetchRequest::matching(Predicate::gt("rank", 1i64))
            .sorted_by(SortDescriptor::descending("rank"))
            .offset(1)
            .limit(2);
        let records = store.query("Note", &request).unwrap();
        let texts: Vec<_> = records.iter().filter_map(|r| r.text("text")).collect();
        assert_eq!(texts, vec!["a", "c"]);

        assert_eq!(store.count("Note", None).unwrap(), 4);
        assert_eq!(
            store
                .count("Note", Some(&Predicate::contains("text", "B")))
                .unwrap(),
            1
        );
        assert_eq!(store.read_all("Note").unwrap().len(), 4);
    }

    #[test]
    fn test_dates_stored_with_millisecond_precision() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let date = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();

        let saved = store
            .write(|tx| tx.insert(&Record::new("Note").with("text", "t").with("createdAt", date)))
            .unwrap();
        let fetched = store.fetch(saved.location().unwrap()).unwrap().unwrap();

        assert_eq!(fetched.date("createdAt"), saved.date("createdAt"));
        assert_eq!(
            fetched.date("createdAt").unwrap().timestamp_millis(),
            date.timestamp_millis()
        );
        // The inserted record already carries the truncated value
        assert_ne!(saved.date("createdAt"), Some(date));
        assert_eq!(
            saved.date("createdAt").unwrap().timestamp_subsec_nanos(),
            123_000_000
        );
    }

    #[test]
    fn test_integer_stored_in_real_attribute() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let saved = store
            .write(|tx| tx.insert(&Record::new("Note").with("text", "t").with("score", 4i64)))
            .unwrap();
        assert_eq!(saved.get("score"), &Value::Real(4.0));
    }

    #[test]
    fn test_open_file_store_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join("Notes.sqlite");

        let store_id;
        {
            let mut store = SqliteStore::open(&path, model()).unwrap();
            store_id = store.store_id();
            insert_notes(&mut store, &[("persisted", 1)]);
        }

        let store = SqliteStore::open(&path, model()).unwrap();
        assert_eq!(store.store_id(), store_id);
        assert_eq!(store.read_all("Note").unwrap()[0].text("text"), Some("persisted"));
        assert_eq!(read_metadata(&path).unwrap().store_id, store_id);
    }

    #[test]
    fn test_open_with_other_model_fails() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        SqliteStore::open(&path, model()).unwrap();

        let other = Arc::new(
            SchemaModel::new(
                "Notes 2",
                2,
                vec![EntityDescription::new("Note")
                    .with_attribute(AttributeDescription::new("body", AttributeKind::Text))],
            )
            .unwrap(),
        );
        let err = SqliteStore::open(&path, other).err().unwrap();
        assert!(matches!(err, StorageError::IncompatibleModel { .. }));
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        SqliteStore::open(&path, model()).unwrap();

        let err = SqliteStore::create(&path, model(), Uuid::new_v4()).err().unwrap();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[test]
    fn test_migrate_to_keeps_identity_and_content() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let copy_path = temp_dir.path().join("Copy.sqlite");

        let mut store = SqliteStore::open(&path, model()).unwrap();
        let saved = insert_notes(&mut store, &[("a", 1), ("b", 2)]);

        let copy = store.migrate_to(&copy_path).unwrap();
        assert_eq!(copy.store_id(), store.store_id());
        assert_eq!(copy.read_all("Note").unwrap(), store.read_all("Note").unwrap());
        assert!(copy.fetch(saved[1].location().unwrap()).unwrap().is_some());

        assert!(store.migrate_to(&copy_path).is_err());
    }

    #[test]
    fn test_resolve() {
        let mut store = SqliteStore::open_in_memory(model()).unwrap();
        let saved = insert_notes(&mut store, &[("a", 1)]).remove(0);
        let uri = saved.location().unwrap().to_uri();

        assert_eq!(store.resolve(&uri).as_ref(), saved.location());
        assert!(store.resolve("garbage").is_none());

        let foreign = ObjectLocation::new(Uuid::new_v4(), "Note", 1).to_uri();
        assert!(store.resolve(&foreign).is_none());

        let unknown = ObjectLocation::new(store.store_id(), "Task", 1).to_uri();
        assert!(store.resolve(&unknown).is_none());
    }

    #[test]
    fn test_destroy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        drop(SqliteStore::open(&path, model()).unwrap());

        SqliteStore::destroy(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_copy_store() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let backup = temp_dir.path().join("Notes.sqlite~backup");
        {
            let mut store = SqliteStore::open(&path, model()).unwrap();
            insert_notes(&mut store, &[("a", 1)]);
        }

        copy_store(&path, &backup).unwrap();
        let restored = SqliteStore::open_existing(&backup, model()).unwrap();
        assert_eq!(restored.count("Note", None).unwrap(), 1);
        assert!(!sibling(&backup, PARTIAL_SUFFIX).exists());
    }

    #[test]
    fn test_failed_copy_leaves_no_target() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let backup = temp_dir.path().join("Notes.sqlite~backup");
        std::fs::write(&path, b"SQLite format 3\0partial").unwrap();

        assert!(copy_store(&path, &backup).is_err());
        assert!(!backup.exists());
        assert!(!sibling(&backup, PARTIAL_SUFFIX).exists());
    }

    #[test]
    fn test_copy_overwrites_stale_partial() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let backup = temp_dir.path().join("Notes.sqlite~backup");
        {
            let mut store = SqliteStore::open(&path, model()).unwrap();
            insert_notes(&mut store, &[("a", 1)]);
        }
        std::fs::write(sibling(&backup, PARTIAL_SUFFIX), b"left over").unwrap();

        copy_store(&path, &backup).unwrap();
        assert_eq!(read_metadata(&backup).unwrap().store_id, read_metadata(&path).unwrap().store_id);
    }
}
