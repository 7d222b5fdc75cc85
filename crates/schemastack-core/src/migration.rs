//! Migration engine
//!
//! Brings a store written under an older model version up to the current
//! one by replaying every mapping step in between, one version at a time.
//!
//! ## Files
//!
//! - `<store>~backup` - copy of the store taken before the first step
//! - `<store>~migrating` - output of the step currently running
//!
//! Each step reads the store, writes the transformed records to the scratch
//! file, then replaces the store with it. If any step fails the backup is
//! copied back, so the store ends either at the current version or at the
//! version it started from.
//!
//! ## Interrupted runs
//!
//! A backup left on disk means a previous run never finished. It is restored
//! before anything else happens, and the migration runs again from scratch.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::compat::{is_compatible, oldest_compatible};
use crate::error::{Error, Result};
use crate::mapping::{MappingOrigin, MappingStep};
use crate::model::SchemaModel;
use crate::registry::ModelRegistry;
use crate::storage::engine::copy_store;
use crate::storage::files::sibling;
use crate::storage::{
    read_metadata, SqliteStore, StorageError, StorageResult, StoreFiles, PARTIAL_SUFFIX,
};

/// One applied mapping step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    /// Index of the source version in the ordered version list
    pub step: usize,
    pub source_version: u32,
    pub destination_version: u32,
    pub origin: MappingOrigin,
    /// Records written to the destination version
    pub records: usize,
}

/// Outcome of bringing a store up to date
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    /// Version the store was written under; `None` if there was no store
    pub source_version: Option<u32>,
    pub destination_version: u32,
    pub steps: Vec<StepReport>,
}

impl MigrationReport {
    fn unchanged(source_version: Option<u32>, current: &SchemaModel) -> Self {
        Self {
            source_version,
            destination_version: current.version(),
            steps: Vec::new(),
        }
    }

    /// Whether any step ran
    pub fn migrated(&self) -> bool {
        !self.steps.is_empty()
    }
}

/// A resolved migration: where it starts and the steps to run
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Index of the oldest compatible version
    pub start: usize,
    /// Steps from `start` to the current version, in order
    pub steps: Vec<MappingStep>,
}

/// Runs migrations for one named model
pub struct Migrator {
    registry: ModelRegistry,
    model_name: String,
}

impl Migrator {
    pub fn new(registry: ModelRegistry, model_name: impl Into<String>) -> Self {
        Self {
            registry,
            model_name: model_name.into(),
        }
    }

    /// Work out which steps would bring the store at `path` to `current`
    ///
    /// `versions` must be ordered oldest first. Every step is resolved before
    /// the store is touched, so a missing mapping never leaves work half done.
    pub fn plan(
        &self,
        path: &Path,
        versions: &[SchemaModel],
        current: &SchemaModel,
    ) -> Result<MigrationPlan> {
        let no_compatible = || Error::NoCompatibleVersion {
            model: self.model_name.clone(),
            path: path.to_path_buf(),
        };

        let target = target_index(versions, current).ok_or_else(no_compatible)?;
        let metadata = read_metadata(path).map_err(|e| {
            warn!("Could not read metadata of store {:?}: {}", path, e);
            no_compatible()
        })?;
        let start =
            oldest_compatible(&versions[..=target], &metadata).ok_or_else(no_compatible)?;

        let mut steps = Vec::with_capacity(target - start);
        for i in start..target {
            steps.push(self.mapping(&versions[i], &versions[i + 1])?);
        }

        Ok(MigrationPlan { start, steps })
    }

    /// Explicit mapping between two versions, or an inferred one
    fn mapping(&self, source: &SchemaModel, destination: &SchemaModel) -> Result<MappingStep> {
        if let Some(step) = self
            .registry
            .load_mapping(&self.model_name, source, destination)?
        {
            return Ok(step);
        }

        MappingStep::infer(source, destination).map_err(|reason| Error::NoMappingAvailable {
            source_version: source.version(),
            destination_version: destination.version(),
            reason,
        })
    }

    /// Bring the store at `path` to the `current` model
    ///
    /// Does nothing if there is no store yet or it is already compatible.
    pub fn migrate(
        &self,
        path: &Path,
        versions: &[SchemaModel],
        current: &SchemaModel,
    ) -> Result<MigrationReport> {
        let files = StoreFiles::new(path);
        recover_interrupted(&files)?;

        if !files.exists() {
            return Ok(MigrationReport::unchanged(None, current));
        }
        if is_compatible(current, path) {
            let version = read_metadata(path).ok().map(|m| m.model_version);
            return Ok(MigrationReport::unchanged(version, current));
        }

        let plan = self.plan(path, versions, current)?;
        if plan.steps.is_empty() {
            let version = versions[plan.start].version();
            return Ok(MigrationReport::unchanged(Some(version), current));
        }
        let source_version = versions[plan.start].version();
        info!(
            "Migrating store {:?} from version {} to {} ({} step(s))",
            path,
            source_version,
            current.version(),
            plan.steps.len()
        );

        take_backup(&files)?;

        let mut steps = Vec::with_capacity(plan.steps.len());
        for (offset, step) in plan.steps.iter().enumerate() {
            let index = plan.start + offset;
            let (source, destination) = (&versions[index], &versions[index + 1]);
            info!(
                "Step {}: version {} -> {} ({} mapping)",
                index,
                source.version(),
                destination.version(),
                step.origin
            );

            match apply_step(&files, source, destination, step) {
                Ok(records) => steps.push(StepReport {
                    step: index,
                    source_version: source.version(),
                    destination_version: destination.version(),
                    origin: step.origin,
                    records,
                }),
                Err(cause) => {
                    error!("Migration step {} failed: {}", index, cause);
                    restore_backup(&files);
                    return Err(step_failed(index, source, destination, cause));
                }
            }
        }

        let backup = files.backup_path();
        SqliteStore::destroy(&backup).map_err(|source| Error::StoreOpenFailed {
            path: backup.clone(),
            source,
        })?;
        info!("Store {:?} is at version {}", path, current.version());

        Ok(MigrationReport {
            source_version: Some(source_version),
            destination_version: current.version(),
            steps,
        })
    }
}

/// Position of `current` in `versions`, falling back to the newest version
fn target_index(versions: &[SchemaModel], current: &SchemaModel) -> Option<usize> {
    versions
        .iter()
        .position(|model| model.version() == current.version())
        .or_else(|| versions.len().checked_sub(1))
}

fn step_failed(
    step: usize,
    source: &SchemaModel,
    destination: &SchemaModel,
    cause: StorageError,
) -> Error {
    Error::MigrationStepFailed {
        step,
        source_version: source.version(),
        destination_version: destination.version(),
        cause,
    }
}

/// Run one step and install its output in place of the store
fn apply_step(
    files: &StoreFiles,
    source: &SchemaModel,
    destination: &SchemaModel,
    step: &MappingStep,
) -> StorageResult<usize> {
    let scratch = files.scratch_path();
    SqliteStore::destroy(&scratch)?;

    let records = match write_scratch(files, source, destination, step) {
        Ok(records) => records,
        Err(e) => {
            let _ = SqliteStore::destroy(&scratch);
            return Err(e);
        }
    };

    SqliteStore::destroy(files.path())?;
    {
        let migrated = SqliteStore::open_existing(&scratch, Arc::new(destination.clone()))?;
        migrated.migrate_to(files.path())?;
    }
    SqliteStore::destroy(&scratch)?;

    Ok(records)
}

/// Write the transformed content of the store to the scratch file
fn write_scratch(
    files: &StoreFiles,
    source: &SchemaModel,
    destination: &SchemaModel,
    step: &MappingStep,
) -> StorageResult<usize> {
    let original = SqliteStore::open_existing(files.path(), Arc::new(source.clone()))?;
    let mut scratch = SqliteStore::create(
        &files.scratch_path(),
        Arc::new(destination.clone()),
        original.store_id(),
    )?;

    scratch.write(|tx| step.apply(&original, tx))
}

/// Copy the store to its backup path before any step runs
///
/// No step has run yet, so a failure here is reported against the backup.
fn take_backup(files: &StoreFiles) -> Result<()> {
    let backup = files.backup_path();
    copy_store(files.path(), &backup).map_err(|source| {
        error!("Could not back up store {:?}: {}", files.path(), source);
        Error::StoreOpenFailed {
            path: backup.clone(),
            source,
        }
    })
}

/// Put the pre-migration copy back in place of the store
fn restore_backup(files: &StoreFiles) {
    let backup = files.backup_path();
    let _ = SqliteStore::destroy(&files.scratch_path());

    let restored = SqliteStore::destroy(files.path())
        .and_then(|_| copy_store(&backup, files.path()))
        .and_then(|_| SqliteStore::destroy(&backup));
    match restored {
        Ok(()) => info!("Restored store {:?} from backup", files.path()),
        // The backup stays on disk and is restored on the next start
        Err(e) => error!("Could not restore store {:?} from backup: {}", files.path(), e),
    }
}

/// Clean up after a migration that never finished
pub fn recover_interrupted(files: &StoreFiles) -> Result<()> {
    let open_failed = |source: StorageError| Error::StoreOpenFailed {
        path: files.path().to_path_buf(),
        source,
    };

    let backup = files.backup_path();
    let stale = [
        files.scratch_path(),
        sibling(files.path(), PARTIAL_SUFFIX),
        sibling(&backup, PARTIAL_SUFFIX),
    ];
    for path in stale.iter().filter(|path| path.exists()) {
        warn!("Removing stale migration output {:?}", path);
        SqliteStore::destroy(path).map_err(open_failed)?;
    }

    if !backup.exists() {
        return Ok(());
    }

    // Only a backup that reads back as a store may replace the original
    if let Err(e) = read_metadata(&backup) {
        warn!("Discarding unreadable backup {:?}: {}", backup, e);
        return SqliteStore::destroy(&backup).map_err(open_failed);
    }

    warn!("Restoring {:?} from an interrupted migration", files.path());
    SqliteStore::destroy(files.path()).map_err(open_failed)?;
    copy_store(&backup, files.path()).map_err(open_failed)?;
    SqliteStore::destroy(&backup).map_err(open_failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttributeDescription, EntityDescription};
    use crate::record::Record;
    use crate::registry::MemoryBundle;
    use crate::value::AttributeKind;
    use tempfile::TempDir;

    fn text() -> AttributeDescription {
        AttributeDescription::new("text", AttributeKind::Text)
    }

    fn created_at() -> AttributeDescription {
        AttributeDescription::new("createdAt", AttributeKind::Date)
    }

    fn model(version: u32, note: EntityDescription) -> SchemaModel {
        let name = if version == 1 {
            "Notes".to_string()
        } else {
            format!("Notes {}", version)
        };
        SchemaModel::new(name, version, vec![note]).unwrap()
    }

    fn note() -> EntityDescription {
        EntityDescription::new("Note").with_attribute(text())
    }

    fn migrator(bundle: MemoryBundle) -> Migrator {
        Migrator::new(ModelRegistry::new(Arc::new(bundle)), "Notes")
    }

    fn seed(path: &Path, model: &SchemaModel, texts: &[&str]) -> Vec<Record> {
        let mut store = SqliteStore::open(path, Arc::new(model.clone())).unwrap();
        store
            .write(|tx| {
                texts
                    .iter()
                    .map(|t| tx.insert(&Record::new("Note").with("text", *t)))
                    .collect()
            })
            .unwrap()
    }

    fn texts(path: &Path, model: &SchemaModel) -> Vec<String> {
        let store = SqliteStore::open_existing(path, Arc::new(model.clone())).unwrap();
        store
            .read_all("Note")
            .unwrap()
            .iter()
            .filter_map(|r| r.text("text").map(str::to_string))
            .collect()
    }

    #[test]
    fn test_missing_store_needs_no_migration() {
        let temp_dir = TempDir::new().unwrap();
        let v1 = model(1, note());

        let report = migrator(MemoryBundle::new())
            .migrate(&temp_dir.path().join("Notes.sqlite"), &[v1.clone()], &v1)
            .unwrap();

        assert!(!report.migrated());
        assert_eq!(report.source_version, None);
    }

    #[test]
    fn test_compatible_store_is_left_alone() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let v1 = model(1, note());
        seed(&path, &v1, &["a"]);

        let report = migrator(MemoryBundle::new())
            .migrate(&path, &[v1.clone()], &v1)
            .unwrap();

        assert!(!report.migrated());
        assert_eq!(report.source_version, Some(1));
    }

    #[test]
    fn test_chain_visits_every_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let v1 = model(1, note());
        let v2 = model(2, note().with_attribute(created_at().optional()));
        let v3 = model(
            3,
            note()
                .with_attribute(created_at().optional())
                .with_attribute(AttributeDescription::new("pinned", AttributeKind::Boolean).with_default(false)),
        );
        let saved = seed(&path, &v1, &["first", "second"]);

        let versions = [v1, v2, v3.clone()];
        let report = migrator(MemoryBundle::new())
            .migrate(&path, &versions, &v3)
            .unwrap();

        let pairs: Vec<_> = report
            .steps
            .iter()
            .map(|s| (s.source_version, s.destination_version))
            .collect();
        assert_eq!(pairs, vec![(1, 2), (2, 3)]);
        assert!(report.steps.iter().all(|s| s.records == 2));
        assert_eq!(report.steps[0].origin, MappingOrigin::Inferred);

        let files = StoreFiles::new(&path);
        assert!(!files.scratch_path().exists());
        assert!(!files.backup_path().exists());

        let store = SqliteStore::open_existing(&path, Arc::new(v3)).unwrap();
        let records = store.read_all("Note").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].boolean("pinned"), Some(false));

        // Locations minted before the migration still resolve
        for original in &saved {
            let location = original.location().unwrap();
            let migrated = store.fetch(location).unwrap().unwrap();
            assert_eq!(migrated.text("text"), original.text("text"));
        }
    }

    #[test]
    fn test_oldest_compatible_version_is_the_start() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let v1 = model(1, note());
        // Same structure as v1
        let v2 = model(2, note());
        let v3 = model(3, note().with_attribute(created_at().optional()));
        seed(&path, &v2, &["a"]);

        let versions = [v1, v2, v3.clone()];
        let m = migrator(MemoryBundle::new());
        let plan = m.plan(&path, &versions, &v3).unwrap();
        assert_eq!(plan.start, 0);
        assert_eq!(plan.steps.len(), 2);

        let report = m.migrate(&path, &versions, &v3).unwrap();
        assert_eq!(report.steps.len(), 2);
        assert_eq!(report.source_version, Some(1));
    }

    #[test]
    fn test_explicit_mapping_sets_default() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let v1 = model(1, note());
        let v2 = model(2, note().with_attribute(created_at()));
        seed(&path, &v1, &["a", "b"]);

        let bundle = MemoryBundle::new().with(
            "Notes.models/mappings/v1-v2.toml",
            r#"
                source_version = 1
                destination_version = 2
                [[entity]]
                destination = "Note"
                source = "Note"
                [entity.attributes]
                createdAt = { value = { date = "1970-01-01T00:00:00Z" } }
            "#,
        );

        let report = migrator(bundle)
            .migrate(&path, &[v1, v2.clone()], &v2)
            .unwrap();
        assert_eq!(report.steps[0].origin, MappingOrigin::Explicit);

        let store = SqliteStore::open_existing(&path, Arc::new(v2)).unwrap();
        for record in store.read_all("Note").unwrap() {
            assert_eq!(record.date("createdAt").unwrap().timestamp(), 0);
        }
    }

    #[test]
    fn test_no_compatible_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let foreign = model(
            1,
            EntityDescription::new("Note")
                .with_attribute(AttributeDescription::new("body", AttributeKind::Binary)),
        );
        seed_foreign(&path, &foreign);

        let v1 = model(1, note());
        let v2 = model(2, note().with_attribute(created_at().optional()));
        let err = migrator(MemoryBundle::new())
            .migrate(&path, &[v1, v2.clone()], &v2)
            .unwrap_err();

        assert!(matches!(err, Error::NoCompatibleVersion { .. }));
        assert!(path.exists());
    }

    fn seed_foreign(path: &Path, model: &SchemaModel) {
        drop(SqliteStore::open(path, Arc::new(model.clone())).unwrap());
    }

    #[test]
    fn test_missing_mapping_leaves_store_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let v1 = model(1, note());
        let v2 = model(2, note().with_attribute(created_at().optional()));
        // Required attribute without default cannot be inferred
        let v3 = model(
            3,
            note()
                .with_attribute(created_at().optional())
                .with_attribute(AttributeDescription::new("rank", AttributeKind::Integer)),
        );
        seed(&path, &v1, &["a"]);

        let err = migrator(MemoryBundle::new())
            .migrate(&path, &[v1.clone(), v2, v3.clone()], &v3)
            .unwrap_err();

        match err {
            Error::NoMappingAvailable {
                source_version,
                destination_version,
                ..
            } => assert_eq!((source_version, destination_version), (2, 3)),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(texts(&path, &v1), vec!["a"]);
        assert!(!StoreFiles::new(&path).backup_path().exists());
    }

    #[test]
    fn test_failed_step_restores_original_version() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let v1 = model(1, note());
        let v2 = model(2, note().with_attribute(created_at().optional()));
        let v3 = model(3, note().with_attribute(created_at()));
        seed(&path, &v1, &["a", "b"]);

        // Valid mapping, but every record has a null createdAt at version 2
        let bundle = MemoryBundle::new().with(
            "Notes.models/mappings/v2-v3.toml",
            r#"
                source_version = 2
                destination_version = 3
                [[entity]]
                destination = "Note"
                source = "Note"
                [entity.attributes]
                createdAt = { source = "createdAt" }
            "#,
        );

        let err = migrator(bundle)
            .migrate(&path, &[v1.clone(), v2, v3.clone()], &v3)
            .unwrap_err();

        match err {
            Error::MigrationStepFailed {
                step,
                source_version,
                destination_version,
                cause,
            } => {
                assert_eq!(step, 1);
                assert_eq!((source_version, destination_version), (2, 3));
                assert!(matches!(cause, StorageError::MissingValue { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }

        let files = StoreFiles::new(&path);
        assert!(!files.scratch_path().exists());
        assert!(!files.backup_path().exists());
        assert_eq!(read_metadata(&path).unwrap().model_version, 1);
        assert_eq!(texts(&path, &v1), vec!["a", "b"]);
    }

    #[test]
    fn test_recover_interrupted_restores_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let files = StoreFiles::new(&path);
        let v1 = model(1, note());
        let v2 = model(2, note().with_attribute(created_at().optional()));

        seed(&path, &v1, &["original"]);
        copy_store(&path, &files.backup_path()).unwrap();
        std::fs::write(files.scratch_path(), b"half written").unwrap();
        // Simulate a crash after the store was replaced
        SqliteStore::destroy(&path).unwrap();
        seed(&path, &v2, &["intermediate"]);

        recover_interrupted(&files).unwrap();

        assert!(!files.scratch_path().exists());
        assert!(!files.backup_path().exists());
        assert_eq!(texts(&path, &v1), vec!["original"]);
    }

    #[test]
    fn test_recover_without_store_restores_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let files = StoreFiles::new(&path);
        let v1 = model(1, note());

        seed(&path, &v1, &["kept"]);
        copy_store(&path, &files.backup_path()).unwrap();
        SqliteStore::destroy(&path).unwrap();

        recover_interrupted(&files).unwrap();
        assert_eq!(texts(&path, &v1), vec!["kept"]);
    }

    #[test]
    fn test_recover_discards_unreadable_backup() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let files = StoreFiles::new(&path);
        let v1 = model(1, note());

        seed(&path, &v1, &["original"]);
        // A backup cut short while it was being written
        std::fs::write(files.backup_path(), b"SQLite format 3\0partial").unwrap();
        std::fs::write(sibling(&files.backup_path(), PARTIAL_SUFFIX), b"partial").unwrap();

        recover_interrupted(&files).unwrap();

        assert!(!files.backup_path().exists());
        assert!(!sibling(&files.backup_path(), PARTIAL_SUFFIX).exists());
        assert_eq!(texts(&path, &v1), vec!["original"]);
    }

    #[test]
    fn test_backup_failure_names_backup_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("Notes.sqlite");
        let files = StoreFiles::new(&path);
        std::fs::write(&path, b"not a database at all").unwrap();

        match take_backup(&files) {
            Err(Error::StoreOpenFailed { path, .. }) => assert_eq!(path, files.backup_path()),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(()) => panic!("backup of a garbage file succeeded"),
        }
        assert!(!files.backup_path().exists());
    }
}
