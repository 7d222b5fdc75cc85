//! End-to-end migrations through a bundle on disk

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use schemastack_core::storage::read_metadata;
use schemastack_core::{
    is_compatible, Config, DataStack, DirectoryBundle, Error, FetchRequest, HasIdentifier,
    Identifier, ManagedType, MappingOrigin, ModelRegistry, Record, Repository, StackOptions,
};
use tempfile::TempDir;
use uuid::Uuid;

const NOTE_V1: &str = r#"
    [[entity]]
    name = "Note"
    [[entity.attribute]]
    name = "text"
    kind = "text"
    [[entity.attribute]]
    name = "subtitle"
    kind = "text"
    optional = true
"#;

const NOTE_V2: &str = r#"
    [[entity]]
    name = "Note"
    [[entity.attribute]]
    name = "text"
    kind = "text"
    [[entity.attribute]]
    name = "subtitle"
    kind = "text"
    optional = true
    [[entity.attribute]]
    name = "createdAt"
    kind = "date"
"#;

const NOTE_V3: &str = r#"
    [[entity]]
    name = "Note"
    [[entity.attribute]]
    name = "text"
    kind = "text"
    [[entity.attribute]]
    name = "subtitle"
    kind = "text"
    optional = true
    [[entity.attribute]]
    name = "createdAt"
    kind = "date"
    [[entity.attribute]]
    name = "pinned"
    kind = "boolean"
    default = { boolean = false }
"#;

const EPOCH_MAPPING: &str = r#"
    source_version = 1
    destination_version = 2
    [[entity]]
    destination = "Note"
    source = "Note"
    [entity.attributes]
    createdAt = { value = { date = "1970-01-01T00:00:00Z" } }
"#;

#[derive(Debug, Clone, PartialEq)]
struct Note {
    id: Identifier<Note>,
    text: String,
    subtitle: Option<String>,
}

impl Note {
    fn new(text: &str, subtitle: Option<&str>) -> Self {
        Self {
            id: Identifier::pending(),
            text: text.to_string(),
            subtitle: subtitle.map(str::to_string),
        }
    }
}

impl HasIdentifier for Note {
    fn id(&self) -> &Identifier<Self> {
        &self.id
    }
}

/// Note as stored under any of the versions above
struct NoteRecord;

impl ManagedType for NoteRecord {
    type Domain = Note;
    const ENTITY_NAME: &'static str = "Note";

    fn assign(record: &mut Record, note: &Note) {
        record.set("text", note.text.as_str());
        if let Some(subtitle) = &note.subtitle {
            record.set("subtitle", subtitle.as_str());
        }
    }

    fn domain(record: &Record) -> Option<Note> {
        Some(Note {
            id: record.identifier(),
            text: record.text("text")?.to_string(),
            subtitle: record.text("subtitle").map(str::to_string),
        })
    }
}

struct Fixture {
    temp_dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        fs::create_dir_all(temp_dir.path().join("bundle/Notes.models/mappings")).unwrap();
        let fixture = Self { temp_dir };
        fixture.add("Notes.toml", NOTE_V1);
        fixture
    }

    fn add(&self, file: &str, content: &str) {
        fs::write(self.models().join(file), content).unwrap();
    }

    fn models(&self) -> PathBuf {
        self.temp_dir.path().join("bundle/Notes.models")
    }

    fn config(&self) -> Config {
        Config {
            data_dir: self.temp_dir.path().join("data"),
            bundle_dir: Some(self.temp_dir.path().join("bundle")),
            model_name: Some("Notes".to_string()),
        }
    }

    fn options(&self) -> StackOptions {
        StackOptions::from_config(&self.config(), "Notes")
    }

    fn store_path(&self) -> PathBuf {
        self.config().store_path("Notes")
    }
}

async fn seed(fixture: &Fixture, notes: Vec<Note>) -> (Uuid, Vec<Note>) {
    let stack = DataStack::open(fixture.options()).unwrap();
    let store_id = stack.store_id();
    let saved = Repository::<NoteRecord>::new(stack).create(notes).await.unwrap();
    (store_id, saved)
}

fn leftovers(path: &Path) -> Vec<String> {
    let dir = path.parent().unwrap();
    fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains('~'))
        .collect()
}

#[tokio::test]
async fn test_explicit_mapping_preserves_records_and_identifiers() {
    let fixture = Fixture::new();
    let (store_id, saved) = seed(
        &fixture,
        vec![
            Note::new("first", None),
            Note::new("second", Some("sub")),
            Note::new("third", None),
        ],
    )
    .await;

    fixture.add("Notes 2.toml", NOTE_V2);
    fixture.add("mappings/Notes 1 to 2.toml", EPOCH_MAPPING);

    let stack = DataStack::open(fixture.options()).unwrap();
    let report = stack.migration_report().clone();
    assert_eq!(report.source_version, Some(1));
    assert_eq!(report.destination_version, 2);
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].origin, MappingOrigin::Explicit);
    assert_eq!(report.steps[0].records, 3);
    assert_eq!(stack.store_id(), store_id);

    let notes = Repository::<NoteRecord>::new(stack.clone());
    let ids: Vec<_> = saved.iter().map(|note| note.id.clone()).collect();
    let fetched = notes.fetch(&ids).await.unwrap();
    assert_eq!(fetched, saved);

    for note in &saved {
        let raw = note.id.as_str().unwrap().to_string();
        assert!(stack.resolve_location(&raw).await.unwrap().is_some());
    }

    let records = notes
        .fetch_records(FetchRequest::all())
        .await
        .unwrap();
    assert!(records
        .iter()
        .all(|record| record.date("createdAt").unwrap().timestamp() == 0));

    assert!(leftovers(&fixture.store_path()).is_empty());
}

#[tokio::test]
async fn test_chain_runs_every_step_in_order() {
    let fixture = Fixture::new();
    let (_, saved) = seed(&fixture, vec![Note::new("only", None)]).await;

    fixture.add("Notes 2.toml", NOTE_V2);
    fixture.add("Notes 3.toml", NOTE_V3);
    fixture.add("mappings/Notes 1 to 2.toml", EPOCH_MAPPING);

    let stack = DataStack::open(fixture.options()).unwrap();
    let report = stack.migration_report();
    let pairs: Vec<(u32, u32)> = report
        .steps
        .iter()
        .map(|step| (step.source_version, step.destination_version))
        .collect();
    assert_eq!(pairs, vec![(1, 2), (2, 3)]);
    assert_eq!(report.steps[1].origin, MappingOrigin::Inferred);

    let fetched = Repository::<NoteRecord>::new(stack.clone())
        .fetch(&[saved[0].id.clone()])
        .await
        .unwrap();
    assert_eq!(fetched, saved);

    let pinned = stack
        .perform(|store| Ok(store.read_all("Note")?))
        .await
        .unwrap();
    assert_eq!(pinned[0].boolean("pinned"), Some(false));
}

#[tokio::test]
async fn test_compatible_store_opens_without_migrating() {
    let fixture = Fixture::new();
    seed(&fixture, vec![Note::new("a", None)]).await;

    let registry = ModelRegistry::new(Arc::new(DirectoryBundle::new(
        fixture.temp_dir.path().join("bundle"),
    )));
    let current = registry.load("Notes").unwrap();
    assert!(is_compatible(&current, &fixture.store_path()));

    let stack = DataStack::open(fixture.options()).unwrap();
    assert!(!stack.migration_report().migrated());
    assert_eq!(stack.migration_report().source_version, Some(1));
}

#[tokio::test]
async fn test_missing_mapping_leaves_store_untouched() {
    let fixture = Fixture::new();
    seed(&fixture, vec![Note::new("a", None)]).await;

    // createdAt is required and has no default, so nothing can be inferred
    fixture.add("Notes 2.toml", NOTE_V2);

    let result = DataStack::open(fixture.options());
    assert!(matches!(result, Err(Error::NoMappingAvailable { .. })));

    let metadata = read_metadata(&fixture.store_path()).unwrap();
    assert_eq!(metadata.model_version, 1);
    assert!(leftovers(&fixture.store_path()).is_empty());
}

#[tokio::test]
async fn test_failed_step_restores_original_version() {
    let fixture = Fixture::new();
    seed(
        &fixture,
        vec![Note::new("has one", Some("sub")), Note::new("has none", None)],
    )
    .await;

    fixture.add("Notes 2.toml", NOTE_V2);
    fixture.add(
        "mappings/Notes 1 to 2.toml",
        r#"
            source_version = 1
            destination_version = 2
            [[entity]]
            destination = "Note"
            source = "Note"
            [entity.attributes]
            createdAt = { value = { date = "1970-01-01T00:00:00Z" } }
            text = { source = "subtitle" }
        "#,
    );

    let result = DataStack::open(fixture.options());
    assert!(matches!(
        result,
        Err(Error::MigrationStepFailed {
            step: 0,
            source_version: 1,
            destination_version: 2,
            ..
        })
    ));

    let metadata = read_metadata(&fixture.store_path()).unwrap();
    assert_eq!(metadata.model_version, 1);
    assert!(leftovers(&fixture.store_path()).is_empty());

    // Fixing the mapping lets the next open succeed
    fixture.add("mappings/Notes 1 to 2.toml", EPOCH_MAPPING);
    let stack = DataStack::open(fixture.options()).unwrap();
    assert_eq!(stack.migration_report().steps.len(), 1);
    let count = Repository::<NoteRecord>::new(stack).count(None).await.unwrap();
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_truncated_backup_does_not_replace_store() {
    let fixture = Fixture::new();
    let (store_id, saved) = seed(&fixture, vec![Note::new("keep me", None)]).await;

    let backup = PathBuf::from(format!("{}~backup", fixture.store_path().display()));
    fs::write(&backup, b"SQLite format 3\0partial").unwrap();

    let stack = DataStack::open(fixture.options()).unwrap();
    assert_eq!(stack.store_id(), store_id);
    assert!(!backup.exists());

    let fetched = Repository::<NoteRecord>::new(stack)
        .fetch(&[saved[0].id.clone()])
        .await
        .unwrap();
    assert_eq!(fetched, saved);
}
