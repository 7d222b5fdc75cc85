//! SchemaStack Core Library
//!
//! A versioned object store: records live in a SQLite file whose schema is
//! described by a bundled, versioned data model. When the application ships
//! a new model version, the store on disk is migrated through every version
//! in between before it is opened.
//!
//! # Architecture
//!
//! - **Registry**: loads every bundled version of a model
//! - **Migration**: replays mapping steps from the oldest compatible version
//! - **Stack**: owns the open store on a single worker thread
//! - **Repository**: typed CRUD for domain value types
//!
//! # Quick Start
//!
//! ```text
//! let config = Config::load()?;
//! let stack = DataStack::open(StackOptions::from_config(&config, "Notes"))?;
//!
//! let notes = Repository::<NoteRecord>::new(stack);
//! let saved = notes.create(vec![Note::new("hello")]).await?;
//! let again = notes.fetch(&[saved[0].id.clone()]).await?;
//! ```
//!
//! # Modules
//!
//! - `model`: schema models and entity descriptions
//! - `registry`: resource bundles and version ordering
//! - `compat`: store/model compatibility
//! - `mapping`: explicit and inferred mapping steps
//! - `migration`: the migration engine
//! - `stack`: store lifecycle and the serialized worker
//! - `typed`: typed repositories
//! - `storage`: the SQLite engine
//! - `config`: configuration

pub mod compat;
pub mod config;
pub mod error;
pub mod identifier;
pub mod mapping;
pub mod migration;
pub mod model;
pub mod record;
pub mod registry;
pub mod stack;
pub mod storage;
pub mod typed;
pub mod value;

pub use compat::is_compatible;
pub use config::Config;
pub use error::{Error, Result};
pub use identifier::{HasIdentifier, Identifier, ObjectLocation};
pub use mapping::{AttributeExpression, EntityMapping, MappingError, MappingOrigin, MappingStep};
pub use migration::{MigrationReport, Migrator, StepReport};
pub use model::{AttributeDescription, EntityDescription, RelationshipDescription, SchemaModel};
pub use record::Record;
pub use registry::{DirectoryBundle, MemoryBundle, ModelRegistry, ResourceBundle};
pub use stack::{DataStack, Mode, StackOptions};
pub use storage::{
    FetchRequest, Predicate, SortDescriptor, SqliteStore, StorageError, StoreMetadata,
};
pub use typed::{ManagedType, Repository};
pub use value::{AttributeKind, Value};
