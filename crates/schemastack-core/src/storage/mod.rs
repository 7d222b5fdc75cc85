//! Storage layer
//!
//! A store is a single SQLite file bound to one schema model version.
//!
//! ## Layout
//!
//! - one table per entity, keyed by an `AUTOINCREMENT` primary key
//! - a `store_metadata` table holding a JSON [`StoreMetadata`] header
//!
//! The header records which model the store was written under, so
//! compatibility can be checked with [`read_metadata`] before the store is
//! opened.

pub mod engine;
pub mod error;
pub mod files;
pub mod metadata;
pub mod query;
pub mod schema;

pub use engine::{copy_store, SqliteStore, StoreTransaction};
pub use error::{StorageError, StorageResult};
pub use files::{StoreFiles, BACKUP_SUFFIX, PARTIAL_SUFFIX, SCRATCH_SUFFIX, STORE_EXTENSION};
pub use metadata::{read_metadata, StoreMetadata};
pub use query::{Comparison, FetchRequest, Predicate, SortDescriptor};
pub use schema::{init_schema, needs_init};
