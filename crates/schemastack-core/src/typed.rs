//! Typed access to stored records
//!
//! A domain type stays a plain value type. It is paired with a
//! [`ManagedType`] that knows which entity stores it and how to move its
//! state in and out of a [`Record`]. [`Repository`] then offers CRUD on the
//! domain type itself.
//!
//! ```ignore
//! struct NoteRecord;
//!
//! impl ManagedType for NoteRecord {
//!     type Domain = Note;
//!     const ENTITY_NAME: &'static str = "Note";
//!
//!     fn assign(record: &mut Record, note: &Note) {
//!         record.set("text", note.text.as_str());
//!     }
//!
//!     fn domain(record: &Record) -> Option<Note> {
//!         Some(Note {
//!             id: record.identifier(),
//!             text: record.text("text")?.to_string(),
//!         })
//!     }
//! }
//!
//! let notes = Repository::<NoteRecord>::new(stack);
//! let saved = notes.create(vec![Note::new("hello")]).await?;
//! ```
//!
//! Every call runs as a single job on the stack's worker, and every call
//! that writes commits exactly once.

use std::marker::PhantomData;

use crate::error::Result;
use crate::identifier::{HasIdentifier, Identifier, ObjectLocation};
use crate::record::Record;
use crate::stack::DataStack;
use crate::storage::{FetchRequest, Predicate, SqliteStore, StorageResult};

/// Binds a domain type to the entity that stores it
pub trait ManagedType: 'static {
    type Domain: HasIdentifier + Clone + Send + 'static;

    /// Entity storing the domain type
    const ENTITY_NAME: &'static str;

    /// Copy the state of `domain` onto `record`
    ///
    /// The identifier is not part of the state; records keep their own.
    fn assign(record: &mut Record, domain: &Self::Domain);

    /// Rebuild the domain value, with its identifier, from a stored record
    fn domain(record: &Record) -> Option<Self::Domain>;
}

/// CRUD for one managed type
pub struct Repository<M> {
    stack: DataStack,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Clone for Repository<M> {
    fn clone(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            _marker: PhantomData,
        }
    }
}

impl<M: ManagedType> Repository<M> {
    pub fn new(stack: DataStack) -> Self {
        Self {
            stack,
            _marker: PhantomData,
        }
    }

    pub fn stack(&self) -> &DataStack {
        &self.stack
    }

    /// Insert a new record for each object
    ///
    /// Objects should carry pending identifiers. An object that already has
    /// an identifier is stored again as a new record.
    ///
    /// The returned objects are rebuilt from the stored records, so they
    /// reflect normalization such as dates truncated to milliseconds.
    pub async fn create(&self, objects: Vec<M::Domain>) -> Result<Vec<M::Domain>> {
        self.stack
            .perform(move |store| {
                let records = store.write(|tx| {
                    objects
                        .iter()
                        .map(|object| {
                            let mut record = Record::new(M::ENTITY_NAME);
                            M::assign(&mut record, object);
                            tx.insert(&record)
                        })
                        .collect::<StorageResult<Vec<_>>>()
                })?;
                Ok(domains::<M>(&records))
            })
            .await
    }

    /// Fetch the objects behind `identifiers`
    ///
    /// Pending and unresolvable identifiers are skipped.
    pub async fn fetch(&self, identifiers: &[Identifier<M::Domain>]) -> Result<Vec<M::Domain>> {
        let raw = raw_identifiers(identifiers);
        self.stack
            .perform(move |store| {
                let mut records = Vec::with_capacity(raw.len());
                for location in raw.iter().filter_map(|raw| resolve::<M>(store, raw)) {
                    if let Some(record) = store.fetch(&location)? {
                        records.push(record);
                    }
                }
                Ok(domains::<M>(&records))
            })
            .await
    }

    /// Fetch the objects matching `request`
    pub async fn fetch_where(&self, request: FetchRequest) -> Result<Vec<M::Domain>> {
        let records = self.fetch_records(request).await?;
        Ok(domains::<M>(&records))
    }

    /// Fetch the raw records matching `request`
    pub async fn fetch_records(&self, request: FetchRequest) -> Result<Vec<Record>> {
        self.stack
            .perform(move |store| Ok(store.query(M::ENTITY_NAME, &request)?))
            .await
    }

    /// Number of records matching `predicate`, or of all records
    pub async fn count(&self, predicate: Option<Predicate>) -> Result<usize> {
        self.stack
            .perform(move |store| Ok(store.count(M::ENTITY_NAME, predicate.as_ref())?))
            .await
    }

    /// Write the state of each object back to its record
    ///
    /// Objects whose identifier does not resolve to a record are dropped
    /// from the result; the rest of the batch is still written.
    pub async fn update(&self, objects: Vec<M::Domain>) -> Result<Vec<M::Domain>> {
        self.stack
            .perform(move |store| {
                let targets: Vec<(ObjectLocation, &M::Domain)> = objects
                    .iter()
                    .filter_map(|object| {
                        let raw = object.id().as_str()?;
                        resolve::<M>(store, raw).map(|location| (location, object))
                    })
                    .collect();

                let records = store.write(|tx| {
                    let mut updated = Vec::with_capacity(targets.len());
                    for (location, object) in &targets {
                        let Some(mut record) = tx.fetch(location)? else {
                            continue;
                        };
                        M::assign(&mut record, object);
                        if tx.update(&record)? {
                            if let Some(stored) = tx.fetch(location)? {
                                updated.push(stored);
                            }
                        }
                    }
                    Ok(updated)
                })?;
                Ok(domains::<M>(&records))
            })
            .await
    }

    /// Delete the records behind `identifiers`; unresolvable ones are ignored
    pub async fn delete(&self, identifiers: &[Identifier<M::Domain>]) -> Result<()> {
        let raw = raw_identifiers(identifiers);
        self.stack
            .perform(move |store| {
                let locations: Vec<ObjectLocation> = raw
                    .iter()
                    .filter_map(|raw| resolve::<M>(store, raw))
                    .collect();

                store.write(|tx| {
                    for location in &locations {
                        tx.delete(location)?;
                    }
                    Ok(())
                })?;
                Ok(())
            })
            .await
    }
}

fn raw_identifiers<T>(identifiers: &[Identifier<T>]) -> Vec<String> {
    identifiers
        .iter()
        .filter_map(|id| id.as_str().map(str::to_string))
        .collect()
}

/// Location of `raw` if it names a record of this managed type's entity
fn resolve<M: ManagedType>(store: &SqliteStore, raw: &str) -> Option<ObjectLocation> {
    store
        .resolve(raw)
        .filter(|location| location.entity == M::ENTITY_NAME)
}

fn domains<M: ManagedType>(records: &[Record]) -> Vec<M::Domain> {
    records.iter().filter_map(M::domain).collect()
}
