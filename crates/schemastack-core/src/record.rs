//! Untyped persisted records

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::identifier::{Identifier, ObjectLocation};
use crate::value::Value;

static NULL: Value = Value::Null;

/// A row of one entity, keyed by property name
///
/// Relationship properties hold the destination record's primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    entity: String,
    location: Option<ObjectLocation>,
    values: BTreeMap<String, Value>,
}

impl Record {
    /// A new, unsaved record
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            location: None,
            values: BTreeMap::new(),
        }
    }

    pub(crate) fn stored(location: ObjectLocation, values: BTreeMap<String, Value>) -> Self {
        Self {
            entity: location.entity.clone(),
            location: Some(location),
            values,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Durable location, `None` until saved
    pub fn location(&self) -> Option<&ObjectLocation> {
        self.location.as_ref()
    }

    /// Identifier of the domain object this record stores
    pub fn identifier<T>(&self) -> Identifier<T> {
        self.location
            .as_ref()
            .map(ObjectLocation::identifier)
            .unwrap_or_default()
    }

    /// Value of a property; `Null` when unset
    pub fn get(&self, property: &str) -> &Value {
        self.values.get(property).unwrap_or(&NULL)
    }

    pub fn set(&mut self, property: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(property.into(), value.into());
    }

    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(property, value);
        self
    }

    pub fn remove(&mut self, property: &str) -> Option<Value> {
        self.values.remove(property)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn text(&self, property: &str) -> Option<&str> {
        self.get(property).as_text()
    }

    pub fn integer(&self, property: &str) -> Option<i64> {
        self.get(property).as_integer()
    }

    pub fn real(&self, property: &str) -> Option<f64> {
        self.get(property).as_real()
    }

    pub fn boolean(&self, property: &str) -> Option<bool> {
        self.get(property).as_bool()
    }

    pub fn date(&self, property: &str) -> Option<DateTime<Utc>> {
        self.get(property).as_date()
    }

    pub fn binary(&self, property: &str) -> Option<&[u8]> {
        self.get(property).as_binary()
    }
}
