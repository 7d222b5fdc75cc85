//! Schema models
//!
//! A [`SchemaModel`] describes the entities of one schema version. Models are
//! written as TOML:
//!
//! ```toml
//! [[entity]]
//! name = "Note"
//!
//! [[entity.attribute]]
//! name = "text"
//! kind = "text"
//!
//! [[entity.attribute]]
//! name = "createdAt"
//! kind = "date"
//! optional = true
//!
//! [[entity.relationship]]
//! name = "folder"
//! destination = "Folder"
//! ```
//!
//! Every entity gets a version hash over its structure (names, kinds and
//! optionality; defaults and renaming ids are excluded). Stores record these
//! hashes so compatibility can be decided without opening entity tables.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::storage::schema::METADATA_TABLE;
use crate::value::{AttributeKind, Value};

/// Column name reserved for the primary key of every entity table
pub const PRIMARY_KEY: &str = "pk";

/// A typed attribute of an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    pub kind: AttributeKind,
    #[serde(default)]
    pub optional: bool,
    /// Value used when a record leaves the attribute unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Name of the attribute this one was renamed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renaming_id: Option<String>,
}

impl AttributeDescription {
    pub fn new(name: impl Into<String>, kind: AttributeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            optional: false,
            default: None,
            renaming_id: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn renamed_from(mut self, name: impl Into<String>) -> Self {
        self.renaming_id = Some(name.into());
        self
    }
}

/// A to-one relationship, stored as the destination record's primary key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDescription {
    pub name: String,
    pub destination: String,
    #[serde(default = "default_true")]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renaming_id: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A persisted entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default, rename = "attribute")]
    pub attributes: Vec<AttributeDescription>,
    #[serde(default, rename = "relationship")]
    pub relationships: Vec<RelationshipDescription>,
    /// Name of the entity this one was renamed from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renaming_id: Option<String>,
}

impl EntityDescription {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            renaming_id: None,
        }
    }

    pub fn with_attribute(mut self, attribute: AttributeDescription) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_relationship(
        mut self,
        name: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        self.relationships.push(RelationshipDescription {
            name: name.into(),
            destination: destination.into(),
            optional: true,
            renaming_id: None,
        });
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipDescription> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Storage kind of an attribute or relationship
    pub fn property_kind(&self, name: &str) -> Option<AttributeKind> {
        if let Some(attribute) = self.attribute(name) {
            return Some(attribute.kind);
        }
        self.relationship(name).map(|_| AttributeKind::Integer)
    }

    /// Attribute names followed by relationship names, in declaration order
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.attributes
            .iter()
            .map(|a| a.name.as_str())
            .chain(self.relationships.iter().map(|r| r.name.as_str()))
    }

    /// Structural hash of this entity
    pub fn version_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"entity\0");
        hasher.update(self.name.as_bytes());

        let mut attributes: Vec<_> = self.attributes.iter().collect();
        attributes.sort_by(|a, b| a.name.cmp(&b.name));
        for attribute in attributes {
            hasher.update(
                format!(
                    "\nattribute\0{}\0{}\0{}",
                    attribute.name, attribute.kind, attribute.optional
                )
                .as_bytes(),
            );
        }

        let mut relationships: Vec<_> = self.relationships.iter().collect();
        relationships.sort_by(|a, b| a.name.cmp(&b.name));
        for relationship in relationships {
            hasher.update(
                format!(
                    "\nrelationship\0{}\0{}\0{}",
                    relationship.name, relationship.destination, relationship.optional
                )
                .as_bytes(),
            );
        }

        format!("{:x}", hasher.finalize())
    }
}

/// On-disk shape of a model resource
#[derive(Debug, Deserialize)]
struct ModelDescription {
    #[serde(default, rename = "entity")]
    entities: Vec<EntityDescription>,
}

/// One immutable version of a data model
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaModel {
    name: String,
    version: u32,
    entities: Vec<EntityDescription>,
    entity_hashes: BTreeMap<String, String>,
    signature: String,
}

impl SchemaModel {
    /// Build a model from entity descriptions, validating its structure
    ///
    /// `name` is the resource name of this version (e.g. `"Notes 2"`).
    pub fn new(
        name: impl Into<String>,
        version: u32,
        entities: Vec<EntityDescription>,
    ) -> Result<Self> {
        let name = name.into();
        validate(&name, &entities)?;

        let entity_hashes: BTreeMap<String, String> = entities
            .iter()
            .map(|e| (e.name.clone(), e.version_hash()))
            .collect();

        let mut hasher = Sha256::new();
        for (entity, hash) in &entity_hashes {
            hasher.update(entity.as_bytes());
            hasher.update(b"\0");
            hasher.update(hash.as_bytes());
            hasher.update(b"\n");
        }
        let signature = format!("{:x}", hasher.finalize());

        Ok(Self {
            name,
            version,
            entities,
            entity_hashes,
            signature,
        })
    }

    /// Parse a model from its TOML description
    pub fn from_toml(name: impl Into<String>, version: u32, source: &str) -> Result<Self> {
        let name = name.into();
        let description: ModelDescription =
            toml::from_str(source).map_err(|e| Error::InvalidModel {
                resource: name.clone(),
                details: e.to_string(),
            })?;
        Self::new(name, version, description.entities)
    }

    /// Resource name of this version
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordinal version, taken from the resource name
    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entities(&self) -> &[EntityDescription] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Per-entity version hashes, keyed by entity name
    pub fn entity_hashes(&self) -> &BTreeMap<String, String> {
        &self.entity_hashes
    }

    /// Content hash of the whole model
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

/// Name of the index backing a relationship column
pub(crate) fn relationship_index(entity: &str, relationship: &str) -> String {
    format!("idx_{}_{}", entity, relationship)
}

/// Names end up as quoted SQL identifiers and URI path segments
fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Table names owned by the store itself; SQLite compares them case-insensitively
fn is_reserved_table(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower == METADATA_TABLE || lower.starts_with("sqlite_")
}

fn validate(model: &str, entities: &[EntityDescription]) -> Result<()> {
    let invalid = |details: String| Error::InvalidModel {
        resource: model.to_string(),
        details,
    };

    let entity_names: BTreeSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();
    let mut tables = BTreeSet::new();
    let mut indexes = BTreeSet::new();

    for entity in entities {
        if !is_valid_identifier(&entity.name) || is_reserved_table(&entity.name) {
            return Err(invalid(format!("invalid entity name '{}'", entity.name)));
        }
        if !tables.insert(entity.name.to_ascii_lowercase()) {
            return Err(invalid(format!("duplicate entity name '{}'", entity.name)));
        }

        let mut seen = BTreeSet::new();
        for property in entity.property_names() {
            if !is_valid_identifier(property) || property.eq_ignore_ascii_case(PRIMARY_KEY) {
                return Err(invalid(format!(
                    "invalid property name '{}.{}'",
                    entity.name, property
                )));
            }
            if !seen.insert(property.to_ascii_lowercase()) {
                return Err(invalid(format!(
                    "duplicate property '{}.{}'",
                    entity.name, property
                )));
            }
        }

        for relationship in &entity.relationships {
            let index = relationship_index(&entity.name, &relationship.name).to_ascii_lowercase();
            if !indexes.insert(index) {
                return Err(invalid(format!(
                    "relationship '{}.{}' clashes with another relationship's index",
                    entity.name, relationship.name
                )));
            }
        }

        for attribute in &entity.attributes {
            if let Some(default) = &attribute.default {
                if !default.fits(attribute.kind) {
                    return Err(invalid(format!(
                        "default of '{}.{}' is not {}",
                        entity.name, attribute.name, attribute.kind
                    )));
                }
            }
        }

        for relationship in &entity.relationships {
            if !entity_names.contains(relationship.destination.as_str()) {
                return Err(invalid(format!(
                    "relationship '{}.{}' targets unknown entity '{}'",
                    entity.name, relationship.name, relationship.destination
                )));
            }
        }
    }

    if let Some(name) = tables.intersection(&indexes).next() {
        return Err(invalid(format!("entity '{}' clashes with a relationship index", name)));
    }

    Ok(())
}
