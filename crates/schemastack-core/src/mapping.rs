//! Mappings between consecutive model versions
//!
//! A [`MappingStep`] says how to build every entity of a destination model
//! from the records of a source model. Steps are either bundled explicitly
//! as TOML resources or inferred from the structure of the two models.
//!
//! An explicit mapping lists only what differs; anything it leaves out is
//! carried over by name:
//!
//! ```toml
//! source_version = 1
//! destination_version = 2
//!
//! [[entity]]
//! destination = "Note"
//! source = "Note"
//!
//! [entity.attributes]
//! createdAt = { value = { date = "1970-01-01T00:00:00Z" } }
//! ```
//!
//! Inference never guesses. It follows names and renaming ids and gives up
//! with a [`MappingError`] as soon as the result would be ambiguous or could
//! not hold the source data.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{EntityDescription, SchemaModel};
use crate::record::Record;
use crate::storage::{SqliteStore, StorageResult, StoreTransaction};
use crate::value::{AttributeKind, Value};

/// Reasons a mapping cannot be built
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("Unknown entity '{0}'")]
    UnknownEntity(String),

    #[error("Unknown property '{property}' on entity '{entity}'")]
    UnknownAttribute { entity: String, property: String },

    #[error("'{entity}.{property}' changed from {from} to {to}")]
    KindChanged {
        entity: String,
        property: String,
        from: AttributeKind,
        to: AttributeKind,
    },

    #[error("'{entity}.{property}' is required but has no value to carry over")]
    RequiredWithoutValue { entity: String, property: String },

    #[error("Source entity '{source_entity}' is claimed by both '{first}' and '{second}'")]
    Ambiguous {
        source_entity: String,
        first: String,
        second: String,
    },

    #[error("Relationship '{entity}.{property}' now points at a different entity")]
    RelationshipRetargeted { entity: String, property: String },

    #[error("{0}")]
    Invalid(String),
}

/// Where a mapping step came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingOrigin {
    Explicit,
    Inferred,
}

impl std::fmt::Display for MappingOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MappingOrigin::Explicit => write!(f, "explicit"),
            MappingOrigin::Inferred => write!(f, "inferred"),
        }
    }
}

/// How one destination property gets its value
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttributeExpression {
    /// Copy the named property of the source record
    Source(String),
    /// Use a constant
    Value(Value),
    /// Leave unset so the destination default applies
    Default,
}

/// How to build the records of one destination entity
#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub destination: String,
    /// Entity whose records are carried over; `None` starts the entity empty
    pub source: Option<String>,
    /// Expression for every attribute and relationship of the destination
    pub properties: BTreeMap<String, AttributeExpression>,
}

impl EntityMapping {
    /// Build the destination record for one source record
    pub fn transform(&self, record: &Record) -> Record {
        let mut mapped = Record::new(&self.destination);
        for (property, expression) in &self.properties {
            let value = match expression {
                AttributeExpression::Source(name) => record.get(name).clone(),
                AttributeExpression::Value(value) => value.clone(),
                AttributeExpression::Default => continue,
            };
            if !value.is_null() {
                mapped.set(property.clone(), value);
            }
        }
        mapped
    }
}

/// Transformation from one model version to the next
#[derive(Debug, Clone, PartialEq)]
pub struct MappingStep {
    pub source_version: u32,
    pub destination_version: u32,
    pub origin: MappingOrigin,
    pub entities: Vec<EntityMapping>,
}

#[derive(Debug, Deserialize)]
struct MappingDescription {
    source_version: u32,
    destination_version: u32,
    #[serde(default, rename = "entity")]
    entities: Vec<EntityMappingDescription>,
}

#[derive(Debug, Deserialize)]
struct EntityMappingDescription {
    destination: String,
    source: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, AttributeExpression>,
}

impl MappingStep {
    /// Parse an explicit mapping resource
    ///
    /// Returns `None` if the resource maps a different version pair.
    pub fn from_toml(
        content: &str,
        source: &SchemaModel,
        destination: &SchemaModel,
    ) -> Result<Option<Self>, MappingError> {
        let description: MappingDescription =
            toml::from_str(content).map_err(|e| MappingError::Invalid(e.to_string()))?;

        if description.source_version != source.version()
            || description.destination_version != destination.version()
        {
            return Ok(None);
        }

        Self::explicit(source, destination, description.entities).map(Some)
    }

    fn explicit(
        source: &SchemaModel,
        destination: &SchemaModel,
        descriptions: Vec<EntityMappingDescription>,
    ) -> Result<Self, MappingError> {
        let mut listed: BTreeMap<String, EntityMappingDescription> = BTreeMap::new();
        for description in descriptions {
            if destination.entity(&description.destination).is_none() {
                return Err(MappingError::UnknownEntity(description.destination));
            }
            if let Some(name) = &description.source {
                if source.entity(name).is_none() {
                    return Err(MappingError::UnknownEntity(name.clone()));
                }
            }
            if listed.contains_key(&description.destination) {
                return Err(MappingError::Invalid(format!(
                    "entity '{}' is mapped twice",
                    description.destination
                )));
            }
            listed.insert(description.destination.clone(), description);
        }

        let mut entities = Vec::with_capacity(destination.entities().len());
        for target in destination.entities() {
            let (source_name, mut properties) = match listed.remove(&target.name) {
                Some(description) => (description.source, description.attributes),
                None => (
                    source.entity(&target.name).map(|e| e.name.clone()),
                    BTreeMap::new(),
                ),
            };
            let source_entity = source_name.as_deref().and_then(|name| source.entity(name));

            for (property, expression) in &properties {
                check_expression(target, source_entity, property, expression)?;
            }

            for property in target.property_names() {
                if properties.contains_key(property) {
                    continue;
                }
                let kind = target.property_kind(property);
                let carried = source_entity
                    .filter(|entity| kind.is_some() && entity.property_kind(property) == kind);
                let expression = match carried {
                    Some(_) => AttributeExpression::Source(property.to_string()),
                    None => AttributeExpression::Default,
                };
                properties.insert(property.to_string(), expression);
            }

            entities.push(EntityMapping {
                destination: target.name.clone(),
                source: source_name,
                properties,
            });
        }

        Ok(Self {
            source_version: source.version(),
            destination_version: destination.version(),
            origin: MappingOrigin::Explicit,
            entities,
        })
    }

    /// Infer a mapping from the structure of two models
    pub fn infer(source: &SchemaModel, destination: &SchemaModel) -> Result<Self, MappingError> {
        let mut sources: BTreeMap<String, String> = BTreeMap::new();
        let mut claimed: BTreeMap<&str, &str> = BTreeMap::new();

        for target in destination.entities() {
            let origin_name = target.renaming_id.as_deref().unwrap_or(&target.name);
            let Some(origin) = source.entity(origin_name) else {
                if target.renaming_id.is_some() {
                    return Err(MappingError::UnknownEntity(origin_name.to_string()));
                }
                continue;
            };

            if let Some(first) = claimed.insert(&origin.name, &target.name) {
                return Err(MappingError::Ambiguous {
                    source_entity: origin.name.clone(),
                    first: first.to_string(),
                    second: target.name.clone(),
                });
            }
            sources.insert(target.name.clone(), origin.name.clone());
        }

        let mut entities = Vec::with_capacity(destination.entities().len());
        for target in destination.entities() {
            let origin = sources.get(&target.name).and_then(|name| source.entity(name));
            let properties = infer_properties(target, origin, &sources)?;

            entities.push(EntityMapping {
                destination: target.name.clone(),
                source: origin.map(|e| e.name.clone()),
                properties,
            });
        }

        Ok(Self {
            source_version: source.version(),
            destination_version: destination.version(),
            origin: MappingOrigin::Inferred,
            entities,
        })
    }

    /// Copy every mapped record from `source` into `target`
    ///
    /// Primary keys and key sequences are carried over so record locations
    /// stay valid. Returns the number of records written.
    pub fn apply(&self, source: &SqliteStore, target: &mut StoreTransaction<'_>) -> StorageResult<usize> {
        let mut written = 0;

        for mapping in &self.entities {
            let Some(source_entity) = &mapping.source else {
                continue;
            };

            for record in source.read_all(source_entity)? {
                let Some(key) = record.location().map(|l| l.key) else {
                    continue;
                };
                target.insert_with_key(&mapping.transform(&record), key)?;
                written += 1;
            }

            target.raise_sequence(&mapping.destination, source.sequence(source_entity)?)?;
        }

        Ok(written)
    }
}

fn check_expression(
    target: &EntityDescription,
    source: Option<&EntityDescription>,
    property: &str,
    expression: &AttributeExpression,
) -> Result<(), MappingError> {
    let unknown = |entity: &EntityDescription, property: &str| MappingError::UnknownAttribute {
        entity: entity.name.clone(),
        property: property.to_string(),
    };

    let kind = target
        .property_kind(property)
        .ok_or_else(|| unknown(target, property))?;

    match expression {
        AttributeExpression::Source(name) => {
            let Some(source) = source else {
                return Err(MappingError::Invalid(format!(
                    "'{}.{}' copies '{}' but the entity has no source",
                    target.name, property, name
                )));
            };
            let found = source
                .property_kind(name)
                .ok_or_else(|| unknown(source, name))?;
            if found != kind {
                return Err(MappingError::KindChanged {
                    entity: target.name.clone(),
                    property: property.to_string(),
                    from: found,
                    to: kind,
                });
            }
        }
        AttributeExpression::Value(value) => {
            if !value.fits(kind) {
                return Err(MappingError::Invalid(format!(
                    "constant for '{}.{}' is not {}",
                    target.name, property, kind
                )));
            }
        }
        AttributeExpression::Default => {}
    }
    Ok(())
}

fn infer_properties(
    target: &EntityDescription,
    origin: Option<&EntityDescription>,
    sources: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, AttributeExpression>, MappingError> {
    let required = |property: &str| MappingError::RequiredWithoutValue {
        entity: target.name.clone(),
        property: property.to_string(),
    };

    let mut properties = BTreeMap::new();

    for attribute in &target.attributes {
        let has_default = attribute.default.is_some();
        let from_name = attribute.renaming_id.as_deref().unwrap_or(&attribute.name);

        match origin.and_then(|entity| entity.attribute(from_name)) {
            Some(from) => {
                if from.kind != attribute.kind {
                    return Err(MappingError::KindChanged {
                        entity: target.name.clone(),
                        property: attribute.name.clone(),
                        from: from.kind,
                        to: attribute.kind,
                    });
                }
                if from.optional && !attribute.optional && !has_default {
                    return Err(required(&attribute.name));
                }
                properties.insert(
                    attribute.name.clone(),
                    AttributeExpression::Source(from.name.clone()),
                );
            }
            None => {
                if let (Some(entity), Some(_)) = (origin, &attribute.renaming_id) {
                    return Err(MappingError::UnknownAttribute {
                        entity: entity.name.clone(),
                        property: from_name.to_string(),
                    });
                }
                // Only matters if there are records to carry over
                if origin.is_some() && !attribute.optional && !has_default {
                    return Err(required(&attribute.name));
                }
                properties.insert(attribute.name.clone(), AttributeExpression::Default);
            }
        }
    }

    for relationship in &target.relationships {
        let from_name = relationship
            .renaming_id
            .as_deref()
            .unwrap_or(&relationship.name);

        match origin.and_then(|entity| entity.relationship(from_name)) {
            Some(from) => {
                let expected = sources.get(&relationship.destination);
                if expected != Some(&from.destination) {
                    return Err(MappingError::RelationshipRetargeted {
                        entity: target.name.clone(),
                        property: relationship.name.clone(),
                    });
                }
                if from.optional && !relationship.optional {
                    return Err(required(&relationship.name));
                }
                properties.insert(
                    relationship.name.clone(),
                    AttributeExpression::Source(from.name.clone()),
                );
            }
            None => {
                if let (Some(entity), Some(_)) = (origin, &relationship.renaming_id) {
                    return Err(MappingError::UnknownAttribute {
                        entity: entity.name.clone(),
                        property: from_name.to_string(),
                    });
                }
                if origin.is_some() && !relationship.optional {
                    return Err(required(&relationship.name));
                }
                properties.insert(relationship.name.clone(), AttributeExpression::Default);
            }
        }
    }

    Ok(properties)
}
