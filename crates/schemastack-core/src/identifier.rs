//! Record identifiers
//!
//! A domain object carries an [`Identifier`]: `pending` until it has been
//! saved, then `existing` with the URI of its durable location:
//!
//! ```text
//! x-schemastack://<store-uuid>/<Entity>/p<primary-key>
//! ```
//!
//! Locations are only meaningful against the store that minted them.
//! Migration keeps the store UUID and every primary key, so identifiers
//! survive schema upgrades.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, Result};

/// URI scheme of record locations
pub const LOCATION_SCHEME: &str = "x-schemastack";

/// Typed identifier of a domain object
pub struct Identifier<T> {
    raw: Option<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Identifier<T> {
    /// Identifier of an object that has not been saved yet
    pub fn pending() -> Self {
        Self {
            raw: None,
            _marker: PhantomData,
        }
    }

    /// Identifier of a saved object
    pub fn existing(raw: impl Into<String>) -> Self {
        Self {
            raw: Some(raw.into()),
            _marker: PhantomData,
        }
    }

    /// Whether the object has not been saved yet
    pub fn is_new(&self) -> bool {
        self.raw.is_none()
    }

    /// Raw location string of a saved object
    pub fn as_str(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    /// Reinterpret as the identifier of another type
    pub fn cast<U>(self) -> Identifier<U> {
        Identifier {
            raw: self.raw,
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Identifier<T> {
    fn default() -> Self {
        Self::pending()
    }
}

impl<T> Clone for Identifier<T> {
    fn clone(&self) -> Self {
        Self {
            raw: self.raw.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Identifier<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Identifier<T> {}

impl<T> Hash for Identifier<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> fmt::Debug for Identifier<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            Some(raw) => write!(f, "Identifier::existing({:?})", raw),
            None => f.write_str("Identifier::pending"),
        }
    }
}

impl<T> Serialize for Identifier<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.raw.serialize(serializer)
    }
}

impl<'de, T> Deserialize<'de> for Identifier<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(Self {
            raw: Option::<String>::deserialize(deserializer)?,
            _marker: PhantomData,
        })
    }
}

/// Domain types that carry their own identifier
pub trait HasIdentifier: Sized {
    fn id(&self) -> &Identifier<Self>;
}

/// Durable location of a record inside a specific store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectLocation {
    pub store_id: Uuid,
    pub entity: String,
    pub key: i64,
}

impl ObjectLocation {
    pub fn new(store_id: Uuid, entity: impl Into<String>, key: i64) -> Self {
        Self {
            store_id,
            entity: entity.into(),
            key,
        }
    }

    pub fn to_uri(&self) -> String {
        format!(
            "{}://{}/{}/p{}",
            LOCATION_SCHEME,
            self.store_id.hyphenated(),
            self.entity,
            self.key
        )
    }

    /// Parse a location URI
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || Error::MalformedIdentifier(raw.to_string());

        let url = Url::parse(raw).map_err(|_| malformed())?;
        if url.scheme() != LOCATION_SCHEME {
            return Err(malformed());
        }

        let store_id = url
            .host_str()
            .and_then(|host| Uuid::parse_str(host).ok())
            .ok_or_else(malformed)?;

        let segments: Vec<&str> = url.path_segments().ok_or_else(malformed)?.collect();
        let [entity, key] = segments.as_slice() else {
            return Err(malformed());
        };
        if entity.is_empty() {
            return Err(malformed());
        }
        let key = key
            .strip_prefix('p')
            .and_then(|digits| digits.parse::<i64>().ok())
            .filter(|key| *key > 0)
            .ok_or_else(malformed)?;

        Ok(Self::new(store_id, *entity, key))
    }

    /// Identifier of the domain object stored at this location
    pub fn identifier<T>(&self) -> Identifier<T> {
        Identifier::existing(self.to_uri())
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}
