// ABOUTME: Defines ObjectKey and Record, the unit of data stored and exchanged between contexts.
// ABOUTME: A record is an entity-scoped integer id plus a map of attribute names to JSON values.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Attribute values keyed by attribute name. Ordered so change-sets and
/// stored rows serialize deterministically.
pub type Attributes = BTreeMap<String, Value>;

/// Identifies one object: the entity it belongs to and its id within it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub entity: String,
    pub id: i64,
}

impl ObjectKey {
    pub fn new(entity: impl Into<String>, id: i64) -> Self {
        Self {
            entity: entity.into(),
            id,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// A full object: its key and every attribute value currently known for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: ObjectKey,
    pub attributes: Attributes,
}

impl Record {
    /// Create a record with no attributes.
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            attributes: Attributes::new(),
        }
    }

    /// Builder-style helper for setting one attribute.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Look up one attribute value.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Overlay a set of attribute values onto this record.
    pub fn apply(&mut self, changed: &Attributes) {
        for (name, value) in changed {
            self.attributes.insert(name.clone(), value.clone());
        }
    }
}
