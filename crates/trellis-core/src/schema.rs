// ABOUTME: Schema descriptor types: named, versioned entities with typed attributes.
// ABOUTME: Validates descriptors and checks inserted or updated records against them.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::{Attributes, ObjectKey, Record};

/// Errors raised when a descriptor is malformed or a record violates it.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("schema name must not be empty")]
    EmptyName,

    #[error("entity declared twice: {0}")]
    DuplicateEntity(String),

    #[error("attribute declared twice: {entity}.{attribute}")]
    DuplicateAttribute { entity: String, attribute: String },

    #[error("default for {entity}.{attribute} does not match its type {kind:?}")]
    BadDefault {
        entity: String,
        attribute: String,
        kind: AttributeType,
    },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("unknown attribute: {entity}.{attribute}")]
    UnknownAttribute { entity: String, attribute: String },

    #[error("value for {entity}.{attribute} is not a valid {kind:?}: {value}")]
    TypeMismatch {
        entity: String,
        attribute: String,
        kind: AttributeType,
        value: Value,
    },

    #[error("required attribute missing on {key}: {attribute}")]
    MissingAttribute { key: ObjectKey, attribute: String },
}

/// The value types an attribute may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    String,
    Integer,
    Double,
    Boolean,
    /// RFC 3339 string.
    Timestamp,
}

impl AttributeType {
    /// Whether a non-null JSON value is acceptable for this type.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            AttributeType::String => value.is_string(),
            AttributeType::Integer => value.is_i64(),
            AttributeType::Double => value.is_number(),
            AttributeType::Boolean => value.is_boolean(),
            AttributeType::Timestamp => value
                .as_str()
                .is_some_and(|s| DateTime::parse_from_rfc3339(s).is_ok()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeDescription {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
    #[serde(default)]
    pub optional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Name this attribute had in the previous schema version, if it was renamed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

impl AttributeDescription {
    /// True when an insert may omit this attribute.
    pub fn may_be_absent(&self) -> bool {
        self.optional || self.default.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDescription {
    pub name: String,
    #[serde(default)]
    pub attributes: Vec<AttributeDescription>,
}

impl EntityDescription {
    pub fn attribute(&self, name: &str) -> Option<&AttributeDescription> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// A named, versioned description of every entity the store may hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDescriptor {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub entities: Vec<EntityDescription>,
}

fn default_version() -> u32 {
    1
}

impl SchemaDescriptor {
    pub fn entity(&self, name: &str) -> Option<&EntityDescription> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Check the descriptor itself for duplicate names and mistyped defaults.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::EmptyName);
        }

        for (i, entity) in self.entities.iter().enumerate() {
            if self.entities[..i].iter().any(|e| e.name == entity.name) {
                return Err(SchemaError::DuplicateEntity(entity.name.clone()));
            }
            for (j, attr) in entity.attributes.iter().enumerate() {
                if entity.attributes[..j].iter().any(|a| a.name == attr.name) {
                    return Err(SchemaError::DuplicateAttribute {
                        entity: entity.name.clone(),
                        attribute: attr.name.clone(),
                    });
                }
                if let Some(default) = &attr.default
                    && !attr.kind.accepts(default)
                {
                    return Err(SchemaError::BadDefault {
                        entity: entity.name.clone(),
                        attribute: attr.name.clone(),
                        kind: attr.kind,
                    });
                }
            }
        }

        Ok(())
    }

    /// Validate a record about to be inserted and return it with schema
    /// defaults filled in for omitted attributes.
    pub fn prepare_insert(&self, record: &Record) -> Result<Record, SchemaError> {
        let entity = self
            .entity(&record.key.entity)
            .ok_or_else(|| SchemaError::UnknownEntity(record.key.entity.clone()))?;
        self.check_values(entity, &record.attributes)?;

        let mut prepared = record.clone();
        for attr in &entity.attributes {
            if prepared.attributes.contains_key(&attr.name) {
                continue;
            }
            match &attr.default {
                Some(default) => {
                    prepared.attributes.insert(attr.name.clone(), default.clone());
                }
                None if attr.optional => {}
                None => {
                    return Err(SchemaError::MissingAttribute {
                        key: record.key.clone(),
                        attribute: attr.name.clone(),
                    });
                }
            }
        }

        Ok(prepared)
    }

    /// Validate a partial update of an existing object.
    pub fn check_update(&self, key: &ObjectKey, changed: &Attributes) -> Result<(), SchemaError> {
        let entity = self
            .entity(&key.entity)
            .ok_or_else(|| SchemaError::UnknownEntity(key.entity.clone()))?;
        self.check_values(entity, changed)
    }

    fn check_values(
        &self,
        entity: &EntityDescription,
        values: &Attributes,
    ) -> Result<(), SchemaError> {
        for (name, value) in values {
            let attr = entity
                .attribute(name)
                .ok_or_else(|| SchemaError::UnknownAttribute {
                    entity: entity.name.clone(),
                    attribute: name.clone(),
                })?;
            let acceptable = if value.is_null() {
                attr.optional
            } else {
                attr.kind.accepts(value)
            };
            if !acceptable {
                return Err(SchemaError::TypeMismatch {
                    entity: entity.name.clone(),
                    attribute: name.clone(),
                    kind: attr.kind,
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}
