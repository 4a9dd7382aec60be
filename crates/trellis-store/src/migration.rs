// ABOUTME: Plans and applies automatic migrations between two schema descriptor versions.
// ABOUTME: Additive changes and inferred renames migrate; type changes and new required fields do not.

use std::collections::BTreeMap;

use rusqlite::{Transaction, params};
use serde_json::Value;
use thiserror::Error;
use trellis_core::{AttributeType, Attributes, EntityDescription, SchemaDescriptor};

/// Reasons an existing store cannot be brought up to the current schema.
#[derive(Debug, Error)]
pub enum StoreMigrationError {
    #[error("store was created for schema {stored}, not {current}")]
    SchemaNameMismatch { stored: String, current: String },

    #[error("store schema version {stored} is newer than current version {current}")]
    Downgrade { stored: u32, current: u32 },

    #[error("schema changed (version {stored} -> {current}) and automatic migration is disabled")]
    MigrationDisabled { stored: u32, current: u32 },

    #[error("attribute {entity}.{attribute} changed type from {from:?} to {to:?}")]
    TypeChanged {
        entity: String,
        attribute: String,
        from: AttributeType,
        to: AttributeType,
    },

    #[error("attribute {entity}.{attribute} is required but has no default")]
    RequiredWithoutDefault { entity: String, attribute: String },

    #[error("attribute {entity}.{attribute} renames {from} but mapping inference is disabled")]
    MappingRequired {
        entity: String,
        attribute: String,
        from: String,
    },

    #[error("sqlite error during migration: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("stored row is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Switches controlling which schema changes may be migrated without help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub auto_migrate: bool,
    pub infer_mapping: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            auto_migrate: true,
            infer_mapping: true,
        }
    }
}

/// One data-affecting step of a migration.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStep {
    AddEntity(String),
    DropEntity(String),
    AddAttribute {
        entity: String,
        attribute: String,
        default: Option<Value>,
    },
    DropAttribute {
        entity: String,
        attribute: String,
    },
    RenameAttribute {
        entity: String,
        from: String,
        to: String,
    },
}

impl MigrationStep {
    fn entity(&self) -> &str {
        match self {
            MigrationStep::AddEntity(e) | MigrationStep::DropEntity(e) => e,
            MigrationStep::AddAttribute { entity, .. }
            | MigrationStep::DropAttribute { entity, .. }
            | MigrationStep::RenameAttribute { entity, .. } => entity,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    pub from_version: u32,
    pub to_version: u32,
    pub steps: Vec<MigrationStep>,
}

/// Compare the stored descriptor against the current one. Returns `None`
/// when they are identical.
pub fn plan_migration(
    stored: &SchemaDescriptor,
    current: &SchemaDescriptor,
    options: StoreOptions,
) -> Result<Option<MigrationPlan>, StoreMigrationError> {
    if stored == current {
        return Ok(None);
    }
    if stored.name != current.name {
        return Err(StoreMigrationError::SchemaNameMismatch {
            stored: stored.name.clone(),
            current: current.name.clone(),
        });
    }
    if stored.version > current.version {
        return Err(StoreMigrationError::Downgrade {
            stored: stored.version,
            current: current.version,
        });
    }
    if !options.auto_migrate {
        return Err(StoreMigrationError::MigrationDisabled {
            stored: stored.version,
            current: current.version,
        });
    }

    let mut steps = Vec::new();
    for entity in &current.entities {
        match stored.entity(&entity.name) {
            None => steps.push(MigrationStep::AddEntity(entity.name.clone())),
            Some(old) => plan_entity(old, entity, options, &mut steps)?,
        }
    }
    for old in &stored.entities {
        if current.entity(&old.name).is_none() {
            steps.push(MigrationStep::DropEntity(old.name.clone()));
        }
    }

    Ok(Some(MigrationPlan {
        from_version: stored.version,
        to_version: current.version,
        steps,
    }))
}

fn plan_entity(
    old: &EntityDescription,
    new: &EntityDescription,
    options: StoreOptions,
    steps: &mut Vec<MigrationStep>,
) -> Result<(), StoreMigrationError> {
    let mut renamed_sources = Vec::new();

    for attr in &new.attributes {
        if let Some(old_attr) = old.attribute(&attr.name) {
            if old_attr.kind != attr.kind {
                return Err(StoreMigrationError::TypeChanged {
                    entity: new.name.clone(),
                    attribute: attr.name.clone(),
                    from: old_attr.kind,
                    to: attr.kind,
                });
            }
            if old_attr.optional && !attr.may_be_absent() {
                return Err(StoreMigrationError::RequiredWithoutDefault {
                    entity: new.name.clone(),
                    attribute: attr.name.clone(),
                });
            }
            if old_attr.optional && !attr.optional {
                // Rows that never set it pick up the new default.
                steps.push(MigrationStep::AddAttribute {
                    entity: new.name.clone(),
                    attribute: attr.name.clone(),
                    default: attr.default.clone(),
                });
            }
            continue;
        }

        let rename_source = attr
            .renamed_from
            .as_ref()
            .and_then(|from| old.attribute(from))
            .filter(|source| new.attribute(&source.name).is_none());

        if let Some(source) = rename_source {
            if !options.infer_mapping {
                return Err(StoreMigrationError::MappingRequired {
                    entity: new.name.clone(),
                    attribute: attr.name.clone(),
                    from: source.name.clone(),
                });
            }
            if source.kind != attr.kind {
                return Err(StoreMigrationError::TypeChanged {
                    entity: new.name.clone(),
                    attribute: attr.name.clone(),
                    from: source.kind,
                    to: attr.kind,
                });
            }
            renamed_sources.push(source.name.clone());
            steps.push(MigrationStep::RenameAttribute {
                entity: new.name.clone(),
                from: source.name.clone(),
                to: attr.name.clone(),
            });
            continue;
        }

        if !attr.may_be_absent() {
            return Err(StoreMigrationError::RequiredWithoutDefault {
                entity: new.name.clone(),
                attribute: attr.name.clone(),
            });
        }
        steps.push(MigrationStep::AddAttribute {
            entity: new.name.clone(),
            attribute: attr.name.clone(),
            default: attr.default.clone(),
        });
    }

    for old_attr in &old.attributes {
        if new.attribute(&old_attr.name).is_none() && !renamed_sources.contains(&old_attr.name) {
            steps.push(MigrationStep::DropAttribute {
                entity: new.name.clone(),
                attribute: old_attr.name.clone(),
            });
        }
    }

    Ok(())
}

/// Apply a plan inside an open transaction. Returns the number of rows rewritten.
pub fn apply_plan(tx: &Transaction<'_>, plan: &MigrationPlan) -> Result<usize, StoreMigrationError> {
    let mut by_entity: BTreeMap<&str, Vec<&MigrationStep>> = BTreeMap::new();
    for step in &plan.steps {
        match step {
            MigrationStep::AddEntity(_) => {}
            MigrationStep::DropEntity(entity) => {
                let removed = tx.execute("DELETE FROM objects WHERE entity = ?1", params![entity])?;
                tracing::info!("migration dropped entity {} ({} rows)", entity, removed);
            }
            _ => by_entity.entry(step.entity()).or_default().push(step),
        }
    }

    let mut rewritten = 0;
    for (entity, steps) in by_entity {
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, attributes FROM objects WHERE entity = ?1")?;
            let mapped = stmt.query_map(params![entity], |row| Ok((row.get(0)?, row.get(1)?)))?;
            mapped.collect::<Result<_, _>>()?
        };

        for (id, json) in rows {
            let mut attributes: Attributes = serde_json::from_str(&json)?;
            for step in &steps {
                rewrite(&mut attributes, step);
            }
            tx.execute(
                "UPDATE objects SET attributes = ?1 WHERE entity = ?2 AND id = ?3",
                params![serde_json::to_string(&attributes)?, entity, id],
            )?;
            rewritten += 1;
        }
    }

    Ok(rewritten)
}

fn rewrite(attributes: &mut Attributes, step: &MigrationStep) {
    match step {
        MigrationStep::AddAttribute {
            attribute,
            default: Some(default),
            ..
        } => {
            let missing = attributes.get(attribute).is_none_or(Value::is_null);
            if missing {
                attributes.insert(attribute.clone(), default.clone());
            }
        }
        MigrationStep::DropAttribute { attribute, .. } => {
            attributes.remove(attribute);
        }
        MigrationStep::RenameAttribute { from, to, .. } => {
            if let Some(value) = attributes.remove(from) {
                attributes.insert(to.clone(), value);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serde_json::json;

    fn schema(yaml: &str) -> SchemaDescriptor {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn v1() -> SchemaDescriptor {
        schema(
            r#"
name: DataModel
version: 1
entities:
  - name: Item
    attributes:
      - { name: name, type: string }
      - { name: colour, type: string, optional: true }
"#,
        )
    }

    #[test]
    fn identical_descriptors_need_no_plan() {
        assert_eq!(plan_migration(&v1(), &v1(), StoreOptions::default()).unwrap(), None);
    }

    #[test]
    fn additive_change_is_planned() {
        let v2 = schema(
            r#"
name: DataModel
version: 2
entities:
  - name: Item
    attributes:
      - { name: name, type: string }
      - { name: colour, type: string, optional: true }
      - { name: count, type: integer, default: 0 }
  - name: Tag
    attributes:
      - { name: label, type: string }
"#,
        );
        let plan = plan_migration(&v1(), &v2, StoreOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(plan.from_version, 1);
        assert_eq!(plan.to_version, 2);
        assert!(plan.steps.contains(&MigrationStep::AddAttribute {
            entity: "Item".to_string(),
            attribute: "count".to_string(),
            default: Some(json!(0)),
        }));
        assert!(plan.steps.contains(&MigrationStep::AddEntity("Tag".to_string())));
    }

    #[test]
    fn type_change_is_incompatible() {
        let v2 = schema(
            r#"
name: DataModel
version: 2
entities:
  - name: Item
    attributes:
      - { name: name, type: integer }
"#,
        );
        let err = plan_migration(&v1(), &v2, StoreOptions::default()).unwrap_err();
        assert!(matches!(err, StoreMigrationError::TypeChanged { .. }));
    }

    #[test]
    fn new_required_attribute_without_default_is_incompatible() {
        let v2 = schema(
            r#"
name: DataModel
version: 2
entities:
  - name: Item
    attributes:
      - { name: name, type: string }
      - { name: owner, type: string }
"#,
        );
        let err = plan_migration(&v1(), &v2, StoreOptions::default()).unwrap_err();
        assert!(matches!(err, StoreMigrationError::RequiredWithoutDefault { .. }));
    }

    #[test]
    fn rename_needs_mapping_inference() {
        let v2 = schema(
            r#"
name: DataModel
version: 2
entities:
  - name: Item
    attributes:
      - { name: title, type: string, renamed_from: name }
      - { name: colour, type: string, optional: true }
"#,
        );
        let plan = plan_migration(&v1(), &v2, StoreOptions::default())
            .unwrap()
            .unwrap();
        assert_eq!(
            plan.steps,
            vec![MigrationStep::RenameAttribute {
                entity: "Item".to_string(),
                from: "name".to_string(),
                to: "title".to_string(),
            }]
        );

        let strict = StoreOptions {
            auto_migrate: true,
            infer_mapping: false,
        };
        let err = plan_migration(&v1(), &v2, strict).unwrap_err();
        assert!(matches!(err, StoreMigrationError::MappingRequired { .. }));
    }

    #[test]
    fn disabled_migration_and_downgrade_are_rejected() {
        let mut v2 = v1();
        v2.version = 2;
        v2.entities[0].attributes.pop();

        let off = StoreOptions {
            auto_migrate: false,
            infer_mapping: true,
        };
        assert!(matches!(
            plan_migration(&v1(), &v2, off).unwrap_err(),
            StoreMigrationError::MigrationDisabled { .. }
        ));
        assert!(matches!(
            plan_migration(&v2, &v1(), StoreOptions::default()).unwrap_err(),
            StoreMigrationError::Downgrade { .. }
        ));
    }

    #[test]
    fn apply_plan_rewrites_rows() {
        let mut conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE objects (
                entity TEXT NOT NULL,
                id INTEGER NOT NULL,
                attributes TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity, id)
            );
            INSERT INTO objects VALUES ('Item', 1, '{\"name\":\"a\",\"colour\":\"red\"}', '');
            INSERT INTO objects VALUES ('Gone', 1, '{}', '');",
        )
        .unwrap();

        let plan = MigrationPlan {
            from_version: 1,
            to_version: 2,
            steps: vec![
                MigrationStep::RenameAttribute {
                    entity: "Item".to_string(),
                    from: "name".to_string(),
                    to: "title".to_string(),
                },
                MigrationStep::DropAttribute {
                    entity: "Item".to_string(),
                    attribute: "colour".to_string(),
                },
                MigrationStep::AddAttribute {
                    entity: "Item".to_string(),
                    attribute: "count".to_string(),
                    default: Some(json!(0)),
                },
                MigrationStep::DropEntity("Gone".to_string()),
            ],
        };

        let tx = conn.transaction().unwrap();
        let rewritten = apply_plan(&tx, &plan).unwrap();
        tx.commit().unwrap();
        assert_eq!(rewritten, 1);

        let json: String = conn
            .query_row(
                "SELECT attributes FROM objects WHERE entity = 'Item' AND id = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        let attrs: Attributes = serde_json::from_str(&json).unwrap();
        assert_eq!(attrs.get("title"), Some(&json!("a")));
        assert_eq!(attrs.get("count"), Some(&json!(0)));
        assert!(attrs.get("colour").is_none());

        let gone: i64 = conn
            .query_row("SELECT COUNT(*) FROM objects WHERE entity = 'Gone'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(gone, 0);
    }
}
