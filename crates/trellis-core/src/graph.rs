// ABOUTME: In-memory object graph held by each context: registered objects plus pending edits.
// ABOUTME: Folds its own commits back in and merges change-sets from other contexts per conflict policy.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;

use serde_json::Value;
use thiserror::Error;

use crate::change::{ChangeSet, PendingChanges, PendingUpdate};
use crate::policy::ConflictPolicy;
use crate::record::{Attributes, ObjectKey, Record};

/// Errors from local edits that the graph cannot accept.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("object already exists: {0}")]
    AlreadyExists(ObjectKey),

    #[error("object is not registered in this context: {0}")]
    UnknownObject(ObjectKey),

    #[error("object is pending deletion: {0}")]
    Deleted(ObjectKey),
}

/// A single replayed entry that could not be applied. Never surfaced to
/// callers; the rest of the change-set is still merged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayDropError {
    #[error("object already deleted locally: {0}")]
    DeletedLocally(ObjectKey),
}

/// Tally of one merge.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub applied: usize,
    /// Updates for objects this context never registered; nothing to refresh.
    pub skipped: usize,
    pub dropped: Vec<ReplayDropError>,
}

/// The object graph of one context.
#[derive(Debug, Clone, Default)]
pub struct ObjectGraph {
    registered: BTreeMap<ObjectKey, Record>,
    inserted: BTreeMap<ObjectKey, Record>,
    updated: BTreeMap<ObjectKey, Attributes>,
    deleted: BTreeSet<ObjectKey>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object loaded from the store, replacing any stale copy.
    /// Pending local edits stay overlaid on top of it.
    pub fn register(&mut self, record: Record) {
        self.registered.insert(record.key.clone(), record);
    }

    /// Drop a registered object that no longer exists in the store, along
    /// with any pending update to it. Pending inserts are left alone.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.registered.remove(key);
        self.updated.remove(key);
        self.deleted.remove(key);
    }

    /// Keys of registered objects of one entity.
    pub fn registered_keys(&self, entity: &str) -> Vec<ObjectKey> {
        self.registered
            .keys()
            .filter(|k| k.entity == entity)
            .cloned()
            .collect()
    }

    pub fn is_registered(&self, key: &ObjectKey) -> bool {
        self.registered.contains_key(key)
    }

    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    pub fn has_changes(&self) -> bool {
        !self.inserted.is_empty() || !self.updated.is_empty() || !self.deleted.is_empty()
    }

    pub fn insert(&mut self, record: Record) -> Result<(), GraphError> {
        if self.get(&record.key).is_some() {
            return Err(GraphError::AlreadyExists(record.key));
        }
        self.inserted.insert(record.key.clone(), record);
        Ok(())
    }

    pub fn set(&mut self, key: &ObjectKey, name: &str, value: Value) -> Result<(), GraphError> {
        if let Some(record) = self.inserted.get_mut(key) {
            record.attributes.insert(name.to_string(), value);
            return Ok(());
        }
        if self.deleted.contains(key) {
            return Err(GraphError::Deleted(key.clone()));
        }
        if !self.registered.contains_key(key) {
            return Err(GraphError::UnknownObject(key.clone()));
        }
        self.updated
            .entry(key.clone())
            .or_default()
            .insert(name.to_string(), value);
        Ok(())
    }

    pub fn delete(&mut self, key: &ObjectKey) -> Result<(), GraphError> {
        if self.inserted.remove(key).is_some() {
            return Ok(());
        }
        if self.deleted.contains(key) {
            return Ok(());
        }
        if !self.registered.contains_key(key) {
            return Err(GraphError::UnknownObject(key.clone()));
        }
        self.updated.remove(key);
        self.deleted.insert(key.clone());
        Ok(())
    }

    /// The object as this context currently sees it, pending edits included.
    pub fn get(&self, key: &ObjectKey) -> Option<Record> {
        // A pending insert shadows a pending delete of the same key.
        if let Some(record) = self.inserted.get(key) {
            return Some(record.clone());
        }
        if self.deleted.contains(key) {
            return None;
        }
        let mut record = self.registered.get(key)?.clone();
        if let Some(changed) = self.updated.get(key) {
            record.apply(changed);
        }
        Some(record)
    }

    /// Every visible object of one entity, ordered by id.
    pub fn objects(&self, entity: &str) -> Vec<Record> {
        let keys: BTreeSet<&ObjectKey> = self
            .registered
            .keys()
            .chain(self.inserted.keys())
            .filter(|k| k.entity == entity)
            .collect();
        keys.into_iter().filter_map(|k| self.get(k)).collect()
    }

    /// Snapshot the pending edits for a commit.
    pub fn pending(&self) -> PendingChanges {
        PendingChanges {
            inserts: self.inserted.values().cloned().collect(),
            updates: self
                .updated
                .iter()
                .map(|(key, changed)| PendingUpdate {
                    key: key.clone(),
                    changed: changed.clone(),
                    full: self.get(key),
                })
                .collect(),
            deletes: self.deleted.iter().cloned().collect(),
        }
    }

    /// Discard every pending edit.
    pub fn rollback(&mut self) {
        self.inserted.clear();
        self.updated.clear();
        self.deleted.clear();
    }

    /// Fold this context's own successful commit into the registered objects.
    /// Updates the store refused (object deleted underneath) unregister it.
    pub fn absorb_commit(&mut self, change_set: &ChangeSet) {
        let dropped_updates = mem::take(&mut self.updated);
        self.inserted.clear();
        for key in mem::take(&mut self.deleted) {
            self.registered.remove(&key);
        }

        for key in &change_set.deleted {
            self.registered.remove(key);
        }
        for record in &change_set.inserted {
            self.registered.insert(record.key.clone(), record.clone());
        }
        for patch in &change_set.updated {
            if let Some(record) = self.registered.get_mut(&patch.key) {
                record.apply(&patch.changed);
            }
        }

        for key in dropped_updates.keys() {
            let written = change_set.updated.iter().any(|p| &p.key == key)
                || change_set.inserted.iter().any(|r| &r.key == key);
            if !written {
                self.registered.remove(key);
            }
        }
    }

    /// Merge a change-set committed by another context. Never produces
    /// pending edits of its own beyond re-homing a conflicting local insert.
    pub fn merge(&mut self, change_set: &ChangeSet, policy: ConflictPolicy) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for key in &change_set.deleted {
            self.registered.remove(key);
            self.updated.remove(key);
            self.deleted.remove(key);
            outcome.applied += 1;
        }

        for record in &change_set.inserted {
            let key = &record.key;
            if self.deleted.contains(key) {
                outcome
                    .dropped
                    .push(ReplayDropError::DeletedLocally(key.clone()));
                continue;
            }
            let local_insert = self.inserted.remove(key);
            if let Some(local) = local_insert
                && policy == ConflictPolicy::TrumpIncomingProperty
            {
                let leftover: Attributes = local
                    .attributes
                    .into_iter()
                    .filter(|(name, _)| !record.attributes.contains_key(name))
                    .collect();
                if !leftover.is_empty() {
                    self.updated.insert(key.clone(), leftover);
                }
            }
            if policy == ConflictPolicy::OverwriteWins {
                self.updated.remove(key);
            }
            self.registered.insert(key.clone(), record.clone());
            outcome.applied += 1;
        }

        for patch in &change_set.updated {
            let key = &patch.key;
            if self.deleted.contains(key) {
                outcome
                    .dropped
                    .push(ReplayDropError::DeletedLocally(key.clone()));
                continue;
            }
            if let Some(local) = self.inserted.get_mut(key) {
                local.apply(&patch.changed);
                outcome.applied += 1;
                continue;
            }
            let Some(record) = self.registered.get_mut(key) else {
                outcome.skipped += 1;
                continue;
            };
            record.apply(&patch.changed);

            match policy {
                ConflictPolicy::OverwriteWins => {
                    self.updated.remove(key);
                }
                ConflictPolicy::TrumpIncomingProperty => {
                    if let Some(local) = self.updated.get_mut(key) {
                        local.retain(|name, _| !patch.changed.contains_key(name));
                        if local.is_empty() {
                            self.updated.remove(key);
                        }
                    }
                }
            }
            outcome.applied += 1;
        }

        outcome
    }
}
