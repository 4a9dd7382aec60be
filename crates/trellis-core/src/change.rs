// ABOUTME: Defines pending changes, committed change-sets, and the commit notification envelope.
// ABOUTME: A change-set is the immutable record of one commit, tagged with its origin and sequence.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::policy::ContextRole;
use crate::record::{Attributes, ObjectKey, Record};

/// Who committed a change-set. Anything that is not one of the coordinator's
/// own contexts is `External`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum Origin {
    Root,
    Main,
    Worker,
    External(String),
}

impl From<ContextRole> for Origin {
    fn from(role: ContextRole) -> Self {
        match role {
            ContextRole::Root => Origin::Root,
            ContextRole::Main => Origin::Main,
            ContextRole::Worker => Origin::Worker,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Root => f.write_str("root"),
            Origin::Main => f.write_str("main"),
            Origin::Worker => f.write_str("worker"),
            Origin::External(name) => write!(f, "external:{}", name),
        }
    }
}

/// A set of attribute values changed on one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectPatch {
    pub key: ObjectKey,
    pub changed: Attributes,
}

/// An uncommitted update, carrying the context's full view of the object so
/// an overwrite-wins commit can write the whole thing.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingUpdate {
    pub key: ObjectKey,
    pub changed: Attributes,
    pub full: Option<Record>,
}

/// Everything a context wants to persist in one commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingChanges {
    pub inserts: Vec<Record>,
    pub updates: Vec<PendingUpdate>,
    pub deletes: Vec<ObjectKey>,
}

impl PendingChanges {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

/// The immutable result of one successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: Ulid,
    /// Store-wide commit sequence; strictly increasing per store handle.
    pub seq: u64,
    pub origin: Origin,
    pub committed_at: DateTime<Utc>,
    pub inserted: Vec<Record>,
    pub updated: Vec<ObjectPatch>,
    pub deleted: Vec<ObjectKey>,
}

impl ChangeSet {
    pub fn new(seq: u64, origin: Origin) -> Self {
        Self {
            id: Ulid::new(),
            seq,
            origin,
            committed_at: Utc::now(),
            inserted: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of entries across inserts, updates, and deletes.
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// Broadcast to observers the moment a commit succeeds.
#[derive(Debug, Clone)]
pub struct CommitNotification {
    pub change_set: Arc<ChangeSet>,
}

impl CommitNotification {
    pub fn new(change_set: ChangeSet) -> Self {
        Self {
            change_set: Arc::new(change_set),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.change_set.origin
    }

    pub fn seq(&self) -> u64 {
        self.change_set.seq
    }
}
