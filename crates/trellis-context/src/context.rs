// ABOUTME: A Context is one unit-of-work view over the shared store: an object graph plus a role.
// ABOUTME: Handles local edits, fetches, commits, and replay of change-sets committed elsewhere.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use trellis_core::{
    Affinity, ChangeSet, ConflictPolicy, ContextRole, GraphError, MergeOutcome, ObjectGraph,
    ObjectKey, Origin, Record,
};
use trellis_store::{StoreError, StoreHandle};

/// A commit that the store refused. The context keeps its pending changes.
#[derive(Debug, Error)]
#[error("commit failed in {role} context: {source}")]
pub struct CommitError {
    pub role: ContextRole,
    #[source]
    pub source: StoreError,
}

/// Errors from operations on a context or its executor.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Commit(#[from] CommitError),

    #[error("{0} context executor has shut down")]
    ExecutorClosed(ContextRole),
}

pub struct Context {
    role: ContextRole,
    policy: ConflictPolicy,
    store: Arc<StoreHandle>,
    graph: ObjectGraph,
    /// Highest commit sequence replayed into this context.
    replayed_through: u64,
    /// Sequence of this context's most recent own commit.
    last_own_commit: u64,
    replays_received: u64,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("role", &self.role)
            .field("policy", &self.policy)
            .field("dirty", &self.has_changes())
            .field("replayed_through", &self.replayed_through)
            .finish()
    }
}

impl Context {
    /// Create a context for `role`, with the role's conflict policy, over `store`.
    pub fn new(role: ContextRole, store: Arc<StoreHandle>) -> Self {
        let replayed_through = match store.last_seq() {
            Ok(seq) => seq,
            Err(e) => {
                tracing::warn!(
                    "{} context created over an unusable store, starting at commit 0: {}",
                    role,
                    e
                );
                0
            }
        };
        Self {
            role,
            policy: role.policy(),
            store,
            graph: ObjectGraph::new(),
            replayed_through,
            last_own_commit: 0,
            replays_received: 0,
        }
    }

    pub fn role(&self) -> ContextRole {
        self.role
    }

    pub fn affinity(&self) -> Affinity {
        self.role.affinity()
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<StoreHandle> {
        &self.store
    }

    pub fn has_changes(&self) -> bool {
        self.graph.has_changes()
    }

    pub fn registered_count(&self) -> usize {
        self.graph.registered_count()
    }

    pub fn replayed_through(&self) -> u64 {
        self.replayed_through
    }

    /// Number of replays delivered to this context, including skipped ones.
    pub fn replays_received(&self) -> u64 {
        self.replays_received
    }

    pub fn insert(&mut self, record: Record) -> Result<(), ContextError> {
        Ok(self.graph.insert(record)?)
    }

    pub fn set(
        &mut self,
        key: &ObjectKey,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), ContextError> {
        Ok(self.graph.set(key, name, value.into())?)
    }

    pub fn delete(&mut self, key: &ObjectKey) -> Result<(), ContextError> {
        Ok(self.graph.delete(key)?)
    }

    /// The object as this context sees it, without touching the store.
    pub fn get(&self, key: &ObjectKey) -> Option<Record> {
        self.graph.get(key)
    }

    /// Every object of `entity` this context currently sees.
    pub fn objects(&self, entity: &str) -> Vec<Record> {
        self.graph.objects(entity)
    }

    /// Load one object from the store into this context. Pending local
    /// edits stay overlaid on the fresh copy.
    pub fn fetch(&mut self, key: &ObjectKey) -> Result<Option<Record>, ContextError> {
        match self.store.fetch(key)? {
            Some(record) => self.graph.register(record),
            None => self.graph.forget(key),
        }
        Ok(self.graph.get(key))
    }

    /// Load every object of `entity` from the store into this context.
    pub fn fetch_all(&mut self, entity: &str) -> Result<Vec<Record>, ContextError> {
        let records = self.store.fetch_all(entity)?;
        for key in self.graph.registered_keys(entity) {
            if !records.iter().any(|r| r.key == key) {
                self.graph.forget(&key);
            }
        }
        for record in records {
            self.graph.register(record);
        }
        Ok(self.graph.objects(entity))
    }

    /// Persist pending changes. Returns `None` when there was nothing to commit.
    pub fn commit(&mut self) -> Result<Option<Arc<ChangeSet>>, CommitError> {
        if !self.graph.has_changes() {
            return Ok(None);
        }

        let pending = self.graph.pending();
        let notification = self
            .store
            .commit(Origin::from(self.role), &pending, self.policy)
            .map_err(|source| CommitError {
                role: self.role,
                source,
            })?;

        self.graph.absorb_commit(&notification.change_set);
        self.last_own_commit = notification.seq();
        tracing::debug!("{} context committed seq {}", self.role, notification.seq());
        Ok(Some(notification.change_set))
    }

    pub fn rollback(&mut self) {
        self.graph.rollback();
    }

    /// Merge a change-set committed by another context. Returns `None` when
    /// the change-set was skipped as self-originated or already applied.
    pub fn apply_replay(&mut self, change_set: &ChangeSet) -> Option<MergeOutcome> {
        self.replays_received += 1;

        if change_set.origin == Origin::from(self.role) {
            tracing::debug!(
                "{} context ignoring replay of its own commit {}",
                self.role,
                change_set.seq
            );
            return None;
        }
        if change_set.seq <= self.replayed_through {
            tracing::debug!(
                "{} context already applied commit {}, skipping",
                self.role,
                change_set.seq
            );
            return None;
        }

        let outcome = self.graph.merge(change_set, self.policy);
        self.replayed_through = change_set.seq;

        for dropped in &outcome.dropped {
            tracing::debug!(
                "{} context dropped replay entry of commit {}: {}",
                self.role,
                change_set.seq,
                dropped
            );
        }

        // Our own later commit already moved past this one; trust the store.
        if change_set.seq < self.last_own_commit {
            self.refresh_touched(change_set);
        }

        tracing::debug!(
            "{} context replayed commit {} from {} ({} applied, {} skipped, {} dropped)",
            self.role,
            change_set.seq,
            change_set.origin,
            outcome.applied,
            outcome.skipped,
            outcome.dropped.len()
        );
        Some(outcome)
    }

    fn refresh_touched(&mut self, change_set: &ChangeSet) {
        let touched = change_set
            .inserted
            .iter()
            .map(|r| &r.key)
            .chain(change_set.updated.iter().map(|p| &p.key));

        for key in touched {
            if !self.graph.is_registered(key) {
                continue;
            }
            match self.store.fetch(key) {
                Ok(Some(record)) => self.graph.register(record),
                Ok(None) => self.graph.forget(key),
                Err(e) => {
                    tracing::warn!("{} context could not refresh {}: {}", self.role, key, e);
                }
            }
        }
    }
}
