// ABOUTME: Core library for trellis: records, schema descriptors, change-sets, and object graphs.
// ABOUTME: Shared by the store engine and the context runtime; performs no I/O of its own.

pub mod change;
pub mod graph;
pub mod policy;
pub mod record;
pub mod schema;

pub use change::{ChangeSet, CommitNotification, ObjectPatch, Origin, PendingChanges, PendingUpdate};
pub use graph::{GraphError, MergeOutcome, ObjectGraph, ReplayDropError};
pub use policy::{Affinity, ConflictPolicy, ContextRole};
pub use record::{Attributes, ObjectKey, Record};
pub use schema::{
    AttributeDescription, AttributeType, EntityDescription, SchemaDescriptor, SchemaError,
};
