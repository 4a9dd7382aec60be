// ABOUTME: Context roles, their concurrency affinities, and conflict-resolution policies.
// ABOUTME: Each of the three roles maps to exactly one affinity and one policy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a conflict between in-memory state and incoming data is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Incoming data replaces the whole in-memory object; the writer's full
    /// object replaces the stored one on commit.
    OverwriteWins,
    /// Incoming data wins attribute by attribute; attributes it did not touch
    /// keep their local edits.
    TrumpIncomingProperty,
}

/// Which execution context may touch a given context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Affinity {
    /// No executor; used on the caller's own thread.
    Isolated,
    MainAffine,
    WorkerAffine,
}

/// The three contexts a coordinator keeps live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextRole {
    Root,
    Main,
    Worker,
}

impl ContextRole {
    pub fn affinity(&self) -> Affinity {
        match self {
            ContextRole::Root => Affinity::Isolated,
            ContextRole::Main => Affinity::MainAffine,
            ContextRole::Worker => Affinity::WorkerAffine,
        }
    }

    pub fn policy(&self) -> ConflictPolicy {
        match self {
            ContextRole::Root => ConflictPolicy::OverwriteWins,
            ContextRole::Main | ContextRole::Worker => ConflictPolicy::TrumpIncomingProperty,
        }
    }
}

impl fmt::Display for ContextRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextRole::Root => "root",
            ContextRole::Main => "main",
            ContextRole::Worker => "worker",
        };
        f.write_str(name)
    }
}
