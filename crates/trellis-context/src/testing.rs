// ABOUTME: Test utilities for trellis-context: a temp data/resources layout with a small schema.
// ABOUTME: Used by unit tests to open stores and coordinators without touching the user's data dir.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use trellis_store::{Bootstrapper, SeedPolicy, StoreHandle};

use crate::config::{CoordinatorConfig, FailurePolicy};

pub const SCHEMA: &str = r#"
name: DataModel
version: 1
entities:
  - name: Item
    attributes:
      - { name: name, type: string }
      - { name: count, type: integer, default: 0 }
"#;

/// A throwaway data directory plus resources holding the `DataModel` schema.
pub struct TestStore {
    _dir: TempDir,
    pub data: PathBuf,
    pub resources: PathBuf,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let data = dir.path().join("data");
        let resources = dir.path().join("resources");
        fs::create_dir_all(&resources).expect("create resources dir");
        fs::write(resources.join("DataModel.schema.yaml"), SCHEMA).expect("write schema");
        Self {
            _dir: dir,
            data,
            resources,
        }
    }

    /// Open the store directly, bypassing the coordinator.
    pub fn open(&self) -> Arc<StoreHandle> {
        let boot = Bootstrapper::new(self.data.clone(), self.resources.clone());
        Arc::new(
            boot.open_with("DataModel", SeedPolicy::Skip)
                .expect("open test store"),
        )
    }

    /// Coordinator config pointing at this layout. Fatal errors are reported,
    /// never aborted, so tests can assert on them.
    pub fn config(&self) -> CoordinatorConfig {
        CoordinatorConfig::new(self.data.clone(), self.resources.clone(), "DataModel")
            .with_failure_policy(FailurePolicy::Report)
    }
}
