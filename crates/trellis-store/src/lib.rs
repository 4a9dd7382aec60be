// ABOUTME: Persistence layer for trellis: the SQLite store engine, migrations, and bootstrap.
// ABOUTME: Exposes StoreHandle for commits and reads, and Bootstrapper for locating and seeding stores.

pub mod bootstrap;
pub mod engine;
pub mod error;
pub mod migration;

pub use bootstrap::{Bootstrapper, SeedPolicy};
pub use engine::{CommitObserver, StoreHandle, remove_store_files, store_files_for};
pub use error::{OpenError, StoreError, StoreOpenError};
pub use migration::{MigrationPlan, MigrationStep, StoreMigrationError, StoreOptions, plan_migration};
