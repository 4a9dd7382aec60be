// ABOUTME: Locates the schema descriptor and store file, seeds the store on first run, and opens it.
// ABOUTME: Seed files are copied atomically (temp file, fsync, rename) and only when no store exists.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use trellis_core::SchemaDescriptor;

use crate::engine::StoreHandle;
use crate::error::{OpenError, StoreOpenError};
use crate::migration::StoreOptions;

/// Whether a bundled seed file may be copied in when no store exists yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedPolicy {
    CopyIfMissing,
    Skip,
}

/// Resolves resources and the per-user store location for a schema name.
///
/// Layout:
/// - `<resources>/<name>.schema.yaml`: schema descriptor (required)
/// - `<resources>/<name>.sqlite`: seed store (optional)
/// - `<data_dir>/<name>.sqlite`: the live store
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    data_dir: PathBuf,
    resources_dir: PathBuf,
    options: StoreOptions,
}

impl Bootstrapper {
    pub fn new(data_dir: PathBuf, resources_dir: PathBuf) -> Self {
        Self {
            data_dir,
            resources_dir,
            options: StoreOptions::default(),
        }
    }

    pub fn with_options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn schema_path(&self, name: &str) -> PathBuf {
        self.resources_dir.join(format!("{}.schema.yaml", name))
    }

    pub fn seed_path(&self, name: &str) -> PathBuf {
        self.resources_dir.join(format!("{}.sqlite", name))
    }

    pub fn store_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.sqlite", name))
    }

    /// Read and validate the schema descriptor bundled under `name`.
    pub fn load_schema(&self, name: &str) -> Result<SchemaDescriptor, StoreOpenError> {
        check_name(name)?;
        let path = self.schema_path(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreOpenError::SchemaNotFound(path));
            }
            Err(e) => {
                return Err(StoreOpenError::SchemaUnreadable {
                    path,
                    reason: e.to_string(),
                });
            }
        };

        let schema: SchemaDescriptor =
            serde_yaml::from_str(&text).map_err(|e| StoreOpenError::SchemaUnreadable {
                path: path.clone(),
                reason: e.to_string(),
            })?;
        schema.validate()?;

        if schema.name != name {
            tracing::warn!(
                "schema file {} declares name {}, expected {}",
                path.display(),
                schema.name,
                name
            );
        }
        Ok(schema)
    }

    /// Copy the bundled seed into place if no store file exists yet.
    /// Returns true when a seed was copied.
    pub fn seed_if_missing(&self, name: &str) -> Result<bool, io::Error> {
        let store = self.store_path(name);
        if store.exists() {
            return Ok(false);
        }
        let seed = self.seed_path(name);
        if !seed.is_file() {
            tracing::debug!("no seed store at {}", seed.display());
            return Ok(false);
        }

        fs::create_dir_all(&self.data_dir)?;
        copy_atomically(&seed, &store)?;
        tracing::info!("seeded {} from {}", store.display(), seed.display());
        Ok(true)
    }

    /// Open the store for `name`, seeding it first if it does not exist.
    pub fn open(&self, name: &str) -> Result<StoreHandle, OpenError> {
        self.open_with(name, SeedPolicy::CopyIfMissing)
    }

    pub fn open_with(&self, name: &str, seed: SeedPolicy) -> Result<StoreHandle, OpenError> {
        let schema = self.load_schema(name)?;

        if seed == SeedPolicy::CopyIfMissing
            && let Err(e) = self.seed_if_missing(name)
        {
            // The engine creates an empty store instead.
            tracing::error!("failed to copy seed store for {}: {}", name, e);
        }

        let path = self.store_path(name);
        let handle = StoreHandle::open_or_create(&path, schema, self.options)?;
        tracing::info!("opened store {}", path.display());
        Ok(handle)
    }
}

fn check_name(name: &str) -> Result<(), StoreOpenError> {
    let bad = name.trim().is_empty()
        || name.contains(['/', '\\'])
        || name == "."
        || name == "..";
    if bad {
        return Err(StoreOpenError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Copy `from` to `to` via a temp file so a crash never leaves a partial store.
fn copy_atomically(from: &Path, to: &Path) -> Result<(), io::Error> {
    let mut tmp_name = to.as_os_str().to_owned();
    tmp_name.push(".seed.tmp");
    let tmp_path = PathBuf::from(tmp_name);

    fs::copy(from, &tmp_path)?;
    File::open(&tmp_path)?.sync_all()?;
    fs::rename(&tmp_path, to)?;

    // Best-effort: the rename already succeeded.
    if let Some(parent) = to.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
