// ABOUTME: Owns the store handle, the three contexts, and the propagator for one coordinator.
// ABOUTME: Provides root saves, full resets to an empty store, and a lazily-initialized shared cell.

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use trellis_core::ContextRole;
use trellis_store::{Bootstrapper, OpenError, SeedPolicy, StoreHandle, remove_store_files};

use crate::config::CoordinatorConfig;
use crate::context::{CommitError, Context};
use crate::executor::{self, ContextHandle};
use crate::propagator::ChangePropagator;

/// Errors from opening a coordinator.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("a tokio runtime is required to run context executors")]
    NoRuntime,

    #[error(transparent)]
    Open(#[from] OpenError),
}

/// Errors from resetting a coordinator. After either, the coordinator is
/// left closed and every context call fails.
#[derive(Debug, Error)]
pub enum ResetError {
    #[error("failed to remove store file {path}: {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to reopen store after reset: {0}")]
    Reopen(#[from] OpenError),
}

/// The three contexts bound to one open store, plus the executors behind
/// main and worker.
#[derive(Debug)]
pub struct ContextSet {
    pub store: Arc<StoreHandle>,
    pub root: Arc<Mutex<Context>>,
    pub main: ContextHandle,
    pub worker: ContextHandle,
    executors: Vec<JoinHandle<()>>,
}

impl ContextSet {
    /// Build root, main, and worker over `store` and register the propagator
    /// that keeps main and worker in step with every commit.
    pub fn create(store: Arc<StoreHandle>, runtime: &Handle) -> Self {
        let root = Context::new(ContextRole::Root, Arc::clone(&store));
        let (main, main_join) =
            executor::spawn(Context::new(ContextRole::Main, Arc::clone(&store)), runtime);
        let (worker, worker_join) =
            executor::spawn(Context::new(ContextRole::Worker, Arc::clone(&store)), runtime);

        store.register_observer(Arc::new(ChangePropagator::new(main.clone(), worker.clone())));

        Self {
            store,
            root: Arc::new(Mutex::new(root)),
            main,
            worker,
            executors: vec![main_join, worker_join],
        }
    }

    /// Stop the executors and close the store. Returns the executor tasks so
    /// the caller can wait for them to finish.
    fn shut_down(&mut self) -> Vec<JoinHandle<()>> {
        self.main.shutdown();
        self.worker.shutdown();
        self.store.close();
        std::mem::take(&mut self.executors)
    }
}

fn lock_context(root: &Mutex<Context>) -> MutexGuard<'_, Context> {
    root.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Coordinates one store and its contexts for the life of the process.
pub struct LifecycleManager {
    config: CoordinatorConfig,
    bootstrapper: Bootstrapper,
    runtime: Handle,
    set: RwLock<ContextSet>,
    generation: AtomicU64,
    resetting: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("schema", &self.config.schema_name)
            .field("store", &self.store().path())
            .field("generation", &self.generation())
            .finish()
    }
}

impl LifecycleManager {
    /// Bootstrap the store and build the context set on the current tokio runtime.
    pub fn open(config: CoordinatorConfig) -> Result<Self, LifecycleError> {
        let runtime = Handle::try_current().map_err(|_| LifecycleError::NoRuntime)?;
        Self::open_with_runtime(config, runtime)
    }

    /// Like `open`, spawning executors on `runtime`.
    pub fn open_with_runtime(
        config: CoordinatorConfig,
        runtime: Handle,
    ) -> Result<Self, LifecycleError> {
        let bootstrapper = Bootstrapper::new(config.data_dir.clone(), config.resources_dir.clone())
            .with_options(config.store_options);

        let store = match bootstrapper.open(&config.schema_name) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                config.on_fatal.handle("store bootstrap", &e);
                return Err(e.into());
            }
        };

        let set = ContextSet::create(store, &runtime);
        tracing::info!(
            "coordinator ready for {} at {}",
            config.schema_name,
            set.store.path().display()
        );

        Ok(Self {
            config,
            bootstrapper,
            runtime,
            set: RwLock::new(set),
            generation: AtomicU64::new(0),
            resetting: tokio::sync::Mutex::new(()),
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, ContextSet> {
        self.set.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// The root context. Lock it to use it on the calling thread. A handle
    /// taken before a reset keeps pointing at the discarded context.
    pub fn root(&self) -> Arc<Mutex<Context>> {
        Arc::clone(&self.read().root)
    }

    /// Run `f` against the current root context.
    pub fn with_root<R>(&self, f: impl FnOnce(&mut Context) -> R) -> R {
        let root = self.root();
        let mut guard = lock_context(&root);
        f(&mut *guard)
    }

    pub fn main(&self) -> ContextHandle {
        self.read().main.clone()
    }

    pub fn worker(&self) -> ContextHandle {
        self.read().worker.clone()
    }

    pub fn store(&self) -> Arc<StoreHandle> {
        Arc::clone(&self.read().store)
    }

    /// Number of resets performed so far.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Commit the root context if it has changes.
    pub fn save_root(&self) -> Result<(), CommitError> {
        let shared = self.root();
        let mut root = lock_context(&shared);
        if !root.has_changes() {
            return Ok(());
        }

        match root.commit() {
            Ok(change_set) => {
                if let Some(cs) = change_set {
                    tracing::info!("saved root context at commit {}", cs.seq);
                }
                Ok(())
            }
            Err(e) => {
                self.config.on_fatal.handle("root save", &e);
                Err(e)
            }
        }
    }

    /// Discard the store and every context, then start over with an empty
    /// store. Uncommitted changes in any context are lost.
    pub async fn reset(&self) -> Result<(), ResetError> {
        let _resetting = self.resetting.lock().await;
        let name = &self.config.schema_name;

        // The root lock is never taken while the set lock is held: a caller
        // inside `with_root` may itself be waiting on the set lock.
        let root = self.root();
        if lock_context(&root).has_changes() {
            tracing::warn!("reset discards uncommitted changes in the root context");
        }
        drop(root);

        let (executors, path) = {
            let mut set = self.set.write().unwrap_or_else(PoisonError::into_inner);
            let path = set.store.path().to_path_buf();
            (set.shut_down(), path)
        };

        for join in executors {
            if let Err(e) = join.await {
                tracing::warn!("context executor ended abnormally during reset: {}", e);
            }
        }

        // A file that cannot be removed is handed back to the caller under
        // every failure policy.
        let removed = remove_store_files(&path).map_err(|source| {
            let err = ResetError::RemoveFile {
                path: path.clone(),
                source,
            };
            tracing::error!("store reset failed: {}", err);
            err
        })?;
        tracing::info!("removed {} store files for {}", removed.len(), path.display());

        let store = match self.bootstrapper.open_with(name, SeedPolicy::Skip) {
            Ok(store) => Arc::new(store),
            Err(e) => {
                self.config.on_fatal.handle("store reset", &e);
                return Err(e.into());
            }
        };

        let fresh = ContextSet::create(store, &self.runtime);
        *self.set.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!("reset store {} (generation {})", path.display(), generation);
        Ok(())
    }
}

impl Drop for LifecycleManager {
    fn drop(&mut self) {
        let set = self.set.get_mut().unwrap_or_else(PoisonError::into_inner);
        // Executors exit on their own once they see the shutdown.
        drop(set.shut_down());
    }
}

/// Lazily opens one shared `LifecycleManager`. The first caller pays for
/// bootstrap; concurrent first callers wait for the same initialization.
#[derive(Debug)]
pub struct LifecycleCell {
    config: CoordinatorConfig,
    cell: OnceCell<Arc<LifecycleManager>>,
}

impl LifecycleCell {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            cell: OnceCell::new(),
        }
    }

    /// The shared coordinator, opening it on first use.
    pub async fn current(&self) -> Result<Arc<LifecycleManager>, LifecycleError> {
        let manager = self
            .cell
            .get_or_try_init(|| async {
                LifecycleManager::open(self.config.clone()).map(Arc::new)
            })
            .await?;
        Ok(Arc::clone(manager))
    }

    /// The coordinator if it has already been opened.
    pub fn get(&self) -> Option<Arc<LifecycleManager>> {
        self.cell.get().cloned()
    }
}
