// ABOUTME: SQLite-backed store engine: one handle per file, atomic commits, commit notifications.
// ABOUTME: Commits validate against the schema, apply in one transaction, then notify observers in order.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, params};
use tokio::sync::broadcast;
use trellis_core::{
    Attributes, ChangeSet, CommitNotification, ConflictPolicy, ObjectKey, ObjectPatch, Origin,
    PendingChanges, Record, SchemaDescriptor,
};

use crate::error::{OpenError, StoreError, StoreOpenError};
use crate::migration::{StoreOptions, apply_plan, plan_migration};

/// Companion files SQLite may create next to the main store file.
const COMPANION_SUFFIXES: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Paths currently held open by a handle in this process.
static OPEN_STORES: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Default::default);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registration of a store path as open; released on drop.
#[derive(Debug)]
struct PathClaim(PathBuf);

impl PathClaim {
    fn acquire(path: &Path) -> Result<Self, StoreOpenError> {
        let canonical = canonical_store_path(path)?;
        let mut open = lock(&OPEN_STORES);
        if !open.insert(canonical.clone()) {
            return Err(StoreOpenError::AlreadyOpen(canonical));
        }
        Ok(Self(canonical))
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        lock(&OPEN_STORES).remove(&self.0);
    }
}

/// Canonicalize through the parent directory, since the file itself may not exist yet.
fn canonical_store_path(path: &Path) -> Result<PathBuf, std::io::Error> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("store path has no file name: {}", path.display()),
        )
    })?;
    Ok(fs::canonicalize(parent)?.join(file_name))
}

/// Receives every commit on a store, in commit-sequence order.
///
/// Called while the store's commit lock is held: implementations must return
/// promptly and must not call back into the store.
pub trait CommitObserver: Send + Sync {
    fn committed(&self, notification: &CommitNotification);
}

struct Inner {
    conn: Connection,
    last_seq: u64,
    _claim: PathClaim,
}

/// An open connection to one store file. Shared by every context.
pub struct StoreHandle {
    path: PathBuf,
    schema: SchemaDescriptor,
    inner: Mutex<Option<Inner>>,
    observers: Mutex<Vec<Arc<dyn CommitObserver>>>,
    events: broadcast::Sender<CommitNotification>,
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("path", &self.path)
            .field("schema", &self.schema.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StoreHandle {
    /// Open the store at `path`, creating it if absent, and migrate it to
    /// `schema` when the stored descriptor differs.
    pub fn open_or_create(
        path: &Path,
        schema: SchemaDescriptor,
        options: StoreOptions,
    ) -> Result<Self, OpenError> {
        schema.validate().map_err(StoreOpenError::from)?;

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(StoreOpenError::from)?;
        }

        let claim = PathClaim::acquire(path)?;
        let mut conn = Connection::open(path).map_err(|e| open_failure(path, e))?;
        init_tables(&conn).map_err(|e| open_failure(path, e))?;

        match read_meta(&conn, "schema").map_err(StoreOpenError::from)? {
            None => {
                let json = serde_json::to_string(&schema).map_err(StoreOpenError::from)?;
                write_meta(&conn, "schema", &json).map_err(StoreOpenError::from)?;
                tracing::info!(
                    "created store {} for schema {} v{}",
                    path.display(),
                    schema.name,
                    schema.version
                );
            }
            Some(json) => {
                let stored: SchemaDescriptor =
                    serde_json::from_str(&json).map_err(StoreOpenError::from)?;
                if let Some(plan) = plan_migration(&stored, &schema, options)? {
                    let tx = conn.transaction().map_err(StoreOpenError::from)?;
                    let rewritten = apply_plan(&tx, &plan)?;
                    let json = serde_json::to_string(&schema).map_err(StoreOpenError::from)?;
                    write_meta(&tx, "schema", &json).map_err(StoreOpenError::from)?;
                    tx.commit().map_err(StoreOpenError::from)?;
                    tracing::info!(
                        "migrated store {} from v{} to v{} ({} steps, {} rows rewritten)",
                        path.display(),
                        plan.from_version,
                        plan.to_version,
                        plan.steps.len(),
                        rewritten
                    );
                }
            }
        }

        let last_seq = match read_meta(&conn, "last_commit_seq").map_err(StoreOpenError::from)? {
            None => 0,
            Some(value) => value.parse::<u64>().map_err(|_| StoreOpenError::CorruptMeta {
                key: "last_commit_seq".to_string(),
                value,
            })?,
        };

        let (events, _) = broadcast::channel(256);
        Ok(Self {
            path: path.to_path_buf(),
            schema,
            inner: Mutex::new(Some(Inner {
                conn,
                last_seq,
                _claim: claim,
            })),
            observers: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema(&self) -> &SchemaDescriptor {
        &self.schema
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner).is_none()
    }

    /// Sequence number of the most recent commit (0 for a fresh store).
    pub fn last_seq(&self) -> Result<u64, StoreError> {
        let guard = lock(&self.inner);
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        Ok(inner.last_seq)
    }

    /// Register an observer that sees every subsequent commit.
    pub fn register_observer(&self, observer: Arc<dyn CommitObserver>) {
        lock(&self.observers).push(observer);
    }

    /// Subscribe to the commit broadcast stream. Slow receivers may lag;
    /// use an observer where every commit must be seen.
    pub fn subscribe(&self) -> broadcast::Receiver<CommitNotification> {
        self.events.subscribe()
    }

    pub fn fetch(&self, key: &ObjectKey) -> Result<Option<Record>, StoreError> {
        let guard = lock(&self.inner);
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        load_row(&inner.conn, key)
    }

    /// All objects of one entity, ordered by id.
    pub fn fetch_all(&self, entity: &str) -> Result<Vec<Record>, StoreError> {
        let guard = lock(&self.inner);
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;

        let mut stmt = inner
            .conn
            .prepare("SELECT id, attributes FROM objects WHERE entity = ?1 ORDER BY id ASC")?;
        let rows = stmt.query_map(params![entity], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, json) = row?;
            records.push(Record {
                key: ObjectKey::new(entity, id),
                attributes: serde_json::from_str(&json)?,
            });
        }
        Ok(records)
    }

    pub fn count(&self, entity: &str) -> Result<u64, StoreError> {
        let guard = lock(&self.inner);
        let inner = guard.as_ref().ok_or(StoreError::Closed)?;
        let count: i64 = inner.conn.query_row(
            "SELECT COUNT(*) FROM objects WHERE entity = ?1",
            params![entity],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Atomically persist a set of changes and notify observers.
    ///
    /// Deletes are applied first, then inserts, then updates. The resulting
    /// change-set lists only what actually changed in the store.
    pub fn commit(
        &self,
        origin: Origin,
        changes: &PendingChanges,
        policy: ConflictPolicy,
    ) -> Result<CommitNotification, StoreError> {
        let mut guard = lock(&self.inner);
        let inner = guard.as_mut().ok_or(StoreError::Closed)?;

        let seq = inner.last_seq + 1;
        let mut change_set = ChangeSet::new(seq, origin);
        let now = Utc::now().to_rfc3339();

        let tx = inner.conn.transaction()?;

        for key in &changes.deletes {
            let removed = tx.execute(
                "DELETE FROM objects WHERE entity = ?1 AND id = ?2",
                params![key.entity, key.id],
            )?;
            if removed > 0 {
                change_set.deleted.push(key.clone());
            }
        }

        for record in &changes.inserts {
            let prepared = self.schema.prepare_insert(record)?;
            if policy == ConflictPolicy::TrumpIncomingProperty
                && load_row(&tx, &prepared.key)?.is_some()
            {
                return Err(StoreError::DuplicateObject(prepared.key));
            }
            write_row(&tx, &prepared, &now)?;
            change_set.inserted.push(prepared);
        }

        for update in &changes.updates {
            self.schema.check_update(&update.key, &update.changed)?;
            let existing = load_row(&tx, &update.key)?;

            match (existing, policy, &update.full) {
                (Some(stored), ConflictPolicy::OverwriteWins, Some(full)) => {
                    let prepared = self.schema.prepare_insert(full)?;
                    write_row(&tx, &prepared, &now)?;
                    // The patch still names the key when nothing differs, so
                    // the committing context keeps the object registered.
                    change_set.updated.push(ObjectPatch {
                        changed: changed_attributes(&stored.attributes, &prepared.attributes),
                        key: prepared.key,
                    });
                }
                (Some(mut stored), _, _) => {
                    stored.apply(&update.changed);
                    write_row(&tx, &stored, &now)?;
                    change_set.updated.push(ObjectPatch {
                        key: update.key.clone(),
                        changed: update.changed.clone(),
                    });
                }
                (None, ConflictPolicy::OverwriteWins, Some(full)) => {
                    let prepared = self.schema.prepare_insert(full)?;
                    write_row(&tx, &prepared, &now)?;
                    tracing::warn!("re-inserted {} deleted in store (overwrite-wins)", update.key);
                    change_set.inserted.push(prepared);
                }
                (None, _, _) => {
                    tracing::warn!(
                        "dropping update to {}: object was deleted in store",
                        update.key
                    );
                }
            }
        }

        write_meta(&tx, "last_commit_seq", &seq.to_string())?;
        tx.commit()?;
        inner.last_seq = seq;

        tracing::debug!(
            "commit {} from {}: {} inserted, {} updated, {} deleted",
            seq,
            change_set.origin,
            change_set.inserted.len(),
            change_set.updated.len(),
            change_set.deleted.len()
        );

        let notification = CommitNotification::new(change_set);
        // Still under the commit lock, so observers see commits in sequence order.
        for observer in lock(&self.observers).iter() {
            observer.committed(&notification);
        }
        // No active subscribers is fine
        let _ = self.events.send(notification.clone());

        Ok(notification)
    }

    /// Close the connection and release the path. Idempotent.
    pub fn close(&self) {
        if lock(&self.inner).take().is_some() {
            lock(&self.observers).clear();
            tracing::info!("closed store {}", self.path.display());
        }
    }

    /// Every physical file that may back this store.
    pub fn store_files(&self) -> Vec<PathBuf> {
        store_files_for(&self.path)
    }
}

/// The main store file plus its SQLite companion files.
/// Attributes whose value differs between `before` and `after`. Attributes
/// dropped by `after` appear as null.
fn changed_attributes(before: &Attributes, after: &Attributes) -> Attributes {
    let mut changed: Attributes = after
        .iter()
        .filter(|(name, value)| before.get(*name) != Some(*value))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    for name in before.keys() {
        if !after.contains_key(name) {
            changed.insert(name.clone(), serde_json::Value::Null);
        }
    }
    changed
}

pub fn store_files_for(path: &Path) -> Vec<PathBuf> {
    let mut files = vec![path.to_path_buf()];
    for suffix in COMPANION_SUFFIXES {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        files.push(PathBuf::from(name));
    }
    files
}

/// Remove every existing backing file of the store at `path`.
/// Returns the files that were removed.
pub fn remove_store_files(path: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut removed = Vec::new();
    for file in store_files_for(path) {
        match fs::remove_file(&file) {
            Ok(()) => removed.push(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

fn open_failure(path: &Path, source: rusqlite::Error) -> StoreOpenError {
    match source.sqlite_error_code() {
        Some(ErrorCode::NotADatabase) | Some(ErrorCode::DatabaseCorrupt) => {
            StoreOpenError::Corrupt {
                path: path.to_path_buf(),
                source,
            }
        }
        _ => StoreOpenError::Sqlite(source),
    }
}

fn init_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS objects (
            entity TEXT NOT NULL,
            id INTEGER NOT NULL,
            attributes TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (entity, id)
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>, rusqlite::Error> {
    conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| {
        row.get(0)
    })
    .optional()
}

fn write_meta(conn: &Connection, key: &str, value: &str) -> Result<(), rusqlite::Error> {
    conn.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn load_row(conn: &Connection, key: &ObjectKey) -> Result<Option<Record>, StoreError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT attributes FROM objects WHERE entity = ?1 AND id = ?2",
            params![key.entity, key.id],
            |row| row.get(0),
        )
        .optional()?;

    match json {
        Some(json) => {
            let attributes: Attributes = serde_json::from_str(&json)?;
            Ok(Some(Record {
                key: key.clone(),
                attributes,
            }))
        }
        None => Ok(None),
    }
}

fn write_row(tx: &Transaction<'_>, record: &Record, now: &str) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO objects (entity, id, attributes, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(entity, id) DO UPDATE SET
            attributes = excluded.attributes,
            updated_at = excluded.updated_at",
        params![
            record.key.entity,
            record.key.id,
            serde_json::to_string(&record.attributes)?,
            now,
        ],
    )?;
    Ok(())
}
