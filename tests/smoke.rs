// ABOUTME: End-to-end smoke tests for the trellis coordinator lifecycle.
// ABOUTME: Covers propagation between contexts, root saves, resets, reopen, and concurrent commits.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use trellis_context::{
    ContextError, ContextHandle, CoordinatorConfig, FailurePolicy, LifecycleManager,
};
use trellis_core::{ObjectKey, Record};

const SCHEMA: &str = r#"
name: DataModel
version: 1
entities:
  - name: Item
    attributes:
      - { name: name, type: string }
      - { name: count, type: integer, default: 0 }
"#;

/// Helper to create a temp data dir and resources dir holding the schema.
fn setup() -> (TempDir, CoordinatorConfig) {
    let dir = TempDir::new().unwrap();
    let resources = dir.path().join("resources");
    fs::create_dir_all(&resources).unwrap();
    fs::write(resources.join("DataModel.schema.yaml"), SCHEMA).unwrap();

    let config = CoordinatorConfig::new(dir.path().join("data"), resources, "DataModel")
        .with_failure_policy(FailurePolicy::Report);
    (dir, config)
}

fn item(id: i64, name: &str) -> Record {
    Record::new(ObjectKey::new("Item", id)).with("name", name)
}

/// Insert and commit one object through an executor. Returns the commit sequence.
async fn commit_insert(handle: &ContextHandle, record: Record) -> u64 {
    handle
        .perform(move |ctx| {
            ctx.insert(record)?;
            let change_set = ctx.commit()?;
            Ok::<_, ContextError>(change_set.map(|cs| cs.seq))
        })
        .await
        .unwrap()
        .unwrap()
        .expect("insert produced a commit")
}

async fn seen_by(handle: &ContextHandle, key: &ObjectKey) -> Option<Record> {
    let key = key.clone();
    handle.perform(move |ctx| ctx.get(&key)).await.unwrap()
}

async fn replays_received(handle: &ContextHandle) -> u64 {
    handle.perform(|ctx| ctx.replays_received()).await.unwrap()
}

#[tokio::test]
async fn worker_insert_reaches_main_but_not_root() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();
    let key = ObjectKey::new("Item", 1);

    commit_insert(&manager.worker(), item(1, "a")).await;

    let main = manager.main();
    main.drain().await.unwrap();
    let seen = seen_by(&main, &key).await.expect("main should see the worker insert");
    assert_eq!(seen.get("name"), Some(&json!("a")));
    assert_eq!(seen.get("count"), Some(&json!(0)), "schema default applied");

    assert!(manager.with_root(|ctx| ctx.get(&key)).is_none());
}

#[tokio::test]
async fn reset_discards_uncommitted_main_edit() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();
    let key = ObjectKey::new("Item", 1);
    let saved = ObjectKey::new("Item", 2);

    manager.with_root(|ctx| ctx.insert(item(2, "saved"))).unwrap();
    manager.save_root().unwrap();
    manager
        .main()
        .perform(|ctx| ctx.insert(item(1, "draft")))
        .await
        .unwrap()
        .unwrap();

    manager.reset().await.unwrap();

    let main = manager.main();
    assert!(seen_by(&main, &key).await.is_none());
    assert!(!main.perform(|ctx| ctx.has_changes()).await.unwrap());

    // Prior data is gone from every context, in memory and in the store.
    assert!(manager.with_root(|ctx| ctx.fetch(&saved)).unwrap().is_none());
    for handle in [manager.main(), manager.worker()] {
        let k = saved.clone();
        let fetched = handle.perform(move |ctx| ctx.fetch(&k)).await.unwrap().unwrap();
        assert!(fetched.is_none(), "{} still sees old data", handle.role());
    }

    commit_insert(&main, item(1, "after-reset")).await;
    assert_eq!(manager.store().count("Item").unwrap(), 1);
    assert_eq!(manager.generation(), 1);
}

#[tokio::test]
async fn reopen_keeps_committed_data() {
    let (_dir, config) = setup();

    let manager = LifecycleManager::open(config.clone()).unwrap();
    manager.with_root(|ctx| ctx.insert(item(1, "kept"))).unwrap();
    manager.save_root().unwrap();
    let path: PathBuf = manager.store().path().to_path_buf();
    drop(manager);

    let manager = LifecycleManager::open(config).unwrap();
    assert_eq!(manager.store().path(), path.as_path());
    assert_eq!(manager.store().last_seq().unwrap(), 1);

    let fetched = manager
        .with_root(|ctx| ctx.fetch(&ObjectKey::new("Item", 1)))
        .unwrap()
        .unwrap();
    assert_eq!(fetched.get("name"), Some(&json!("kept")));
}

#[tokio::test]
async fn contexts_never_replay_their_own_commits() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();
    let (main, worker) = (manager.main(), manager.worker());

    commit_insert(&worker, item(1, "w")).await;
    commit_insert(&main, item(2, "m")).await;
    main.drain().await.unwrap();
    worker.drain().await.unwrap();

    assert_eq!(replays_received(&worker).await, 1, "only main's commit");
    assert_eq!(replays_received(&main).await, 1, "only worker's commit");
}

#[tokio::test]
async fn root_commits_reach_main_and_worker() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();
    let key = ObjectKey::new("Item", 5);

    manager.with_root(|ctx| ctx.insert(item(5, "from-root"))).unwrap();
    manager.save_root().unwrap();

    for handle in [manager.main(), manager.worker()] {
        handle.drain().await.unwrap();
        assert!(seen_by(&handle, &key).await.is_some(), "{} missed it", handle.role());
        assert_eq!(replays_received(&handle).await, 1);
    }
}

#[tokio::test]
async fn clean_root_save_does_not_commit() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();

    manager.save_root().unwrap();
    manager.save_root().unwrap();
    assert_eq!(manager.store().last_seq().unwrap(), 0);
    assert_eq!(replays_received(&manager.main()).await, 0);
}

#[tokio::test]
async fn incoming_properties_win_over_local_edits() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();
    let (main, worker) = (manager.main(), manager.worker());
    let key = ObjectKey::new("Item", 1);

    commit_insert(&worker, item(1, "first")).await;
    main.drain().await.unwrap();

    // Main edits both attributes locally without committing.
    let k = key.clone();
    main.perform(move |ctx| {
        ctx.set(&k, "name", "main-name")?;
        ctx.set(&k, "count", 9)
    })
    .await
    .unwrap()
    .unwrap();

    // Worker changes only the name.
    let k = key.clone();
    worker
        .perform(move |ctx| {
            ctx.set(&k, "name", "worker-name")?;
            ctx.commit()?;
            Ok::<_, ContextError>(())
        })
        .await
        .unwrap()
        .unwrap();
    main.drain().await.unwrap();

    let seen = seen_by(&main, &key).await.unwrap();
    assert_eq!(seen.get("name"), Some(&json!("worker-name")));
    assert_eq!(seen.get("count"), Some(&json!(9)), "untouched local edit kept");
    assert!(main.perform(|ctx| ctx.has_changes()).await.unwrap());
}

#[tokio::test]
async fn worker_delete_drops_main_copy() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();
    let (main, worker) = (manager.main(), manager.worker());
    let key = ObjectKey::new("Item", 1);

    commit_insert(&worker, item(1, "doomed")).await;
    let k = key.clone();
    worker
        .perform(move |ctx| {
            ctx.delete(&k)?;
            ctx.commit()?;
            Ok::<_, ContextError>(())
        })
        .await
        .unwrap()
        .unwrap();

    main.drain().await.unwrap();
    assert!(seen_by(&main, &key).await.is_none());
    assert_eq!(manager.store().count("Item").unwrap(), 0);
}

#[tokio::test]
async fn root_overwrite_keeps_unrelated_local_edits() {
    let (_dir, config) = setup();
    let manager = LifecycleManager::open(config).unwrap();
    let main = manager.main();
    let key = ObjectKey::new("Item", 1);

    manager.with_root(|ctx| ctx.insert(item(1, "a"))).unwrap();
    manager.save_root().unwrap();
    main.drain().await.unwrap();

    // Main edits count locally and leaves it uncommitted.
    let k = key.clone();
    main.perform(move |ctx| ctx.set(&k, "count", 7))
        .await
        .unwrap()
        .unwrap();

    // Root rewrites only the name, under overwrite-wins.
    manager
        .with_root(|ctx| {
            ctx.fetch(&key)?;
            ctx.set(&key, "name", "b")
        })
        .unwrap();
    manager.save_root().unwrap();
    main.drain().await.unwrap();

    let seen = seen_by(&main, &key).await.unwrap();
    assert_eq!(seen.get("name"), Some(&json!("b")));
    assert_eq!(seen.get("count"), Some(&json!(7)), "local edit survived the root save");
    assert!(main.perform(|ctx| ctx.has_changes()).await.unwrap());

    let stored = manager.store().fetch(&key).unwrap().unwrap();
    assert_eq!(stored.get("count"), Some(&json!(0)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_commits_converge() {
    let (_dir, config) = setup();
    let manager = Arc::new(LifecycleManager::open(config).unwrap());
    const PER_CONTEXT: i64 = 25;

    let mut main_tasks = Vec::new();
    let mut worker_tasks = Vec::new();
    let mut root_tasks = Vec::new();
    for i in 0..PER_CONTEXT {
        let main = manager.main();
        let worker = manager.worker();
        main_tasks.push(tokio::spawn(async move {
            commit_insert(&main, item(1000 + i, "m")).await
        }));
        worker_tasks.push(tokio::spawn(async move {
            commit_insert(&worker, item(2000 + i, "w")).await
        }));
        let root = Arc::clone(&manager);
        root_tasks.push(tokio::task::spawn_blocking(move || {
            root.with_root(|ctx| {
                ctx.insert(item(3000 + i, "r"))?;
                let change_set = ctx.commit()?;
                Ok::<_, ContextError>(change_set.map(|cs| cs.seq))
            })
            .unwrap()
            .expect("root insert produced a commit")
        }));
    }

    async fn seqs(tasks: Vec<tokio::task::JoinHandle<u64>>) -> Vec<u64> {
        futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect()
    }
    let main_seqs = seqs(main_tasks).await;
    let worker_seqs = seqs(worker_tasks).await;
    let root_seqs = seqs(root_tasks).await;

    let total = (PER_CONTEXT * 3) as usize;
    assert_eq!(manager.store().count("Item").unwrap(), total as u64);
    assert_eq!(manager.store().last_seq().unwrap(), total as u64);

    // Every context sees the objects of the other two, and each commit
    // routed to it arrives exactly once.
    let expected = [
        (manager.main(), [&worker_seqs, &root_seqs]),
        (manager.worker(), [&main_seqs, &root_seqs]),
    ];
    for (handle, routed) in expected {
        handle.drain().await.unwrap();
        let objects = handle.perform(|ctx| ctx.objects("Item")).await.unwrap();
        assert_eq!(objects.len(), total, "{} did not converge", handle.role());

        let routed_count = routed.iter().map(|s| s.len() as u64).sum::<u64>();
        assert_eq!(
            replays_received(&handle).await,
            routed_count,
            "{} received the wrong number of replays",
            handle.role()
        );

        let highest = routed.iter().flat_map(|s| s.iter()).copied().max().unwrap();
        let through = handle.perform(|ctx| ctx.replayed_through()).await.unwrap();
        assert_eq!(through, highest, "{} missed a replay", handle.role());
    }
}
