// ABOUTME: Executor task that owns one affinity-bound context and runs posted work in FIFO order.
// ABOUTME: Provides ContextHandle for performing work, draining the queue, and receiving replays.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use trellis_core::{ChangeSet, ContextRole};

use crate::context::{Context, ContextError};

type Job = Box<dyn FnOnce(&mut Context) + Send + 'static>;

enum Task {
    Run(Job),
    Replay(Arc<ChangeSet>),
    Shutdown,
}

/// Posts work onto a context's executor. Cheap to clone; every clone feeds
/// the same queue.
#[derive(Debug, Clone)]
pub struct ContextHandle {
    role: ContextRole,
    tx: mpsc::UnboundedSender<Task>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Run(_) => f.write_str("Run"),
            Task::Replay(cs) => write!(f, "Replay({})", cs.seq),
            Task::Shutdown => f.write_str("Shutdown"),
        }
    }
}

impl ContextHandle {
    pub fn role(&self) -> ContextRole {
        self.role
    }

    /// Whether the executor has stopped accepting work.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Run `f` against the context on its executor and await the result.
    pub async fn perform<F, R>(&self, f: F) -> Result<R, ContextError>
    where
        F: FnOnce(&mut Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |ctx| {
            // The caller may have stopped waiting.
            let _ = reply_tx.send(f(ctx));
        });
        self.post(Task::Run(job))?;
        reply_rx
            .await
            .map_err(|_| ContextError::ExecutorClosed(self.role))
    }

    /// Queue `f` without waiting for it to run.
    pub fn perform_detached<F>(&self, f: F) -> Result<(), ContextError>
    where
        F: FnOnce(&mut Context) + Send + 'static,
    {
        self.post(Task::Run(Box::new(f)))
    }

    /// Wait until every task queued before this call has run, replays included.
    pub async fn drain(&self) -> Result<(), ContextError> {
        self.perform(|_| ()).await
    }

    pub(crate) fn replay(&self, change_set: Arc<ChangeSet>) -> Result<(), ContextError> {
        self.post(Task::Replay(change_set))
    }

    /// Ask the executor to stop after the work already queued. Later calls
    /// fail with `ExecutorClosed`.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(Task::Shutdown);
    }

    fn post(&self, task: Task) -> Result<(), ContextError> {
        self.tx
            .send(task)
            .map_err(|_| ContextError::ExecutorClosed(self.role))
    }
}

/// Move `context` onto a new executor task on `runtime`.
pub fn spawn(context: Context, runtime: &Handle) -> (ContextHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ContextHandle {
        role: context.role(),
        tx,
    };
    let executor = Executor { context, rx };
    let join = runtime.spawn(executor.run());
    (handle, join)
}

struct Executor {
    context: Context,
    rx: mpsc::UnboundedReceiver<Task>,
}

impl Executor {
    async fn run(mut self) {
        let role = self.context.role();
        tracing::debug!("{} executor started", role);

        while let Some(task) = self.rx.recv().await {
            match task {
                Task::Run(job) => job(&mut self.context),
                Task::Replay(change_set) => {
                    self.context.apply_replay(&change_set);
                }
                Task::Shutdown => break,
            }
        }

        // Anything still queued is dropped; waiting callers see ExecutorClosed.
        self.rx.close();
        if self.context.has_changes() {
            tracing::debug!("{} executor stopped with uncommitted changes", role);
        }
        tracing::debug!("{} executor stopped", role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestStore;
    use trellis_core::{ObjectKey, Origin, Record};

    #[tokio::test]
    async fn perform_runs_on_the_owned_context() {
        let fx = TestStore::new();
        let ctx = Context::new(ContextRole::Main, fx.open());
        let (handle, _join) = spawn(ctx, &Handle::current());

        handle
            .perform(|ctx| {
                ctx.insert(Record::new(ObjectKey::new("Item", 1)).with("name", "a"))
            })
            .await
            .unwrap()
            .unwrap();

        let dirty = handle.perform(|ctx| ctx.has_changes()).await.unwrap();
        assert!(dirty);
        assert_eq!(handle.role(), ContextRole::Main);
    }

    #[tokio::test]
    async fn tasks_run_in_posting_order() {
        let fx = TestStore::new();
        let (handle, _join) = spawn(Context::new(ContextRole::Worker, fx.open()), &Handle::current());

        let (tx, mut rx) = mpsc::unbounded_channel();
        for i in 0..20 {
            let tx = tx.clone();
            handle
                .perform_detached(move |_| {
                    let _ = tx.send(i);
                })
                .unwrap();
        }
        handle.drain().await.unwrap();
        drop(tx);

        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        assert_eq!(seen, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn replays_are_applied_before_later_work() {
        let fx = TestStore::new();
        let (handle, _join) = spawn(Context::new(ContextRole::Main, fx.open()), &Handle::current());

        let mut cs = ChangeSet::new(1, Origin::Worker);
        cs.inserted
            .push(Record::new(ObjectKey::new("Item", 1)).with("name", "a"));
        handle.replay(Arc::new(cs)).unwrap();

        let seen = handle
            .perform(|ctx| ctx.get(&ObjectKey::new("Item", 1)))
            .await
            .unwrap();
        assert!(seen.is_some());
    }

    #[tokio::test]
    async fn shutdown_rejects_further_work() {
        let fx = TestStore::new();
        let (handle, join) = spawn(Context::new(ContextRole::Worker, fx.open()), &Handle::current());

        handle.shutdown();
        join.await.unwrap();

        assert!(handle.is_closed());
        let err = handle.drain().await.unwrap_err();
        assert!(matches!(err, ContextError::ExecutorClosed(ContextRole::Worker)));
        assert!(handle.perform_detached(|_| ()).is_err());
    }
}
