// ABOUTME: Routes every committed change-set to the executors of the contexts that must replay it.
// ABOUTME: Worker commits go to main, main commits go to worker, everything else goes to both.

use std::sync::Arc;

use trellis_core::{CommitNotification, ContextRole, Origin};
use trellis_store::CommitObserver;

use crate::executor::ContextHandle;

/// The contexts that replay a commit from `origin`.
pub fn replay_targets(origin: &Origin) -> &'static [ContextRole] {
    match origin {
        Origin::Worker => &[ContextRole::Main],
        Origin::Main => &[ContextRole::Worker],
        Origin::Root | Origin::External(_) => &[ContextRole::Main, ContextRole::Worker],
    }
}

/// Commit observer that posts replays onto the main and worker executors.
#[derive(Debug)]
pub struct ChangePropagator {
    main: ContextHandle,
    worker: ContextHandle,
}

impl ChangePropagator {
    pub fn new(main: ContextHandle, worker: ContextHandle) -> Self {
        Self { main, worker }
    }

    fn handle_for(&self, role: ContextRole) -> Option<&ContextHandle> {
        match role {
            ContextRole::Main => Some(&self.main),
            ContextRole::Worker => Some(&self.worker),
            ContextRole::Root => None,
        }
    }
}

impl CommitObserver for ChangePropagator {
    fn committed(&self, notification: &CommitNotification) {
        let change_set = &notification.change_set;
        if change_set.is_empty() {
            return;
        }

        for role in replay_targets(&change_set.origin) {
            let Some(target) = self.handle_for(*role) else {
                continue;
            };
            if let Err(e) = target.replay(Arc::clone(change_set)) {
                // Happens only while the coordinator is shutting down or resetting.
                tracing::warn!(
                    "could not post commit {} from {} to {}: {}",
                    change_set.seq,
                    change_set.origin,
                    role,
                    e
                );
            } else {
                tracing::trace!(
                    "posted commit {} from {} to {}",
                    change_set.seq,
                    change_set.origin,
                    role
                );
            }
        }
    }
}
