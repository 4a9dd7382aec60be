// ABOUTME: Context layer for trellis: root/main/worker contexts, their executors, and change propagation.
// ABOUTME: LifecycleManager ties them to one store and handles root saves and full resets.

pub mod config;
pub mod context;
pub mod executor;
pub mod lifecycle;
pub mod propagator;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, CoordinatorConfig, FailurePolicy};
pub use context::{CommitError, Context, ContextError};
pub use executor::ContextHandle;
pub use lifecycle::{ContextSet, LifecycleCell, LifecycleError, LifecycleManager, ResetError};
pub use propagator::{ChangePropagator, replay_targets};
