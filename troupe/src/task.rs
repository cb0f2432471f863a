//! Droppable task handles for subscription ownership.
//!
//! Every subscription the engine makes (removal watchers, pluck forwarders,
//! merge feeds, reconciler drivers) runs as a task owned by a [`TaskHandle`].
//! Dropping the handle aborts the task, so releasing a memo entry or a
//! collection handle releases its subscriptions with it.

use std::future::Future;

use tokio::task::JoinHandle;

/// Owns a spawned task and aborts it on drop.
#[derive(Debug)]
pub struct TaskHandle {
    handle: JoinHandle<()>,
}

/// Spawn a task tied to the returned [`TaskHandle`].
///
/// Requires an ambient tokio runtime, like every async entry point in this
/// crate.
pub fn spawn<F>(future: F) -> TaskHandle
where
    F: Future<Output = ()> + Send + 'static,
{
    TaskHandle {
        handle: tokio::spawn(future),
    }
}

/// Spawn a task that outlives its caller.
///
/// Used for teardown work that must finish even after the spawning handle is
/// gone, e.g. the reconciler's post-destroy grace period.
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future);
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
