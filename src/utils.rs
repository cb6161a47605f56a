//! Miscellaneous utility structs and functions.

use futures::{
    future::{self, AbortHandle},
    task::{LocalSpawn, LocalSpawnExt as _},
    Future, FutureExt as _,
};

/// Wrapper around [`AbortHandle`] which aborts its task on [`Drop`].
#[derive(Debug)]
pub struct TaskHandle(AbortHandle);

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Spawns the provided `task` on the `spawner`, returning [`TaskHandle`]
/// aborting it.
///
/// Returns [`None`] if the `spawner` is shut down.
pub fn spawn_abortable<S, F>(spawner: &S, task: F) -> Option<TaskHandle>
where
    S: LocalSpawn + ?Sized,
    F: Future<Output = ()> + 'static,
{
    let (task, handle) = future::abortable(task);
    match spawner.spawn_local(task.map(drop)) {
        Ok(()) => Some(TaskHandle(handle)),
        Err(e) => {
            log::error!("Failed to spawn task: {}", e);
            None
        }
    }
}
