use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;

/// A spawned task tagged with the generation that armed it.
///
/// The task is aborted when cancelled or dropped. Whatever the task reports
/// back must still be compared against the owner's current generation: a task
/// that already finished cannot be recalled.
#[derive(Debug)]
pub(crate) struct Scheduled<G> {
    generation: G,
    handle: JoinHandle<()>,
}

impl<G: Copy> Scheduled<G> {
    /// Runs `fire` once after `delay`.
    pub(crate) fn after<F>(delay: Duration, generation: G, fire: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self::spawn(generation, async move {
            sleep(delay).await;
            fire();
        })
    }

    pub(crate) fn spawn<Fut>(generation: G, task: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            generation,
            handle: tokio::spawn(task),
        }
    }

    pub(crate) fn generation(&self) -> G {
        self.generation
    }

    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

impl<G> Drop for Scheduled<G> {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
