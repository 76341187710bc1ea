//! The seam between inbound dispatch and the task scheduler. The dispatch
//! loop hands each in-flight handler to a [`TaskSpawner`] so it never awaits
//! a handler itself.

use std::future::Future;
use std::pin::Pin;

use crate::error::{Error, Result};

pub type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: Task);
}

/// Submits tasks to a tokio runtime.
pub struct TokioSpawner {
    handle: tokio::runtime::Handle,
}

impl TokioSpawner {
    /// Captures the ambient runtime. Panics outside a runtime context, like
    /// `Handle::current` itself.
    pub fn new() -> TokioSpawner {
        TokioSpawner {
            handle: tokio::runtime::Handle::current(),
        }
    }

    pub fn from_handle(handle: tokio::runtime::Handle) -> TokioSpawner {
        TokioSpawner { handle }
    }
}

impl Default for TokioSpawner {
    fn default() -> Self {
        TokioSpawner::new()
    }
}

impl TaskSpawner for TokioSpawner {
    fn spawn(&self, task: Task) {
        self.handle.spawn(task);
    }
}

/// Runs each task to completion before returning, on a private
/// current-thread runtime. Deterministic, for synchronous servers and tests.
pub struct BlockingSpawner {
    runtime: tokio::runtime::Runtime,
}

impl BlockingSpawner {
    pub fn new() -> Result<BlockingSpawner> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(Error::Transport)?;
        Ok(BlockingSpawner { runtime })
    }
}

impl TaskSpawner for BlockingSpawner {
    fn spawn(&self, task: Task) {
        self.runtime.block_on(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn blocking_spawner_runs_to_completion() {
        let spawner = BlockingSpawner::new().unwrap();
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        spawner.spawn(Box::pin(async move {
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn tokio_spawner_submits_to_runtime() {
        let spawner = TokioSpawner::new();
        let (tx, rx) = tokio::sync::oneshot::channel();
        spawner.spawn(Box::pin(async move {
            let _ = tx.send(5u32);
        }));
        assert_eq!(rx.await.unwrap(), 5);
    }
}
