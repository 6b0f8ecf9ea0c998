//! Asynchronous utilities for use with Tokio.
//!
//! The worker pool and the dispatcher are built out of boxed futures and
//! streams. The type aliases and small helpers that make that bearable live
//! here.

use std::pin::Pin;

use futures::Stream;
use tokio::task::JoinHandle;

use crate::prelude::*;

pub mod io;

/// A type alias for a boxed future. This is used to make it easier to work with
/// with complex futures.
pub type BoxedFuture<Output> = Pin<Box<dyn Future<Output = Output> + Send>>;

/// A type alias for a boxed stream. This is used to make it easier to work
/// streams that return complex types.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// A handle for one or more background workers. This can be awaited
/// to wait for all workers to complete normally.
pub struct JoinWorker {
    /// The task handle.
    future: BoxedFuture<Result<()>>,
}

impl JoinWorker {
    /// Create a new worker handle from a [`JoinHandle`].
    pub fn from_handle(handle: JoinHandle<Result<()>>) -> Self {
        Self {
            future: Box::pin(async move { handle.await.context("could not join task")? }),
        }
    }

    /// Wait for the worker to complete.
    pub async fn join(self) -> Result<()> {
        self.future.await
    }
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        // Blocking tasks are never aborted, so this only happens if the
        // runtime is shutting down underneath us.
        Err(err) => panic!("blocking task failed: {err}"),
    }
}

/// Turn a panic payload into something we can put in a report.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_worker_reports_task_errors() {
        let handle = tokio::spawn(async { Err(anyhow!("worker failed")) });
        let err = JoinWorker::from_handle(handle).join().await.unwrap_err();
        assert!(err.to_string().contains("worker failed"));
    }

    #[tokio::test]
    async fn blocking_helper_returns_values() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn panic_messages_are_extracted() {
        let err = tokio::spawn(async { panic!("boom {}", 1) })
            .await
            .unwrap_err();
        assert_eq!(panic_message(err.into_panic().as_ref()), "boom 1");
    }
}
