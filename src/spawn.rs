//! Loaders, task spawning, and dispatch handles.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};

use crate::CacheError;

/// An asynchronous producer of values for a cache entry.
///
/// Implemented for every `Fn(P) -> impl Future<Output = anyhow::Result<V>>`
/// closure, so most callers never name this trait.
#[async_trait]
pub trait Loader<P, V>: Send + Sync + 'static {
    /// Load the value for `params`.
    async fn load(&self, params: P) -> anyhow::Result<V>;
}

#[async_trait]
impl<P, V, F, Fut> Loader<P, V> for F
where
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    P: Send + 'static,
    V: Send + 'static,
{
    async fn load(&self, params: P) -> anyhow::Result<V> {
        (self)(params).await
    }
}

/// Adapts a loader that always yields a value into one with an optional result.
pub(crate) struct AlwaysSome<P, V>(pub(crate) Arc<dyn Loader<P, V>>);

#[async_trait]
impl<P, V> Loader<P, Option<V>> for AlwaysSome<P, V>
where
    P: Send + 'static,
    V: Send + 'static,
{
    async fn load(&self, params: P) -> anyhow::Result<Option<V>> {
        self.0.load(params).await.map(Some)
    }
}

/// Executor seam used to run loaders in the background.
pub trait Spawn: Send + Sync + 'static {
    /// Run `task` to completion in the background.
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Spawns tasks on the ambient tokio runtime.
///
/// Dispatching outside a tokio runtime panics, as `tokio::spawn` does.
#[cfg(feature = "tokio-spawner")]
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

#[cfg(feature = "tokio-spawner")]
impl Spawn for TokioSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

/// Runs each task to completion on its own thread.
///
/// Useful outside an async runtime; loaders must not rely on a reactor.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadSpawner;

impl Spawn for ThreadSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        std::thread::spawn(move || futures::executor::block_on(task));
    }
}

/// Outcome of one attempt, awaited by every handle that joined it.
pub(crate) type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

/// Handle to one dispatched load.
///
/// Resolves to the loader's own outcome once it finishes, whether or not the
/// cache accepted it. Dropping the handle does not cancel the load.
#[must_use = "a dispatch runs in the background; await it to observe its outcome"]
pub struct Dispatch<T> {
    key: String,
    generation: u64,
    outcome: BoxFuture<'static, Result<T, CacheError>>,
}

impl<T: Send + 'static> Dispatch<T> {
    pub(crate) fn channel(
        key: String,
        generation: u64,
    ) -> (Self, oneshot::Sender<Result<T, CacheError>>) {
        let (tx, rx) = oneshot::channel();
        let outcome = rx.map(|received| match received {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => Err(CacheError::Dropped),
        });
        (
            Self {
                key,
                generation,
                outcome: Box::pin(outcome),
            },
            tx,
        )
    }

    /// Transform a successful outcome.
    pub(crate) fn and_then<U: Send + 'static>(
        self,
        f: impl FnOnce(T) -> Result<U, CacheError> + Send + 'static,
    ) -> Dispatch<U> {
        Dispatch {
            key: self.key,
            generation: self.generation,
            outcome: Box::pin(self.outcome.map(|outcome| outcome.and_then(f))),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Dispatch<T> {
    /// Split off an outcome that later handles can join.
    pub(crate) fn shared(self) -> (Self, SharedOutcome<T>) {
        let shared = self.outcome.shared();
        (Self::joining(self.key, self.generation, shared.clone()), shared)
    }

    /// A handle on an attempt started by another dispatch.
    pub(crate) fn joining(key: String, generation: u64, outcome: SharedOutcome<T>) -> Self {
        Self {
            key,
            generation,
            outcome: Box::pin(outcome),
        }
    }
}

impl<T> Dispatch<T> {
    /// Key of the entry this load writes to.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Generation assigned to this attempt.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T> Future for Dispatch<T> {
    type Output = Result<T, CacheError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.outcome.as_mut().poll(cx)
    }
}

impl<T> std::fmt::Debug for Dispatch<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch")
            .field("key", &self.key)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_closure_is_loader() {
        let loader = |n: u32| async move { anyhow::Ok(n * 2) };
        assert_eq!(loader.load(21).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_always_some_wraps_value() {
        let inner: Arc<dyn Loader<String, usize>> =
            Arc::new(|s: String| async move { anyhow::Ok(s.len()) });
        let loader = AlwaysSome(inner);
        assert_eq!(loader.load("abc".to_string()).await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_dispatch_reports_dropped_sender() {
        let (dispatch, tx) = Dispatch::<u32>::channel("k".into(), 1);
        drop(tx);
        assert_eq!(dispatch.await, Err(CacheError::Dropped));
    }

    #[tokio::test]
    async fn test_dispatch_and_then() {
        let (dispatch, tx) = Dispatch::<Option<u32>>::channel("k".into(), 1);
        let mapped = dispatch.and_then(|v| v.ok_or(CacheError::Cancelled));
        tx.send(Ok(None)).unwrap();
        assert_eq!(mapped.await, Err(CacheError::Cancelled));
    }

    #[tokio::test]
    async fn test_joined_handles_share_outcome() {
        let (dispatch, tx) = Dispatch::<u32>::channel("k".into(), 2);
        let (first, shared) = dispatch.shared();
        let second = Dispatch::joining("k".into(), 2, shared);
        tx.send(Ok(5)).unwrap();
        assert_eq!(first.await, Ok(5));
        assert_eq!(second.await, Ok(5));
    }

    #[tokio::test]
    async fn test_dispatch_forwards_outcome() {
        let (dispatch, tx) = Dispatch::<u32>::channel("k".into(), 3);
        assert_eq!(dispatch.generation(), 3);
        assert_eq!(dispatch.key(), "k");
        tx.send(Ok(9)).unwrap();
        assert_eq!(dispatch.await, Ok(9));
    }
}
