//! Helpers shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

type Call<P, V> = (P, Option<oneshot::Sender<anyhow::Result<V>>>);

/// A loader whose calls stay pending until the test settles them.
pub struct Gate<P, V> {
    calls: Arc<Mutex<Vec<Call<P, V>>>>,
}

impl<P, V> Clone for Gate<P, V> {
    fn clone(&self) -> Self {
        Self {
            calls: self.calls.clone(),
        }
    }
}

impl<P: Clone + Send + 'static, V: Send + 'static> Gate<P, V> {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A loader recording each call and waiting for the test to settle it.
    pub fn loader(
        &self,
    ) -> impl Fn(P) -> BoxFuture<'static, anyhow::Result<V>> + Send + Sync + 'static {
        let calls = self.calls.clone();
        move |params: P| {
            let (tx, rx) = oneshot::channel();
            calls.lock().push((params, Some(tx)));
            Box::pin(async move {
                rx.await
                    .unwrap_or_else(|_| Err(anyhow::anyhow!("gate dropped")))
            })
        }
    }

    /// Number of loader calls so far.
    pub fn calls(&self) -> usize {
        self.calls.lock().len()
    }

    /// Parameters of call `index`.
    pub fn params(&self, index: usize) -> P {
        self.calls.lock()[index].0.clone()
    }

    /// Let the spawned loaders run until at least `count` calls were made.
    pub async fn wait_for_calls(&self, count: usize) {
        for _ in 0..1000 {
            if self.calls() >= count {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("expected {count} loader calls, saw {}", self.calls());
    }

    pub fn resolve(&self, index: usize, value: V) {
        self.settle(index, Ok(value));
    }

    pub fn fail(&self, index: usize, message: &str) {
        self.settle(index, Err(anyhow::anyhow!(message.to_string())));
    }

    fn settle(&self, index: usize, outcome: anyhow::Result<V>) {
        let tx = self.calls.lock()[index].1.take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
    }
}

/// Let spawned tasks make progress.
pub async fn settle_tasks() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}
