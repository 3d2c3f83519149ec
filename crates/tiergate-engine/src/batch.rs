//! Time-and-size bounded batching of point lookups into multi-key loads.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Multi-key backend behind a [`BatchWindow`].
#[async_trait]
pub trait BatchLoader: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Load every key at once. Keys missing from the map resolve to `None`.
    async fn load_batch(
        &self,
        keys: &[Self::Key],
    ) -> anyhow::Result<HashMap<Self::Key, Self::Value>>;
}

/// Delivered to every waiter of a failed batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchError {
    #[error("batch load failed: {0}")]
    Upstream(String),

    #[error("batch window is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Longest a request waits, measured from the first request of a batch.
    pub max_delay: Duration,
    /// Distinct keys per batch.
    pub max_batch_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_millis(10),
            max_batch_size: 64,
        }
    }
}

type Reply<V> = oneshot::Sender<Result<Option<V>, BatchError>>;

struct Request<K, V> {
    key: K,
    reply: Reply<V>,
}

/// Collects concurrent `load` calls and issues them as one
/// [`BatchLoader::load_batch`] call.
pub struct BatchWindow<L: BatchLoader> {
    tx: mpsc::UnboundedSender<Request<L::Key, L::Value>>,
}

impl<L: BatchLoader> Clone for BatchWindow<L> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<L: BatchLoader> BatchWindow<L> {
    /// Spawns the collector task; must be called inside a tokio runtime.
    /// The task exits once every handle is dropped.
    pub fn new(loader: Arc<L>, config: BatchConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(collect(loader, rx, config));
        Self { tx }
    }

    pub async fn load(&self, key: L::Key) -> Result<Option<L::Value>, BatchError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Request { key, reply })
            .map_err(|_| BatchError::Closed)?;
        rx.await.map_err(|_| BatchError::Closed)?
    }
}

async fn collect<L: BatchLoader>(
    loader: Arc<L>,
    mut rx: mpsc::UnboundedReceiver<Request<L::Key, L::Value>>,
    config: BatchConfig,
) {
    let max_size = config.max_batch_size.max(1);
    while let Some(first) = rx.recv().await {
        let deadline = Instant::now() + config.max_delay;
        let mut order: Vec<L::Key> = Vec::new();
        let mut waiters: HashMap<L::Key, Vec<Reply<L::Value>>> = HashMap::new();
        push(&mut order, &mut waiters, first);

        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);
        while order.len() < max_size {
            tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(request) => push(&mut order, &mut waiters, request),
                    None => break,
                },
                _ = &mut sleep => break,
            }
        }

        debug!(keys = order.len(), "Flushing batch window");
        tokio::spawn(flush(Arc::clone(&loader), order, waiters));
    }
}

fn push<K: Clone + Eq + Hash, V>(
    order: &mut Vec<K>,
    waiters: &mut HashMap<K, Vec<Reply<V>>>,
    request: Request<K, V>,
) {
    let slot = waiters.entry(request.key.clone()).or_default();
    if slot.is_empty() {
        order.push(request.key);
    }
    slot.push(request.reply);
}

async fn flush<L: BatchLoader>(
    loader: Arc<L>,
    keys: Vec<L::Key>,
    waiters: HashMap<L::Key, Vec<Reply<L::Value>>>,
) {
    match loader.load_batch(&keys).await {
        Ok(mut found) => {
            for (key, replies) in waiters {
                let value = found.remove(&key);
                for reply in replies {
                    let _ = reply.send(Ok(value.clone()));
                }
            }
        }
        Err(e) => {
            warn!(keys = keys.len(), error = %e, "Batch load failed");
            let err = BatchError::Upstream(format!("{e:#}"));
            for reply in waiters.into_values().flatten() {
                let _ = reply.send(Err(err.clone()));
            }
        }
    }
}
