//! Bounded worker pool for upstream writes.
//!
//! Every item runs as its own task behind a semaphore permit and a timeout.
//! One item failing, timing out or panicking never cancels its siblings.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::warn;

use catalogsync_shared::CatalogSyncError;

/// Why a pooled item produced no value.
#[derive(Debug)]
pub enum TaskError {
    Failed(CatalogSyncError),
    TimedOut(Duration),
    Panicked(String),
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::TimedOut(after) => write!(f, "timed out after {}s", after.as_secs_f64()),
            Self::Panicked(msg) => write!(f, "task panicked: {msg}"),
        }
    }
}

/// Width and per-item timeout of a pool run.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub width: usize,
    pub item_timeout: Duration,
}

impl PoolConfig {
    pub fn new(width: usize, item_timeout: Duration) -> Self {
        Self {
            width: width.max(1),
            item_timeout,
        }
    }
}

/// Run `work` over `items` with at most `config.width` in flight.
///
/// Results come back in input order.
pub async fn run_bounded<I, T, F, Fut>(
    items: Vec<I>,
    config: PoolConfig,
    work: F,
) -> Vec<Result<T, TaskError>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = catalogsync_shared::Result<T>> + Send + 'static,
{
    let total = items.len();
    let semaphore = Arc::new(Semaphore::new(config.width.max(1)));
    let work = Arc::new(work);
    let mut set = JoinSet::new();

    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let work = work.clone();
        let timeout = config.item_timeout;

        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (
                    index,
                    Err(TaskError::Failed(CatalogSyncError::validation(
                        "worker pool closed",
                    ))),
                );
            };

            // Inner task so a panic surfaces as a JoinError we can attribute to `index`.
            let fut = work(item);
            let handle = tokio::spawn(async move { tokio::time::timeout(timeout, fut).await });

            let outcome = match handle.await {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(e))) => Err(TaskError::Failed(e)),
                Ok(Err(_elapsed)) => Err(TaskError::TimedOut(timeout)),
                Err(join_err) => Err(TaskError::Panicked(join_err.to_string())),
            };
            (index, outcome)
        });
    }

    let mut slots: Vec<Option<Result<T, TaskError>>> = (0..total).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, outcome)) => slots[index] = Some(outcome),
            Err(e) => warn!(error = %e, "pool task aborted"),
        }
    }

    slots
        .into_iter()
        .map(|slot| slot.unwrap_or_else(|| Err(TaskError::Panicked("task aborted".into()))))
        .collect()
}
