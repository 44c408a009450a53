//! Helper-call rate limiting
//!
//! Token-bucket over a FIFO queue: at most `max_concurrent` jobs in flight
//! and at least `min_interval` between job starts. Jobs are started strictly
//! in enqueue order; completion order is unconstrained. Jobs carry an
//! optional tab tag so closing a tab drops its queued work without running.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use std::future::Future;
use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use crate::models::TabId;

/// The job was dropped before running (tab closed or limiter shut down).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

struct Job {
    tag: Option<(TabId, u64)>,
    work: BoxFuture<'static, ()>,
}

/// FIFO dispatch queue with concurrency and pacing limits.
#[derive(Clone)]
pub struct RateLimiter {
    tx: mpsc::UnboundedSender<Job>,
    generations: Arc<Mutex<HashMap<TabId, u64>>>,
}

impl RateLimiter {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let generations: Arc<Mutex<HashMap<TabId, u64>>> = Arc::new(Mutex::new(HashMap::new()));
        tokio::spawn(dispatch_loop(
            rx,
            generations.clone(),
            max_concurrent,
            min_interval,
        ));
        Self { tx, generations }
    }

    /// Queue a job and wait for its result.
    ///
    /// Jobs tagged with a tab are dropped (resolving `Err(Canceled)`) if
    /// [`cancel_tab`](Self::cancel_tab) runs before they dispatch.
    pub async fn enqueue<F, Fut, T>(&self, tab: Option<TabId>, job: F) -> Result<T, Canceled>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let tag = match tab {
            Some(tab_id) => {
                let generations = self.generations.lock().await;
                Some((tab_id, generations.get(&tab_id).copied().unwrap_or(0)))
            }
            None => None,
        };

        let (done_tx, done_rx) = oneshot::channel();
        let work: BoxFuture<'static, ()> = Box::pin(async move {
            let _ = done_tx.send(job().await);
        });

        self.tx.send(Job { tag, work }).map_err(|_| Canceled)?;
        done_rx.await.map_err(|_| Canceled)
    }

    /// Drop every queued job tagged with this tab. In-flight jobs finish.
    pub async fn cancel_tab(&self, tab_id: TabId) {
        let mut generations = self.generations.lock().await;
        *generations.entry(tab_id).or_insert(0) += 1;
    }
}

async fn dispatch_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    generations: Arc<Mutex<HashMap<TabId, u64>>>,
    max_concurrent: usize,
    min_interval: Duration,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    let mut last_start: Option<Instant> = None;

    while let Some(job) = rx.recv().await {
        if job_canceled(&generations, job.tag).await {
            continue;
        }

        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        // A cancel may land while the job sits waiting for a slot.
        if job_canceled(&generations, job.tag).await {
            continue;
        }

        if let Some(last) = last_start {
            let elapsed = last.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }
        last_start = Some(Instant::now());

        tokio::spawn(async move {
            let _permit = permit;
            job.work.await;
        });
    }
}

/// Dropping a canceled job drops its result sender; the caller observes
/// `Canceled`.
async fn job_canceled(
    generations: &Arc<Mutex<HashMap<TabId, u64>>>,
    tag: Option<(TabId, u64)>,
) -> bool {
    let Some((tab_id, generation)) = tag else {
        return false;
    };
    let current = generations.lock().await.get(&tab_id).copied().unwrap_or(0);
    if current != generation {
        debug!("dropping queued job for closed tab {tab_id}");
        return true;
    }
    false
}
