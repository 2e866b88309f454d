//! Keyed work dispatcher.
//!
//! Jobs submitted under the same key run one at a time in submission order;
//! jobs under different keys run in parallel, at most `workers` at once. Each
//! active key owns a lane (a channel drained by one task) that is retired as
//! soon as it runs dry.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tracing::{debug, warn};

type Job = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct Lanes<K> {
    lanes: Mutex<HashMap<K, mpsc::UnboundedSender<Job>>>,
    permits: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct Dispatcher<K> {
    inner: Arc<Lanes<K>>,
}

impl<K> Dispatcher<K>
where
    K: Hash + Eq + Clone + Display + Send + Sync + 'static,
{
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(Lanes {
                lanes: Mutex::new(HashMap::new()),
                permits: Arc::new(Semaphore::new(workers.max(1))),
            }),
        }
    }

    /// Queue `job` behind every job already submitted under `key`.
    /// Failures are logged with the key; nothing is retried.
    pub async fn submit<F>(&self, key: K, job: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let mut job: Job = Box::pin(job);
        let mut lanes = self.inner.lanes.lock().await;

        if let Some(tx) = lanes.get(&key) {
            match tx.send(job) {
                Ok(()) => return,
                // The lane's task is gone (it panicked); start a new one.
                Err(mpsc::error::SendError(returned)) => job = returned,
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(job);
        lanes.insert(key.clone(), tx);
        tokio::spawn(drain(self.inner.clone(), key, rx));
    }

    /// Keys with queued or running work.
    pub async fn active_lanes(&self) -> usize {
        self.inner.lanes.lock().await.len()
    }
}

async fn drain<K>(inner: Arc<Lanes<K>>, key: K, mut rx: mpsc::UnboundedReceiver<Job>)
where
    K: Hash + Eq + Display,
{
    loop {
        let job = {
            // Submitters send while holding this lock, so an empty channel
            // observed here stays empty until the lane is gone.
            let mut lanes = inner.lanes.lock().await;
            match rx.try_recv() {
                Ok(job) => job,
                Err(_) => {
                    lanes.remove(&key);
                    debug!("Retired lane {}", key);
                    return;
                }
            }
        };

        let Ok(_permit) = inner.permits.clone().acquire_owned().await else {
            return;
        };
        if let Err(e) = job.await {
            warn!("Reconcile {} failed: {:#}", key, e);
        }
    }
}
