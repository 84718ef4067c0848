use crate::errors::RelayError;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Single-writer work queue. Jobs run one at a time in submission order on a
/// dedicated worker task, which keeps session mutations from racing.
#[derive(Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self { tx }
    }

    pub fn enqueue<F, T>(&self, fut: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(fut.await);
        });
        let _ = self.tx.send(job);
        done_rx
    }

    pub async fn run<F, T>(&self, fut: F) -> Result<T, RelayError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(fut)
            .await
            .map_err(|_| RelayError::Transport("queue worker stopped".to_string()))
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn runs_jobs_in_submission_order() {
        let queue = SerialQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..8u32 {
            let seen = seen.clone();
            // Earlier jobs sleep longer; order must still hold.
            let delay = Duration::from_millis(8u64.saturating_sub(i as u64));
            waiters.push(queue.enqueue(async move {
                tokio::time::sleep(delay).await;
                seen.lock().await.push(i);
            }));
        }
        for waiter in waiters {
            waiter.await.expect("job");
        }
        assert_eq!(*seen.lock().await, (0..8).collect::<Vec<u32>>());
    }
}
