use std::sync::Arc;

use tokio::sync::{
    Mutex,
    mpsc::{self, Receiver, Sender, error::TrySendError},
};
use uuid::Uuid;

use crate::{error::ApiError, metrics::MetricsRegistry, models::ExecutionLimits};

/// One submission waiting for a sandbox slot. FIFO by submit time.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub id: Uuid,
    pub user: String,
    pub maze_id: String,
    pub code: String,
    pub limits: ExecutionLimits,
}

#[derive(Clone)]
pub struct Scheduler {
    sender: Sender<QueuedJob>,
    receiver: Arc<Mutex<Receiver<QueuedJob>>>,
    metrics: Arc<MetricsRegistry>,
}

impl Scheduler {
    pub fn new(capacity: usize, metrics: Arc<MetricsRegistry>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            metrics,
        }
    }

    /// Enqueue without blocking. A full queue is surfaced to the caller
    /// as a distinct rejection so they can retry later; it is never a
    /// silent drop.
    pub fn submit(&self, job: QueuedJob) -> Result<(), ApiError> {
        match self.sender.try_send(job) {
            Ok(()) => {
                self.metrics.submitted();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(ApiError::QueueFull),
            Err(TrySendError::Closed(_)) => {
                Err(ApiError::Internal("submission queue closed".to_string()))
            }
        }
    }

    pub fn receiver(&self) -> Arc<Mutex<Receiver<QueuedJob>>> {
        self.receiver.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{QueuedJob, Scheduler};
    use crate::{error::ApiError, metrics::MetricsRegistry, models::ExecutionLimits};

    fn job() -> QueuedJob {
        QueuedJob {
            id: uuid::Uuid::new_v4(),
            user: "tester".to_string(),
            maze_id: "tutorial".to_string(),
            code: "pass".to_string(),
            limits: ExecutionLimits {
                cpu_cores: 0.5,
                memory_mb: 256,
                timeout_ms: 5000,
                max_pids: 16,
                max_output_bytes: 4096,
            },
        }
    }

    #[tokio::test]
    async fn rejects_beyond_queue_depth() {
        let scheduler = Scheduler::new(1, Arc::new(MetricsRegistry::new()));
        scheduler.submit(job()).unwrap();
        assert!(matches!(scheduler.submit(job()), Err(ApiError::QueueFull)));
    }

    #[tokio::test]
    async fn drains_in_fifo_order() {
        let scheduler = Scheduler::new(4, Arc::new(MetricsRegistry::new()));
        let first = job();
        let second = job();
        scheduler.submit(first.clone()).unwrap();
        scheduler.submit(second.clone()).unwrap();

        let receiver = scheduler.receiver();
        let mut receiver = receiver.lock().await;
        assert_eq!(receiver.recv().await.unwrap().id, first.id);
        assert_eq!(receiver.recv().await.unwrap().id, second.id);
    }
}
