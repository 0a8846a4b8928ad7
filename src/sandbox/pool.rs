use crate::errors::MxfError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded concurrency for sandbox executions. On exhaustion, requests queue
/// up to `queue_timeout` and then fail with a resource error.
pub struct ExecutionPool {
    semaphore: Arc<Semaphore>,
    queue_timeout: Duration,
}

impl ExecutionPool {
    pub fn new(max_concurrent: usize, queue_timeout: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            queue_timeout,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, MxfError> {
        match tokio::time::timeout(self.queue_timeout, self.semaphore.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(MxfError::Operation("execution pool closed".to_string())),
            Err(_) => Err(MxfError::QuotaExceeded(format!(
                "no sandbox slot available within {}ms",
                self.queue_timeout.as_millis()
            ))),
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
