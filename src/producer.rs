use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::retry::{connect_with_retry, RetryPolicy};
use crate::task::Task;
use uuid::Uuid;

/// The enqueue half of the work queue.
///
/// A producer owns one backend session and targets one queue.  It
/// assigns each task its identity and creation time, serializes it,
/// and pushes it through the backend, absorbing transient connection
/// failures with the shared backoff policy.  Once the retry budget is
/// spent the enqueue fails with
/// [`Error::EnqueueFailed`] and the task is *not* buffered anywhere -
/// deciding whether to drop it or persist it locally is the caller's
/// call.
#[derive(Debug)]
pub struct Producer<B> {
    backend: B,
    queue: String,
    durable: bool,
    retry: RetryPolicy,
}

impl<B: Backend> Producer<B> {
    /// Creates a producer for `queue`, durable by default.
    #[must_use = "a producer does nothing unless used"]
    pub fn new(backend: B, queue: impl Into<String>) -> Self {
        Self {
            backend,
            queue: queue.into(),
            durable: true,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets whether the queue is declared durable.
    #[must_use]
    pub fn with_durable(self, durable: bool) -> Self {
        Self { durable, ..self }
    }

    /// Sets the backoff policy for connects and failed enqueues.
    #[must_use]
    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        Self { retry, ..self }
    }

    /// Opens the session and declares the queue.
    ///
    /// Connection failures are retried under the backoff policy; a
    /// durability conflict on the declared queue is permanent and
    /// surfaces immediately.
    pub async fn connect(&mut self) -> Result<()> {
        connect_with_retry(&mut self.backend, &self.retry).await?;
        self.backend.declare(&self.queue, self.durable).await
    }

    /// Enqueues one task, returning its assigned id.
    #[tracing::instrument(skip_all, name = "queue.enqueue", fields(queue = %self.queue))]
    pub async fn enqueue(
        &mut self,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Result<Uuid> {
        let task = Task::new(payload);
        let body = task.encode()?;
        let mut attempt = 0u32;

        loop {
            match self.backend.enqueue(&self.queue, &body).await {
                Ok(()) => {
                    tracing::debug!(id = %task.id, "task enqueued");
                    return Ok(task.id);
                }
                Err(error) if error.is_transient() => {
                    attempt += 1;
                    let Some(delay) = self.retry.delay(attempt) else {
                        return Err(Error::EnqueueFailed {
                            queue: self.queue.clone(),
                            attempts: attempt,
                            source: Box::new(error),
                        });
                    };

                    tracing::warn!(
                        %error,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "enqueue failed; backing off before retrying"
                    );
                    tokio::time::sleep(delay).await;

                    // A fresh connection for the next attempt; if even
                    // that fails transiently, the next enqueue attempt
                    // keeps consuming the same budget.
                    if let Err(error) = self.backend.connect().await {
                        if !error.is_transient() {
                            return Err(error);
                        }
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Current depth of the target queue.
    ///
    /// Best-effort; see [`Backend::len`] for what each backend counts.
    pub async fn size(&mut self) -> Result<u64> {
        self.backend.len(&self.queue).await
    }

    /// Closes the session.
    pub async fn close(mut self) -> Result<()> {
        self.backend.close().await
    }
}
