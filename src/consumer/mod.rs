mod build;

pub use self::build::ConsumerBuilder;

use crate::backend::{Backend, Delivery};
use crate::error::Result;
use crate::retry::{connect_with_retry, RetryPolicy};
use crate::task::Task;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::watch;
use tower::{Service, ServiceExt as _};

/// The error type handlers report failure with.
///
/// It never enters the library's own error enum: the consumer turns it
/// into a nack (ack-capable backends) or a loud loss report
/// (non-ack-capable ones), and the session keeps running either way.
pub type HandlerError = tower::BoxError;

/// The dequeue half of the work queue.
///
/// A consumer owns one backend session, targets one queue, and drives
/// one delivery at a time through a handler service: dequeue, decode,
/// call, then ack on success or nack-with-requeue on failure.  Exactly
/// one task is ever in flight per session; callers wanting parallelism
/// run one consumer per logical worker and let the backend spread
/// deliveries between them.
///
/// Built with [`Consumer::build`], started with [`Consumer::run`],
/// awaited through the returned [`Session`].
pub struct Consumer<B, S> {
    backend: B,
    service: S,
    queue: String,
    config: Config,
}

impl Consumer<(), ()> {
    /// Starts building a consumer for `queue`.
    pub fn build<B: Backend>(backend: B, queue: impl Into<String>) -> ConsumerBuilder<B, ()> {
        ConsumerBuilder {
            backend,
            service: (),
            queue: queue.into(),
            config: Config::default(),
        }
    }
}

impl<B, S> Consumer<B, S>
where
    B: Backend + 'static,
    S: Service<Task, Response = (), Error = HandlerError> + 'static,
{
    /// Connects, declares the queue, and starts the delivery loop.
    ///
    /// Connection failures are retried under the backoff policy; a
    /// durability conflict is permanent and fails here, before any
    /// delivery.  The loop itself runs inside the returned [`Session`]
    /// and makes progress only while the session is awaited.
    pub async fn run(mut self) -> Result<Session<'static>> {
        connect_with_retry(&mut self.backend, &self.config.retry).await?;
        self.backend
            .declare(&self.queue, self.config.durable)
            .await?;

        let (tx, rx) = watch::channel(false);
        let task = Box::pin(deliver_loop(
            self.backend,
            self.service,
            self.queue,
            self.config,
            rx,
        ));

        Ok(Session {
            task,
            tx: Some(tx),
            stop: Box::pin(futures::future::pending::<()>()),
        })
    }
}

impl<B: std::fmt::Debug, S: std::fmt::Debug> std::fmt::Debug for Consumer<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("backend", &self.backend)
            .field("queue", &self.queue)
            .field("service", &self.service)
            .field("config", &self.config)
            .finish()
    }
}

#[tracing::instrument(skip_all, name = "queue.session", fields(queue = %queue))]
async fn deliver_loop<B, S>(
    mut backend: B,
    mut service: S,
    queue: String,
    config: Config,
    mut rx: watch::Receiver<bool>,
) -> Result<()>
where
    B: Backend,
    S: Service<Task, Response = (), Error = HandlerError>,
{
    let result = drive(&mut backend, &mut service, &queue, &config, &mut rx).await;

    // The connection is released on every exit path, including
    // cancellation and fatal errors.
    let closed = backend.close().await;
    result.and(closed)
}

async fn drive<B, S>(
    backend: &mut B,
    service: &mut S,
    queue: &str,
    config: &Config,
    rx: &mut watch::Receiver<bool>,
) -> Result<()>
where
    B: Backend,
    S: Service<Task, Response = (), Error = HandlerError>,
{
    loop {
        // Cancellation interrupts only the dequeue wait.  Once a task
        // is in flight, its ack or nack always completes before the
        // session winds down.
        let polled = tokio::select! {
            _ = rx.changed() => break,
            polled = backend.dequeue(queue, config.poll_interval) => polled,
        };

        let delivery = match polled {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                if config.stop_when_empty {
                    break;
                }
                continue;
            }
            Err(error) if error.is_transient() => {
                tracing::warn!(%error, "lost the backend connection; reconnecting");
                connect_with_retry(backend, &config.retry).await?;
                continue;
            }
            Err(error) => return Err(error),
        };

        let settled = match Task::decode(&delivery.body) {
            Ok(task) => settle(backend, service, &delivery, task).await,
            Err(error) => quarantine(backend, &delivery, &error).await,
        };

        if let Err(error) = settled {
            if error.is_transient() {
                // The unsettled delivery stays with the backend and
                // will be redelivered; that is what at-least-once
                // means.
                tracing::warn!(%error, "lost the backend connection mid-settle; reconnecting");
                connect_with_retry(backend, &config.retry).await?;
                continue;
            }
            return Err(error);
        }
    }

    Ok(())
}

/// A record that failed to decode never reaches a handler and is never
/// retried: it is removed without requeue where the backend allows,
/// and was already gone where it does not.
async fn quarantine<B: Backend>(
    backend: &mut B,
    delivery: &Delivery,
    error: &crate::Error,
) -> Result<()> {
    if backend.supports_ack() {
        tracing::warn!(
            %error,
            tag = %delivery.tag,
            "malformed task record; removing it without requeue"
        );
        backend.nack(delivery, false).await
    } else {
        tracing::warn!(%error, tag = %delivery.tag, "malformed task record dropped");
        Ok(())
    }
}

async fn settle<B, S>(
    backend: &mut B,
    service: &mut S,
    delivery: &Delivery,
    task: Task,
) -> Result<()>
where
    B: Backend,
    S: Service<Task, Response = (), Error = HandlerError>,
{
    let id = task.id;

    // The handler runs inline: the session makes no progress until it
    // returns, which is exactly the one-in-flight contract.
    let outcome = match service.ready().await {
        Ok(service) => service.call(task).await,
        Err(error) => Err(error),
    };

    match outcome {
        Ok(()) => {
            if backend.supports_ack() {
                backend.ack(delivery).await?;
            }
            tracing::debug!(%id, "task done");
        }
        Err(error) if backend.supports_ack() => {
            tracing::warn!(
                %id,
                %error,
                redeliveries = delivery.redeliveries,
                "handler failed; returning the task to the queue"
            );
            backend.nack(delivery, true).await?;
        }
        Err(error) => {
            // Distinct from the requeue path on purpose: operators
            // should see that this backend's guarantee is weaker.
            tracing::error!(
                %id,
                %error,
                "handler failed and this backend cannot requeue; the task is lost"
            );
        }
    }

    Ok(())
}

#[derive(Debug, Clone)]
pub(super) struct Config {
    pub(super) durable: bool,
    pub(super) poll_interval: Duration,
    pub(super) stop_when_empty: bool,
    pub(super) retry: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            durable: true,
            poll_interval: Duration::from_secs(1),
            stop_when_empty: false,
            retry: RetryPolicy::default(),
        }
    }
}

type SessionFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A running consumer session.
///
/// The delivery loop lives inside this handle and runs while
/// [`wait`][Session::wait] is awaited.  A shutdown future installed
/// with [`with_graceful_shutdown`][Session::with_graceful_shutdown]
/// interrupts the loop's dequeue wait - within about one poll interval
/// - while an in-flight task still completes its ack or nack first.
#[must_use]
pub struct Session<'shutdown> {
    task: SessionFuture<'static, Result<()>>,
    tx: Option<watch::Sender<bool>>,
    stop: SessionFuture<'shutdown, ()>,
}

impl<'shutdown> Session<'shutdown> {
    /// Installs a future whose completion stops the session.
    pub fn with_graceful_shutdown<F>(self, future: F) -> Self
    where
        F: Future<Output = ()> + 'shutdown,
    {
        if let Some(tx) = self.tx {
            let stop = Box::pin(async move {
                future.await;
                tx.send(true).ok();
            });

            Self {
                task: self.task,
                tx: None,
                stop,
            }
        } else {
            self
        }
    }

    /// Drives the session to completion.
    ///
    /// Resolves when the loop ends on its own (`stop_when_empty`, or a
    /// fatal error) or after the shutdown future fires and the loop
    /// winds down.
    pub async fn wait(self) -> Result<()> {
        let Session { task, tx, stop } = self;

        // Held for the whole wait so an unsignalled session never
        // observes a closed channel.
        let _tx = tx;

        match futures::future::select(task, stop).await {
            futures::future::Either::Left((result, _)) => result,
            futures::future::Either::Right(((), task)) => task.await,
        }
    }
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}
