use super::{Config, Consumer, HandlerError};
use crate::backend::Backend;
use crate::retry::RetryPolicy;
use crate::task::Task;
use std::time::Duration;

/// Builder for a [`Consumer`], produced by [`Consumer::build`].
///
/// The handler service is a type parameter, so `with_service` must be
/// called before `build` becomes available.
pub struct ConsumerBuilder<B, S> {
    pub(super) backend: B,
    pub(super) service: S,
    pub(super) queue: String,
    pub(super) config: Config,
}

impl<B, S> ConsumerBuilder<B, S> {
    /// Sets the handler service deliveries are dispatched to.
    pub fn with_service<NS>(self, service: NS) -> ConsumerBuilder<B, NS>
    where
        NS: tower::Service<Task, Response = (), Error = HandlerError>,
    {
        ConsumerBuilder {
            backend: self.backend,
            service,
            queue: self.queue,
            config: self.config,
        }
    }

    /// Sets whether the queue is declared durable.
    pub fn with_durable(self, durable: bool) -> Self {
        let config = Config {
            durable,
            ..self.config
        };

        Self { config, ..self }
    }

    /// Sets the bounded wait of one dequeue poll.
    ///
    /// This is also the cancellation latency bound: a shutdown signal
    /// is noticed within about one interval.
    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        let config = Config {
            poll_interval,
            ..self.config
        };

        Self { config, ..self }
    }

    /// Stops the session once a poll finds the queue empty, instead of
    /// polling forever.  Useful for batch drains and tests.
    pub fn with_stop_when_empty(self, stop_when_empty: bool) -> Self {
        let config = Config {
            stop_when_empty,
            ..self.config
        };

        Self { config, ..self }
    }

    /// Sets the backoff policy used for connects and reconnects.
    pub fn with_retry_policy(self, retry: RetryPolicy) -> Self {
        let config = Config {
            retry,
            ..self.config
        };

        Self { config, ..self }
    }
}

impl<B, S> ConsumerBuilder<B, S>
where
    B: Backend,
    S: tower::Service<Task, Response = (), Error = HandlerError>,
{
    pub fn build(self) -> Consumer<B, S> {
        Consumer {
            backend: self.backend,
            service: self.service,
            queue: self.queue,
            config: self.config,
        }
    }
}

impl<B: std::fmt::Debug, S: std::fmt::Debug> std::fmt::Debug for ConsumerBuilder<B, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerBuilder")
            .field("backend", &self.backend)
            .field("queue", &self.queue)
            .field("service", &self.service)
            .field("config", &self.config)
            .finish()
    }
}
