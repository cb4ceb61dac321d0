//! The backend capability trait and the delivery types it hands out.

use crate::error::Result;
use std::time::Duration;

/// An opaque handle identifying one delivery of one task.
///
/// Tags are minted by backends at dequeue time and spent by `ack` or
/// `nack`; they are not part of the task's identity, and a spent tag
/// must not be reused.  The constructor is crate-private to enforce at
/// the type level that only backends can mint tags - caller code can
/// carry them around and hand them back, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub(crate) String);

impl DeliveryTag {
    #[must_use]
    pub(crate) fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl AsRef<str> for DeliveryTag {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::ops::Deref for DeliveryTag {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// One dequeued task record, paired with the handle needed to settle
/// it.
///
/// A delivery is ephemeral: it exists from the dequeue that produced it
/// until the ack or nack that spends its tag.  The body is the task's
/// raw wire form; decoding is the caller's concern so that a malformed
/// record can still be settled (nacked without requeue) instead of
/// wedging the queue.
#[derive(Debug)]
#[non_exhaustive]
pub struct Delivery {
    /// The settlement handle for this delivery.
    pub tag: DeliveryTag,
    /// The task record, as stored.
    pub body: Vec<u8>,
    /// How many times this record was delivered before this delivery.
    ///
    /// Zero on first delivery, and always zero on backends that cannot
    /// track redelivery.
    pub redeliveries: u64,
}

impl Delivery {
    #[must_use]
    pub(crate) fn new(tag: DeliveryTag, body: Vec<u8>, redeliveries: u64) -> Self {
        Self {
            tag,
            body,
            redeliveries,
        }
    }
}

/// The capability set a queue store must provide.
///
/// A `Backend` value represents one session's exclusive handle on the
/// store: it owns at most one connection, and it is not safe to share
/// across concurrent callers.  Sessions wanting parallelism each get
/// their own value (the in-memory backend is `Clone` for exactly this;
/// the Redis backends are cheap to construct per session).
///
/// Coordination - the single-delivery guarantee across sessions,
/// redelivery after nack or consumer death - is the store's job, not
/// this trait's.  The trait only transports the operations.
#[async_trait::async_trait]
pub trait Backend: Send {
    /// Whether delivered tasks survive until [`ack`][Backend::ack].
    ///
    /// When this is `false`, `ack` and `nack` are no-ops, a popped
    /// task is gone regardless of processing outcome, and failure
    /// handling is limited to reporting.  Consumers branch on this
    /// flag; so should anyone choosing a backend.
    fn supports_ack(&self) -> bool;

    /// Establishes (or re-establishes) the session's connection.
    ///
    /// Safe to call after a connection loss; the previous connection,
    /// if any, is discarded.
    async fn connect(&mut self) -> Result<()>;

    /// Declares a queue, creating it if needed.
    ///
    /// Idempotent: re-declaring an existing queue with the same
    /// durability is a no-op, while a durability mismatch fails with
    /// [`Error::QueueConfigConflict`][crate::Error::QueueConfigConflict].
    async fn declare(&mut self, queue: &str, durable: bool) -> Result<()>;

    /// Appends a task record to the queue.
    async fn enqueue(&mut self, queue: &str, body: &[u8]) -> Result<()>;

    /// Takes the next task record, waiting up to `wait` for one.
    ///
    /// Returns `None` when the queue stayed empty for the whole wait.
    /// The wait is a bound, not a promise: a cancellation-aware caller
    /// can rely on regaining control within roughly `wait`.
    async fn dequeue(&mut self, queue: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Settles a delivery as done, removing the task permanently.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Settles a delivery as failed.
    ///
    /// With `requeue`, the task becomes deliverable again (ahead of
    /// the backlog, so a lone failure is retried promptly); without
    /// it, the task is removed for good.  On non-ack-capable backends
    /// both forms are no-ops.
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Current queue depth.
    ///
    /// Best-effort: whether in-flight deliveries are counted differs
    /// per backend and is documented on each implementation.
    async fn len(&mut self, queue: &str) -> Result<u64>;

    /// Releases the session's connection.
    ///
    /// Operations after `close` fail until [`connect`][Backend::connect]
    /// is called again.
    async fn close(&mut self) -> Result<()>;
}
