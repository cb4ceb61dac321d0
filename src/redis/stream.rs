use super::{check_durability, classify, split_tag};
use crate::backend::{Backend, Delivery, DeliveryTag};
use crate::error::{Error, Result};
use redis::AsyncCommands as _;
use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

/// Reserved consumer name whose pending list parks nacked entries.
///
/// No real session may use this name; entries claimed into it sit
/// outside every live session's pending list, and dequeues pick them
/// up again with no idle wait.  (Should one linger long enough, the
/// idle steal reclaims it too.)
const REQUEUE_CONSUMER: &str = "$$requeue";

/// A queue on a Redis stream with a consumer group.
///
/// This is the ack-capable family: the server keeps every delivered
/// entry in the group's pending list until the session settles it, so
/// handler failures requeue, crashed sessions are stolen from after
/// [`idle_timeout`][StreamBackend::with_idle_timeout], and nothing is
/// lost short of the server itself going down.  Duplicates are
/// possible by design - that is the at-least-once trade.
///
/// `len` is the stream length; acknowledged entries are deleted, so
/// the count covers ready, in-flight, and parked (nacked but not yet
/// redelivered) tasks.
///
/// Each session needs its own value; give concurrent sessions on one
/// queue distinct consumer names so the group can tell them apart.
/// Keeping the name stable across restarts is what lets a restarted
/// session reclaim the delivery it died holding.
pub struct StreamBackend {
    client: redis::Client,
    connection: Option<redis::aio::MultiplexedConnection>,
    group: String,
    consumer: String,
    idle_timeout: Duration,
    prefetch: usize,
    /// Entries read ahead of the one in flight (`prefetch` > 1); they
    /// already sit in this session's pending list.
    buffer: VecDeque<Delivery>,
    /// Tags handed out and not yet settled.  The one-in-flight
    /// discipline keeps this at zero or one.
    in_flight: BTreeSet<String>,
}

impl std::fmt::Debug for StreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBackend")
            .field("client", &self.client)
            .field("connected", &self.connection.is_some())
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .field("idle_timeout", &self.idle_timeout)
            .field("prefetch", &self.prefetch)
            .field("buffer", &self.buffer)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

fn not_connected() -> Error {
    Error::connection("session is not connected")
}

impl StreamBackend {
    /// Creates a backend from a configured client.  No connection is
    /// opened until [`connect`][Backend::connect].
    #[must_use = "a backend does nothing unless used"]
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            connection: None,
            group: "workers".to_owned(),
            consumer: "worker".to_owned(),
            idle_timeout: Duration::from_secs(60),
            prefetch: 1,
            buffer: VecDeque::new(),
            in_flight: BTreeSet::new(),
        }
    }

    /// Creates a backend straight from a `redis://host:port/db` URL.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|source| Error::Backend {
            source: Box::new(source),
        })?;

        Ok(Self::new(client))
    }

    /// Sets the consumer-group name (default `workers`).  Every group
    /// sees the whole queue independently.
    #[must_use]
    pub fn with_group(self, group: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            ..self
        }
    }

    /// Sets this session's consumer name (default `worker`).  Must be
    /// unique among live sessions of one group.
    #[must_use]
    pub fn with_consumer(self, consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..self
        }
    }

    /// Sets the redelivery horizon for entries held by dead sessions
    /// (default 60s).  Handlers must finish well inside it, or their
    /// task may be stolen and processed twice.
    #[must_use]
    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout,
            ..self
        }
    }

    /// Sets the read batch hint (default 1, the one-in-flight match).
    #[must_use]
    pub fn with_prefetch(self, prefetch: usize) -> Self {
        Self {
            prefetch: prefetch.max(1),
            ..self
        }
    }

    /// Queues up found entries and takes the first, marking it in
    /// flight.
    fn take(&mut self, found: Vec<Delivery>) -> Option<Delivery> {
        self.buffer.extend(found);

        let delivery = self.buffer.pop_front()?;
        self.in_flight.insert(delivery.tag.as_ref().to_owned());
        Some(delivery)
    }

    /// Entries this session already owns - left over when a session
    /// restarts under the same consumer name after dying mid-task.
    #[tracing::instrument(skip_all, fields(queue))]
    async fn reclaim_own(&mut self, queue: &str) -> Result<Vec<Delivery>> {
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;
        let mut pending: redis::streams::StreamPendingCountReply = connection
            .xpending_consumer_count(queue, &self.group, "-", "+", 10, &self.consumer)
            .await
            .map_err(classify)?;

        // Entries already buffered or in flight are ours on purpose.
        pending.ids.retain(|item| {
            let tag = format!("{queue}/{}", item.id);
            !self.in_flight.contains(&tag)
                && !self.buffer.iter().any(|held| held.tag.as_ref() == tag)
        });

        self.claim_from(queue, pending, 0).await
    }

    /// Entries parked by a nack, redeliverable immediately.
    async fn claim_parked(&mut self, queue: &str) -> Result<Vec<Delivery>> {
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;
        let pending: redis::streams::StreamPendingCountReply = connection
            .xpending_consumer_count(queue, &self.group, "-", "+", 1, REQUEUE_CONSUMER)
            .await
            .map_err(classify)?;

        self.claim_from(queue, pending, 0).await
    }

    /// Entries another session has held past the idle horizon - its
    /// consumer presumably died with them.
    #[tracing::instrument(skip_all, fields(queue))]
    async fn steal_idle(&mut self, queue: &str) -> Result<Vec<Delivery>> {
        let idle = self.idle_timeout.as_millis() as usize;
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;

        // XPENDING with IDLE needs the raw form; the typed helper has
        // no slot for the option.
        let pending: redis::streams::StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.group)
            .arg("IDLE")
            .arg(idle)
            .arg("-")
            .arg("+")
            .arg(1)
            .query_async(connection)
            .await
            .map_err(classify)?;

        self.claim_from(queue, pending, idle).await
    }

    async fn claim_from(
        &mut self,
        queue: &str,
        pending: redis::streams::StreamPendingCountReply,
        min_idle: usize,
    ) -> Result<Vec<Delivery>> {
        if pending.ids.is_empty() {
            return Ok(vec![]);
        }

        let connection = self.connection.as_mut().ok_or_else(not_connected)?;
        let ids = pending
            .ids
            .iter()
            .map(|item| item.id.as_str())
            .collect::<Vec<_>>();

        let claims: redis::streams::StreamClaimReply = connection
            .xclaim(queue, &self.group, &self.consumer, min_idle, &ids)
            .await
            .map_err(classify)?;

        Ok(claims
            .ids
            .into_iter()
            .map(|entry| {
                // The pending reply knows how often this entry was
                // handed out before we claimed it.
                let redeliveries = pending
                    .ids
                    .iter()
                    .find(|item| item.id == entry.id)
                    .map_or(0, |item| item.times_delivered as u64);

                into_delivery(queue, entry, redeliveries)
            })
            .collect())
    }

    /// Brand-new entries, waiting up to `wait` for one to arrive.
    async fn read_fresh(&mut self, queue: &str, wait: Duration) -> Result<Vec<Delivery>> {
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;

        let mut options = redis::streams::StreamReadOptions::default()
            .count(self.prefetch)
            .group(&self.group, &self.consumer);
        // BLOCK 0 would mean "forever"; a zero wait reads and returns.
        let wait = wait.as_millis() as usize;
        if wait > 0 {
            options = options.block(wait);
        }

        let reply: redis::streams::StreamReadReply = connection
            .xread_options(&[queue], &[">"], &options)
            .await
            .map_err(classify)?;

        let Some(key) = reply.keys.into_iter().find(|key| key.key == queue) else {
            return Ok(vec![]);
        };

        Ok(key
            .ids
            .into_iter()
            .map(|entry| into_delivery(queue, entry, 0))
            .collect())
    }
}

fn into_delivery(queue: &str, entry: redis::streams::StreamId, redeliveries: u64) -> Delivery {
    // A missing or non-binary data field yields an empty body, which
    // the decode step then quarantines as malformed.
    let body = entry
        .map
        .get("data")
        .and_then(|value| redis::from_redis_value::<Vec<u8>>(value).ok())
        .unwrap_or_default();

    Delivery::new(
        DeliveryTag::new(format!("{queue}/{}", entry.id)),
        body,
        redeliveries,
    )
}

#[async_trait::async_trait]
impl Backend for StreamBackend {
    fn supports_ack(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<()> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;

        self.connection = Some(connection);
        // Handles minted over the old connection are stale; anything
        // unsettled sits in our pending list and will be reclaimed.
        self.buffer.clear();
        self.in_flight.clear();

        Ok(())
    }

    async fn declare(&mut self, queue: &str, durable: bool) -> Result<()> {
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;
        check_durability(connection, queue, durable).await?;

        connection
            .xgroup_create_mkstream(queue, &self.group, "0")
            .await
            .or_else(|error| {
                // Another session created the group first; that is the
                // idempotent case, not a failure.
                if error.code().is_some_and(|code| code == "BUSYGROUP") {
                    Ok(())
                } else {
                    Err(error)
                }
            })
            .map_err(classify)
    }

    #[tracing::instrument(skip_all, fields(queue))]
    async fn enqueue(&mut self, queue: &str, body: &[u8]) -> Result<()> {
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;
        let _: String = connection
            .xadd(queue, "*", &[("data", body)])
            .await
            .map_err(classify)?;

        Ok(())
    }

    async fn dequeue(&mut self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        debug_assert!(
            self.in_flight.is_empty(),
            "a delivery is still unsettled (ack or nack it first)"
        );

        if let Some(delivery) = self.take(vec![]) {
            return Ok(Some(delivery));
        }

        let found = self.reclaim_own(queue).await?;
        if let Some(delivery) = self.take(found) {
            return Ok(Some(delivery));
        }

        let found = self.claim_parked(queue).await?;
        if let Some(delivery) = self.take(found) {
            return Ok(Some(delivery));
        }

        let found = self.steal_idle(queue).await?;
        if let Some(delivery) = self.take(found) {
            return Ok(Some(delivery));
        }

        let found = self.read_fresh(queue, wait).await?;
        Ok(self.take(found))
    }

    #[tracing::instrument(skip_all, fields(tag = %delivery.tag))]
    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        assert!(
            self.in_flight.contains(delivery.tag.as_ref()),
            "delivery does not belong to this session"
        );

        let (queue, id) = split_tag(&delivery.tag)?;
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;

        let _: i64 = connection
            .xack(queue, &self.group, &[id])
            .await
            .map_err(classify)?;
        // Acked entries are deleted so the stream length stays the
        // queue depth.
        let _: i64 = connection.xdel(queue, &[id]).await.map_err(classify)?;

        self.in_flight.remove(delivery.tag.as_ref());
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(tag = %delivery.tag, requeue))]
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        assert!(
            self.in_flight.contains(delivery.tag.as_ref()),
            "delivery does not belong to this session"
        );

        let (queue, id) = split_tag(&delivery.tag)?;
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;

        if requeue {
            let options = redis::streams::StreamClaimOptions::default().with_justid();
            let claims: Vec<String> = connection
                .xclaim_options(queue, &self.group, REQUEUE_CONSUMER, 0, &[id], options)
                .await
                .map_err(classify)?;

            if claims.is_empty() {
                return Err(Error::backend(format!(
                    "could not park entry {id} for requeue; it is no longer pending"
                )));
            }
        } else {
            let _: i64 = connection
                .xack(queue, &self.group, &[id])
                .await
                .map_err(classify)?;
            let _: i64 = connection.xdel(queue, &[id]).await.map_err(classify)?;
        }

        self.in_flight.remove(delivery.tag.as_ref());
        Ok(())
    }

    async fn len(&mut self, queue: &str) -> Result<u64> {
        let connection = self.connection.as_mut().ok_or_else(not_connected)?;
        connection.xlen(queue).await.map_err(classify)
    }

    async fn close(&mut self) -> Result<()> {
        self.connection = None;
        self.buffer.clear();
        self.in_flight.clear();
        Ok(())
    }
}
