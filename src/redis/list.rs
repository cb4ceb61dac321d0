use super::{check_durability, classify, split_tag};
use crate::backend::{Backend, Delivery, DeliveryTag};
use crate::error::{Error, Result};
use redis::AsyncCommands as _;
use std::time::Duration;

/// A queue on a Redis list: LPUSH one end, BRPOP the other.
///
/// This is the non-ack-capable family.  A popped task is gone from the
/// server before the handler ever sees it, so there is no redelivery
/// on failure, no recovery after a crash, and nothing for `ack` or
/// `nack` to do.  The upside is simplicity: any Redis, any version, no
/// group bookkeeping.  `len` is the list length, which by construction
/// never counts the task currently being processed.
pub struct ListBackend {
    client: redis::Client,
    connection: Option<redis::aio::MultiplexedConnection>,
    /// Pops are tagged with a session-local counter; the server has no
    /// handle of its own to offer.
    popped: u64,
}

impl std::fmt::Debug for ListBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListBackend")
            .field("client", &self.client)
            .field("connected", &self.connection.is_some())
            .field("popped", &self.popped)
            .finish()
    }
}

impl ListBackend {
    /// Creates a backend from a configured client.  No connection is
    /// opened until [`connect`][Backend::connect].
    #[must_use = "a backend does nothing unless used"]
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            connection: None,
            popped: 0,
        }
    }

    /// Creates a backend straight from a `redis://host:port/db` URL.
    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|source| Error::Backend {
            source: Box::new(source),
        })?;

        Ok(Self::new(client))
    }

    fn connection(&mut self) -> Result<&mut redis::aio::MultiplexedConnection> {
        self.connection
            .as_mut()
            .ok_or_else(|| Error::connection("session is not connected"))
    }
}

#[async_trait::async_trait]
impl Backend for ListBackend {
    fn supports_ack(&self) -> bool {
        false
    }

    async fn connect(&mut self) -> Result<()> {
        let connection = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(classify)?;

        self.connection = Some(connection);
        Ok(())
    }

    async fn declare(&mut self, queue: &str, durable: bool) -> Result<()> {
        let connection = self.connection()?;
        check_durability(connection, queue, durable).await
    }

    #[tracing::instrument(skip_all, fields(queue))]
    async fn enqueue(&mut self, queue: &str, body: &[u8]) -> Result<()> {
        let connection = self.connection()?;
        let _: i64 = connection.lpush(queue, body).await.map_err(classify)?;

        Ok(())
    }

    async fn dequeue(&mut self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        let connection = self.connection()?;

        let value: Option<Vec<u8>> = if wait.is_zero() {
            connection.rpop(queue, None).await.map_err(classify)?
        } else {
            // BRPOP's reply is (key, value); a timeout of 0 would mean
            // "forever", which the zero-wait branch above sidesteps.
            let reply: Option<(String, Vec<u8>)> = redis::cmd("BRPOP")
                .arg(queue)
                .arg(wait.as_secs_f64())
                .query_async(connection)
                .await
                .map_err(classify)?;

            reply.map(|(_, value)| value)
        };

        let Some(body) = value else {
            return Ok(None);
        };

        let tag = DeliveryTag::new(format!("{queue}/{}", self.popped));
        self.popped += 1;

        Ok(Some(Delivery::new(tag, body, 0)))
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        // The pop already removed the task; there is nothing to settle.
        let (queue, _) = split_tag(&delivery.tag)?;
        tracing::trace!(queue, tag = %delivery.tag, "ack is a no-op on a list queue");

        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let (queue, _) = split_tag(&delivery.tag)?;
        tracing::trace!(
            queue,
            tag = %delivery.tag,
            requeue,
            "nack is a no-op on a list queue"
        );

        Ok(())
    }

    async fn len(&mut self, queue: &str) -> Result<u64> {
        let connection = self.connection()?;
        connection.llen(queue).await.map_err(classify)
    }

    async fn close(&mut self) -> Result<()> {
        self.connection = None;
        Ok(())
    }
}
