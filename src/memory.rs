//! An in-process, ack-capable queue backend.
//!
//! This backend keeps every queue in memory behind a mutex, which
//! makes it the reference implementation of the capability trait and
//! the workhorse of the test suite: it offers the full ack/nack
//! guarantee set (delivered tasks sit in an in-flight table until
//! settled) without any server to stand up, and it is `Clone` so that
//! producer and consumer sessions can share one set of queues.
//!
//! "Durable" is accepted and checked for declaration conflicts, but
//! the durability itself naturally ends at process exit.

use crate::backend::{Backend, Delivery, DeliveryTag};
use crate::error::{Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// A queue backend holding all state in process memory.
///
/// Clones share the same queues; each clone is its own session with
/// its own (notional) connection.  `len` reports ready tasks only -
/// a task sitting in a session's in-flight table is not counted.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
    connected: bool,
}

#[derive(Debug, Default)]
struct Shared {
    queues: Mutex<HashMap<String, QueueState>>,
    /// Wakes one parked dequeuer per arrival.  `notify_one` leaves a
    /// permit behind when nobody is parked yet, so an arrival cannot
    /// slip between a dequeuer's empty check and its park.
    arrivals: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    /// Durability recorded by the first `declare`; `None` until then.
    durable: Option<bool>,
    next_seq: u64,
    ready: VecDeque<Entry>,
    in_flight: HashMap<u64, Entry>,
}

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    body: Vec<u8>,
    deliveries: u64,
}

impl MemoryBackend {
    /// Creates an empty backend.  Sessions still call
    /// [`connect`][Backend::connect] before use, like any other
    /// backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected {
            Ok(())
        } else {
            Err(Error::connection("session is not connected"))
        }
    }
}

fn split_tag(tag: &DeliveryTag) -> Result<(&str, u64)> {
    let parsed = tag
        .as_ref()
        .rsplit_once('/')
        .and_then(|(queue, seq)| seq.parse::<u64>().ok().map(|seq| (queue, seq)));

    parsed.ok_or_else(|| Error::backend(format!("malformed delivery tag {tag}")))
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    fn supports_ack(&self) -> bool {
        true
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn declare(&mut self, queue: &str, durable: bool) -> Result<()> {
        self.ensure_connected()?;

        let mut queues = self.shared.queues.lock().await;
        let state = queues.entry(queue.to_owned()).or_default();

        match state.durable {
            None => {
                state.durable = Some(durable);
                Ok(())
            }
            Some(declared) if declared == durable => Ok(()),
            Some(declared) => Err(Error::QueueConfigConflict {
                queue: queue.to_owned(),
                requested: durable,
                declared,
            }),
        }
    }

    async fn enqueue(&mut self, queue: &str, body: &[u8]) -> Result<()> {
        self.ensure_connected()?;

        let mut queues = self.shared.queues.lock().await;
        let state = queues.entry(queue.to_owned()).or_default();

        let seq = state.next_seq;
        state.next_seq += 1;
        state.ready.push_back(Entry {
            seq,
            body: body.to_vec(),
            deliveries: 0,
        });
        drop(queues);

        self.shared.arrivals.notify_one();
        Ok(())
    }

    async fn dequeue(&mut self, queue: &str, wait: Duration) -> Result<Option<Delivery>> {
        self.ensure_connected()?;

        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // The arrival future must be created under the lock, so an
            // enqueue that lands after the empty check still wakes us.
            let parked = {
                let mut queues = self.shared.queues.lock().await;

                if let Some(state) = queues.get_mut(queue) {
                    if let Some(mut entry) = state.ready.pop_front() {
                        let delivery = Delivery::new(
                            DeliveryTag::new(format!("{queue}/{}", entry.seq)),
                            entry.body.clone(),
                            entry.deliveries,
                        );

                        entry.deliveries += 1;
                        state.in_flight.insert(entry.seq, entry);

                        return Ok(Some(delivery));
                    }
                }

                self.shared.arrivals.notified()
            };

            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }

            if tokio::time::timeout_at(deadline, parked).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_connected()?;

        let (queue, seq) = split_tag(&delivery.tag)?;
        let mut queues = self.shared.queues.lock().await;
        let removed = queues
            .get_mut(queue)
            .and_then(|state| state.in_flight.remove(&seq));

        if removed.is_some() {
            Ok(())
        } else {
            Err(Error::backend(format!(
                "delivery tag {} does not belong to this session or was already settled",
                delivery.tag
            )))
        }
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_connected()?;

        let (queue, seq) = split_tag(&delivery.tag)?;
        let mut queues = self.shared.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| Error::backend(format!("unknown queue {queue}")))?;

        let Some(entry) = state.in_flight.remove(&seq) else {
            return Err(Error::backend(format!(
                "delivery tag {} does not belong to this session or was already settled",
                delivery.tag
            )));
        };

        if requeue {
            // Ahead of the backlog, so a lone failed task is retried
            // promptly instead of waiting out the whole queue.
            state.ready.push_front(entry);
            drop(queues);
            self.shared.arrivals.notify_one();
        }

        Ok(())
    }

    async fn len(&mut self, queue: &str) -> Result<u64> {
        self.ensure_connected()?;

        let queues = self.shared.queues.lock().await;
        Ok(queues
            .get(queue)
            .map_or(0, |state| state.ready.len() as u64))
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }
}
