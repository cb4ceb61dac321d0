use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::service_fn;
use wq::{Backend, Consumer, Delivery, Error, HandlerError, MemoryBackend, Producer, RetryPolicy, Task};

fn payload(seq: u64) -> serde_json::Map<String, serde_json::Value> {
    serde_json::Map::from_iter([
        ("seq".to_owned(), serde_json::json!(seq)),
        ("note".to_owned(), serde_json::json!(format!("order #{seq}"))),
    ])
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::from_millis(5))
        .with_max_delay(Duration::from_millis(20))
        .with_jitter(0.0)
}

#[test]
fn backoff_delays_grow_and_cap() {
    let policy = RetryPolicy::default()
        .with_base_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(40))
        .with_max_attempts(4)
        .with_jitter(0.0);

    assert_eq!(policy.delay(1), Some(Duration::from_millis(10)));
    assert_eq!(policy.delay(2), Some(Duration::from_millis(20)));
    assert_eq!(policy.delay(3), Some(Duration::from_millis(40)));
    assert_eq!(policy.delay(4), Some(Duration::from_millis(40)));
    assert_eq!(policy.delay(5), None);
}

#[test]
fn task_round_trip() -> anyhow::Result<()> {
    let mut task = Task::new(payload(7));
    task.extra.insert(
        "priority".to_owned(),
        serde_json::json!({"class": "bulk", "weight": 3}),
    );

    let decoded = Task::decode(&task.encode()?)?;

    assert_eq!(task, decoded);
    assert_eq!(
        decoded.extra.get("priority"),
        Some(&serde_json::json!({"class": "bulk", "weight": 3}))
    );
    Ok(())
}

#[test]
fn unknown_wire_fields_survive_reencoding() -> anyhow::Result<()> {
    let record = serde_json::json!({
        "id": "0d6f9a1e-3f65-4b2a-b7c6-0a4f3b2e9d11",
        "payload": {"seq": 1},
        "created_at": "2024-05-04T12:00:00Z",
        "trace": "abc-123",
    });

    let task = Task::decode(record.to_string().as_bytes())?;
    assert_eq!(task.extra.get("trace"), Some(&serde_json::json!("abc-123")));

    let reencoded: serde_json::Value = serde_json::from_slice(&task.encode()?)?;
    assert_eq!(reencoded.get("trace"), Some(&serde_json::json!("abc-123")));
    Ok(())
}

#[test]
fn malformed_records_are_rejected() {
    let garbage = Task::decode(b"definitely not a task");
    assert!(matches!(garbage, Err(Error::MalformedTask { .. })));

    // Valid JSON, but the record is missing created_at.
    let partial = Task::decode(br#"{"id": "0d6f9a1e-3f65-4b2a-b7c6-0a4f3b2e9d11", "payload": {}}"#);
    assert!(matches!(partial, Err(Error::MalformedTask { .. })));
}

/// Ten tasks in, ten tasks out, same order, queue empty at the end.
#[tokio::test]
async fn drains_in_order() -> anyhow::Result<()> {
    let backend = MemoryBackend::new();

    let mut producer = Producer::new(backend.clone(), "orders");
    producer.connect().await?;

    let mut enqueued = Vec::new();
    for seq in 0..10 {
        enqueued.push(producer.enqueue(payload(seq)).await?);
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = {
        let seen = Arc::clone(&seen);
        service_fn(move |task: Task| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().await.push((task.id, task.payload["seq"].clone()));
                Ok::<_, HandlerError>(())
            }
        })
    };

    Consumer::build(backend, "orders")
        .with_service(recorder)
        .with_poll_interval(Duration::from_millis(20))
        .with_stop_when_empty(true)
        .build()
        .run()
        .await?
        .wait()
        .await?;

    let seen = seen.lock().await;
    assert_eq!(seen.len(), 10);
    for (seq, (id, observed)) in seen.iter().enumerate() {
        assert_eq!(*id, enqueued[seq]);
        assert_eq!(*observed, serde_json::json!(seq));
    }

    assert_eq!(producer.size().await?, 0);
    Ok(())
}

/// A handler failure requeues the task; the second delivery succeeds.
#[tokio::test]
async fn failed_task_is_redelivered() -> anyhow::Result<()> {
    let backend = MemoryBackend::new();

    let mut producer = Producer::new(backend.clone(), "orders");
    producer.connect().await?;
    producer.enqueue(payload(0)).await?;

    let deliveries = Arc::new(AtomicU64::new(0));

    Consumer::build(backend, "orders")
        .with_service(FailOnceService::new(Arc::clone(&deliveries)))
        .with_poll_interval(Duration::from_millis(20))
        .with_stop_when_empty(true)
        .build()
        .run()
        .await?
        .wait()
        .await?;

    assert_eq!(deliveries.load(Ordering::SeqCst), 2);
    assert_eq!(producer.size().await?, 0);
    Ok(())
}

/// An empty poll returns within the configured interval, not later.
#[tokio::test]
async fn empty_poll_is_bounded() -> anyhow::Result<()> {
    let mut backend = MemoryBackend::new();
    backend.connect().await?;
    backend.declare("orders", true).await?;

    let started = std::time::Instant::now();
    let polled = backend
        .dequeue("orders", Duration::from_millis(50))
        .await?;

    assert!(polled.is_none());
    assert!(started.elapsed() < Duration::from_secs(1));
    Ok(())
}

/// A nacked task is redeliverable from any session on the same queue.
#[tokio::test]
async fn nacked_task_is_redelivered_across_sessions() -> anyhow::Result<()> {
    let shared = MemoryBackend::new();

    let mut producer = Producer::new(shared.clone(), "orders");
    producer.connect().await?;
    let id = producer.enqueue(payload(3)).await?;

    let mut first = shared.clone();
    first.connect().await?;
    let delivery = first
        .dequeue("orders", Duration::from_millis(20))
        .await?
        .expect("first delivery");
    assert_eq!(delivery.redeliveries, 0);
    first.nack(&delivery, true).await?;

    let mut second = shared;
    second.connect().await?;
    let redelivered = second
        .dequeue("orders", Duration::from_millis(20))
        .await?
        .expect("redelivery");

    assert_eq!(redelivered.redeliveries, 1);
    assert_eq!(Task::decode(&redelivered.body)?.id, id);
    Ok(())
}

/// The session never holds two tasks in flight at once.
#[tokio::test]
async fn one_task_in_flight_at_a_time() -> anyhow::Result<()> {
    let backend = MemoryBackend::new();

    let mut producer = Producer::new(backend.clone(), "orders");
    producer.connect().await?;
    for seq in 0..5 {
        producer.enqueue(payload(seq)).await?;
    }

    let in_flight = Arc::new(AtomicU64::new(0));
    let handled = Arc::new(AtomicU64::new(0));

    let gauge = {
        let in_flight = Arc::clone(&in_flight);
        let handled = Arc::clone(&handled);
        service_fn(move |_: Task| {
            let in_flight = Arc::clone(&in_flight);
            let handled = Arc::clone(&handled);
            async move {
                assert_eq!(in_flight.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                handled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        })
    };

    Consumer::build(backend, "orders")
        .with_service(gauge)
        .with_poll_interval(Duration::from_millis(20))
        .with_stop_when_empty(true)
        .build()
        .run()
        .await?
        .wait()
        .await?;

    assert_eq!(handled.load(Ordering::SeqCst), 5);
    Ok(())
}

/// Undecodable records are removed without requeue and never reach the
/// handler.
#[tokio::test]
async fn malformed_entry_is_quarantined() -> anyhow::Result<()> {
    let backend = MemoryBackend::new();

    let mut producer = Producer::new(backend.clone(), "orders");
    producer.connect().await?;
    producer.enqueue(payload(0)).await?;

    let mut raw = backend.clone();
    raw.connect().await?;
    raw.enqueue("orders", b"definitely not a task").await?;

    producer.enqueue(payload(1)).await?;

    let handled = Arc::new(AtomicU64::new(0));
    let counter = {
        let handled = Arc::clone(&handled);
        service_fn(move |_: Task| {
            let handled = Arc::clone(&handled);
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok::<_, HandlerError>(())
            }
        })
    };

    Consumer::build(backend, "orders")
        .with_service(counter)
        .with_poll_interval(Duration::from_millis(20))
        .with_stop_when_empty(true)
        .build()
        .run()
        .await?
        .wait()
        .await?;

    assert_eq!(handled.load(Ordering::SeqCst), 2);
    assert_eq!(producer.size().await?, 0);
    Ok(())
}

/// On a backend without acknowledgment, a handler failure loses the
/// task: no redelivery, and the queue no longer counts it.
#[tokio::test]
async fn lossy_backend_loses_failed_tasks() -> anyhow::Result<()> {
    let backend = NoAckBackend::new(MemoryBackend::new());

    let mut producer = Producer::new(backend.clone(), "orders");
    producer.connect().await?;
    producer.enqueue(payload(0)).await?;

    let deliveries = Arc::new(AtomicU64::new(0));
    let always_failing = {
        let deliveries = Arc::clone(&deliveries);
        service_fn(move |_: Task| {
            let deliveries = Arc::clone(&deliveries);
            async move {
                deliveries.fetch_add(1, Ordering::SeqCst);
                Err::<(), HandlerError>("synthetic handler failure".into())
            }
        })
    };

    Consumer::build(backend, "orders")
        .with_service(always_failing)
        .with_poll_interval(Duration::from_millis(20))
        .with_stop_when_empty(true)
        .build()
        .run()
        .await?
        .wait()
        .await?;

    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(producer.size().await?, 0);
    Ok(())
}

/// Transient enqueue failures are retried under the backoff policy.
#[tokio::test]
async fn enqueue_retries_transient_failures() -> anyhow::Result<()> {
    let backend = FaultInjectingBackend::new(MemoryBackend::new(), 2);
    let attempts = backend.attempts();

    let mut producer = Producer::new(backend, "orders").with_retry_policy(quick_retry());
    producer.connect().await?;
    producer.enqueue(payload(0)).await?;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(producer.size().await?, 1);
    Ok(())
}

/// Once the retry budget is spent the enqueue fails loudly, with no
/// silent drop.
#[tokio::test]
async fn enqueue_gives_up_after_budget() -> anyhow::Result<()> {
    let backend = FaultInjectingBackend::new(MemoryBackend::new(), u64::MAX);

    let mut producer = Producer::new(backend, "orders")
        .with_retry_policy(quick_retry().with_max_attempts(2));
    producer.connect().await?;

    // Two retries on top of the first try: three failed attempts.
    let result = producer.enqueue(payload(0)).await;
    assert!(matches!(
        result,
        Err(Error::EnqueueFailed { attempts: 3, .. })
    ));
    Ok(())
}

/// Re-declaring with different durability is a configuration error.
#[tokio::test]
async fn durability_conflict_is_fatal() -> anyhow::Result<()> {
    let shared = MemoryBackend::new();

    let mut durable = Producer::new(shared.clone(), "orders");
    durable.connect().await?;

    let mut conflicting = Producer::new(shared, "orders").with_durable(false);
    let result = conflicting.connect().await;

    assert!(matches!(
        result,
        Err(Error::QueueConfigConflict {
            requested: false,
            declared: true,
            ..
        })
    ));
    Ok(())
}

/// Shutdown interrupts an idle session within about one poll interval.
#[tokio::test]
async fn shutdown_interrupts_idle_session() -> anyhow::Result<()> {
    let backend = MemoryBackend::new();

    let noop = service_fn(|_: Task| async { Ok::<_, HandlerError>(()) });
    let session = Consumer::build(backend, "orders")
        .with_service(noop)
        .with_poll_interval(Duration::from_millis(25))
        .build()
        .run()
        .await?;

    let waited = tokio::time::timeout(
        Duration::from_secs(2),
        session
            .with_graceful_shutdown(tokio::time::sleep(Duration::from_millis(50)))
            .wait(),
    )
    .await;

    assert!(matches!(waited, Ok(Ok(()))));
    Ok(())
}

/// Fails the first delivery, succeeds afterwards; counts them all.
struct FailOnceService {
    deliveries: Arc<AtomicU64>,
}

impl FailOnceService {
    fn new(deliveries: Arc<AtomicU64>) -> Self {
        Self { deliveries }
    }
}

impl tower::Service<Task> for FailOnceService {
    type Response = ();
    type Error = HandlerError;
    type Future = Pin<Box<dyn Future<Output = Result<(), Self::Error>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, _task: Task) -> Self::Future {
        let deliveries = Arc::clone(&self.deliveries);
        Box::pin(async move {
            if deliveries.fetch_add(1, Ordering::SeqCst) == 0 {
                Err("synthetic handler failure".into())
            } else {
                Ok(())
            }
        })
    }
}

/// Delegates to a real backend but fails the first N enqueues with a
/// transient connection error.
#[derive(Clone)]
struct FaultInjectingBackend {
    inner: MemoryBackend,
    remaining_failures: Arc<AtomicU64>,
    attempts: Arc<AtomicU64>,
}

impl FaultInjectingBackend {
    fn new(inner: MemoryBackend, failures: u64) -> Self {
        Self {
            inner,
            remaining_failures: Arc::new(AtomicU64::new(failures)),
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }

    fn attempts(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait::async_trait]
impl Backend for FaultInjectingBackend {
    fn supports_ack(&self) -> bool {
        self.inner.supports_ack()
    }

    async fn connect(&mut self) -> wq::Result<()> {
        self.inner.connect().await
    }

    async fn declare(&mut self, queue: &str, durable: bool) -> wq::Result<()> {
        self.inner.declare(queue, durable).await
    }

    async fn enqueue(&mut self, queue: &str, body: &[u8]) -> wq::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let remaining = self.remaining_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u64::MAX {
                self.remaining_failures.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(Error::Connection {
                source: "injected connection failure".into(),
            });
        }

        self.inner.enqueue(queue, body).await
    }

    async fn dequeue(&mut self, queue: &str, wait: Duration) -> wq::Result<Option<Delivery>> {
        self.inner.dequeue(queue, wait).await
    }

    async fn ack(&mut self, delivery: &Delivery) -> wq::Result<()> {
        self.inner.ack(delivery).await
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> wq::Result<()> {
        self.inner.nack(delivery, requeue).await
    }

    async fn len(&mut self, queue: &str) -> wq::Result<u64> {
        self.inner.len(queue).await
    }

    async fn close(&mut self) -> wq::Result<()> {
        self.inner.close().await
    }
}

/// A real queue with its acknowledgment stripped away: pop-and-gone,
/// like a plain list.
#[derive(Clone)]
struct NoAckBackend {
    inner: MemoryBackend,
}

impl NoAckBackend {
    fn new(inner: MemoryBackend) -> Self {
        Self { inner }
    }
}

#[async_trait::async_trait]
impl Backend for NoAckBackend {
    fn supports_ack(&self) -> bool {
        false
    }

    async fn connect(&mut self) -> wq::Result<()> {
        self.inner.connect().await
    }

    async fn declare(&mut self, queue: &str, durable: bool) -> wq::Result<()> {
        self.inner.declare(queue, durable).await
    }

    async fn enqueue(&mut self, queue: &str, body: &[u8]) -> wq::Result<()> {
        self.inner.enqueue(queue, body).await
    }

    async fn dequeue(&mut self, queue: &str, wait: Duration) -> wq::Result<Option<Delivery>> {
        self.inner.dequeue(queue, wait).await
    }

    async fn ack(&mut self, _delivery: &Delivery) -> wq::Result<()> {
        Ok(())
    }

    async fn nack(&mut self, _delivery: &Delivery, _requeue: bool) -> wq::Result<()> {
        Ok(())
    }

    async fn len(&mut self, queue: &str) -> wq::Result<u64> {
        self.inner.len(queue).await
    }

    async fn close(&mut self) -> wq::Result<()> {
        self.inner.close().await
    }
}
