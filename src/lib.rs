//! # **W**ork **Q**ueue.
//!
//! A durable, at-least-once work-queue client for Rust.  The model is
//! the classic producer/consumer pattern over a named queue:
//!
//! 1. A producer serializes task records and pushes them into a named,
//!    durable queue owned by a backend (a broker-style store, or a
//!    key-value list used as a queue);
//! 2. A consumer pulls one task at a time, hands it to a handler, and
//!    acknowledges it on success or returns it to the queue on failure.
//!
//! The two halves share a task codec, a backend capability trait, and a
//! retry/backoff policy for transient connection failures.  Everything
//! about storage and delivery is delegated to the backend; the client
//! holds nothing but an open connection and, while a handler runs, the
//! delivery handle for exactly one task.
//!
//! ## Delivery guarantees
//!
//! Backends come in two families, and the difference matters more than
//! the shared interface suggests:
//!
//! - **Ack-capable** backends ([`redis::StreamBackend`],
//!   [`memory::MemoryBackend`]) keep a delivered task on the server
//!   until it is explicitly acknowledged.  If the handler fails, or the
//!   consumer dies mid-processing, the task is redelivered.  This is
//!   at-least-once delivery: duplicates are possible, and handlers must
//!   tolerate them.
//! - **Non-ack-capable** backends ([`redis::ListBackend`]) remove a
//!   task the moment it is popped.  A handler failure - or a crash
//!   between pop and completion - loses the task, and the consumer can
//!   do nothing but report it loudly.  Choose this family only when
//!   occasional loss is acceptable.
//!
//! The [`Backend::supports_ack`] flag exposes the family, and the
//! consumer loop branches on it rather than pretending the guarantees
//! are equal.
//!
//! ## Usage
//!
//! The producer is gated behind the `producer` feature and the consumer
//! behind the `consumer` feature, so either role can be compiled on its
//! own.  The Redis-backed adapters live behind the `redis` feature.
//! All three are default features.
//!
//! Handlers are [`tower::Service`]s taking a [`Task`] and returning
//! `Result<(), HandlerError>`; [`tower::service_fn`] adapts a plain
//! async closure:
//!
//! ```rust,no_run
//! use wq::{Consumer, HandlerError, MemoryBackend, Producer, Task};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let backend = MemoryBackend::new();
//!
//!     let mut producer = Producer::new(backend.clone(), "orders");
//!     producer.connect().await?;
//!     let payload = serde_json::Map::from_iter([(
//!         "order".to_owned(),
//!         serde_json::json!(42),
//!     )]);
//!     producer.enqueue(payload).await?;
//!
//!     let handler = tower::service_fn(|task: Task| async move {
//!         tracing::info!(id = %task.id, "working");
//!         Ok::<_, HandlerError>(())
//!     });
//!
//!     Consumer::build(backend, "orders")
//!         .with_service(handler)
//!         .with_stop_when_empty(true)
//!         .build()
//!         .run()
//!         .await?
//!         .wait()
//!         .await?;
//!
//!     Ok(())
//! }
//! ```

pub mod backend;
mod error;
pub mod memory;
pub mod retry;
mod task;

#[cfg(feature = "consumer")]
mod consumer;
#[cfg(feature = "producer")]
mod producer;

#[cfg(feature = "redis")]
pub mod redis;

pub use self::backend::{Backend, Delivery, DeliveryTag};
pub use self::error::{Error, Result};
pub use self::memory::MemoryBackend;
pub use self::retry::RetryPolicy;
pub use self::task::Task;

#[cfg(feature = "consumer")]
pub use self::consumer::{Consumer, ConsumerBuilder, HandlerError, Session};
#[cfg(feature = "producer")]
pub use self::producer::Producer;
