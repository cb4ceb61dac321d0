//! # Redis-backed queue adapters.
//!
//! Two adapters share this module and the same server, but offer very
//! different guarantees; pick by what a lost task costs you.
//!
//! ## [`StreamBackend`] - ack-capable
//!
//! Backs the queue with a Redis stream and a consumer group.  A
//! delivered entry moves into the group's pending list and stays on
//! the server until the session acknowledges it; a nacked entry is
//! parked on a reserved consumer name and handed out again on a later
//! dequeue, and entries held by a session that died are stolen back
//! once they have been idle past the configured horizon.  This is the
//! broker-style, redeliverable-until-acked contract: at-least-once,
//! duplicates possible.
//!
//! Two settings deserve attention.  The *idle timeout* is the
//! redelivery horizon: a handler that runs longer than it risks having
//! its task stolen and processed twice, so keep handlers comfortably
//! inside it.  The *prefetch* is the read batch hint; entries fetched
//! beyond the one in flight wait in a session-local buffer (and in the
//! session's pending list, where the idle clock ticks), so anything
//! above the default of one trades redelivery punctuality for fewer
//! round-trips.
//!
//! ## [`ListBackend`] - non-ack-capable
//!
//! Backs the queue with a plain list: push on one end, pop from the
//! other, FIFO end-to-end.  There is no acknowledgment of any kind -
//! the pop removes the task, full stop.  A handler failure after the
//! pop, a crash mid-processing, a cancelled session with a task in
//! hand: all of these lose the task irrecoverably, and the consumer
//! can only report it.  `ack` and `nack` are no-ops here so the shared
//! machinery runs unchanged, but no-op is exactly what they are.
//!
//! ## Sessions and connections
//!
//! Both adapters are built from a [`redis::Client`] and open a single
//! multiplexed connection on `connect`; the value is one session's
//! exclusive handle, per the [`Backend`][crate::Backend] contract.
//! Blocking reads (`BRPOP`, `XREADGROUP BLOCK`) hold that connection
//! for up to one poll interval, which is fine precisely because the
//! connection is not shared.

mod list;
mod stream;

pub use self::list::ListBackend;
pub use self::stream::StreamBackend;

use crate::error::{Error, Result};

/// Maps a client error into the crate taxonomy: connection-level
/// failures are transient and feed the retry policy, everything else
/// is permanent.
pub(crate) fn classify(error: ::redis::RedisError) -> Error {
    let transient = error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.kind() == ::redis::ErrorKind::TryAgain;

    if transient {
        Error::Connection {
            source: Box::new(error),
        }
    } else {
        Error::Backend {
            source: Box::new(error),
        }
    }
}

/// Key of the small metadata hash recording a queue's declared
/// durability.  Neither lists nor streams carry such an attribute, so
/// the declare-conflict rule is enforced through this side record.
pub(crate) fn opts_key(queue: &str) -> String {
    format!("{queue}:opts")
}

/// Records durability on first declare and checks it on every later
/// one.
pub(crate) async fn check_durability(
    connection: &mut ::redis::aio::MultiplexedConnection,
    queue: &str,
    durable: bool,
) -> Result<()> {
    use ::redis::AsyncCommands as _;

    let key = opts_key(queue);
    let _: bool = connection
        .hset_nx(&key, "durable", i32::from(durable))
        .await
        .map_err(classify)?;
    let declared: Option<i64> = connection.hget(&key, "durable").await.map_err(classify)?;
    let declared = declared.map_or(durable, |value| value != 0);

    if declared == durable {
        Ok(())
    } else {
        Err(Error::QueueConfigConflict {
            queue: queue.to_owned(),
            requested: durable,
            declared,
        })
    }
}

/// Splits a delivery tag back into queue key and server-side entry id.
pub(crate) fn split_tag(tag: &crate::DeliveryTag) -> Result<(&str, &str)> {
    tag.as_ref()
        .rsplit_once('/')
        .ok_or_else(|| Error::backend(format!("malformed delivery tag {tag}")))
}
