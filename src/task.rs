use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work.
///
/// Tasks are what producers enqueue and handlers receive.  The
/// identity (`id`) and creation time are assigned once, at enqueue
/// time, and never change; the payload is an open string-keyed map so
/// callers can ship whatever business data they need without a schema.
///
/// On the wire a task is a self-describing JSON object with `id`,
/// `payload`, and `created_at` (ISO-8601).  Fields this version does
/// not know about are kept in `extra` and written back out on encode,
/// so consumers and producers of different versions can share a queue
/// without negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier, assigned by the producer.
    pub id: Uuid,

    /// The business data carried by this task.
    pub payload: serde_json::Map<String, serde_json::Value>,

    /// When the task was enqueued.
    pub created_at: DateTime<Utc>,

    /// Wire fields not known to this version, preserved round-trip.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Task {
    /// Creates a task with a fresh id and the current time.
    #[must_use]
    pub fn new(payload: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            created_at: Utc::now(),
            extra: serde_json::Map::new(),
        }
    }

    /// Encodes this task into its wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|source| Error::Encode {
            id: self.id,
            source,
        })
    }

    /// Decodes a task from its wire form.
    ///
    /// Fails with [`Error::MalformedTask`] if the bytes are not valid
    /// JSON or the record lacks any of `id`, `payload`, `created_at`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|source| Error::MalformedTask { source })
    }
}
