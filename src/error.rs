/// Result type alias for queue operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

type BoxSource = Box<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the work-queue client.
///
/// The variants split into two classes.  *Transient* errors (lost or
/// refused connections) are absorbed by the retry policy and only reach
/// the caller once the attempt budget is spent, wrapped in
/// [`Error::ConnectFailed`] or [`Error::EnqueueFailed`].  Everything
/// else is permanent and propagates immediately: malformed task data is
/// a data bug, a durability conflict is a configuration bug, and
/// neither gets better by retrying.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The backend connection failed or was lost.  Transient; retried
    /// by the shared backoff policy.
    #[error("failed to reach the queue backend: {source}")]
    Connection {
        #[source]
        source: BoxSource,
    },

    /// Connecting to the backend kept failing until the retry budget
    /// was exhausted.
    #[error("giving up connecting to the queue backend after {attempts} attempts: {source}")]
    ConnectFailed {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A dequeued byte sequence was not a valid task record.
    ///
    /// This is a data error, never a connection error; it is not
    /// retried, and the offending record never reaches a handler.
    #[error("could not decode task record: {source}")]
    MalformedTask {
        #[source]
        source: serde_json::Error,
    },

    /// A task failed to serialize on the enqueue path.
    #[error("could not encode task {id}: {source}")]
    Encode {
        id: uuid::Uuid,
        #[source]
        source: serde_json::Error,
    },

    /// The queue was already declared with different durability.
    #[error(
        "queue {queue} is declared with durable={declared}, \
         but durable={requested} was requested"
    )]
    QueueConfigConflict {
        queue: String,
        requested: bool,
        declared: bool,
    },

    /// Enqueueing kept failing until the retry budget was exhausted.
    ///
    /// The task was not stored anywhere; the caller decides whether to
    /// drop it or persist it elsewhere.
    #[error("giving up enqueue into {queue} after {attempts} attempts: {source}")]
    EnqueueFailed {
        queue: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// A backend operation failed for a non-connection reason.
    #[error("queue backend operation failed: {source}")]
    Backend {
        #[source]
        source: BoxSource,
    },
}

impl Error {
    /// Builds a [`Error::Backend`] from a plain message.
    pub(crate) fn backend(message: impl Into<String>) -> Self {
        Error::Backend {
            source: message.into().into(),
        }
    }

    /// Builds a [`Error::Connection`] from a plain message.
    pub(crate) fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            source: message.into().into(),
        }
    }

    /// Whether retrying the failed operation can help.
    ///
    /// Only connection-level failures qualify; the retry policy treats
    /// everything else as permanent.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }
}
