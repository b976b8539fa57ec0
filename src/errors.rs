//! Error types for the bus core
//!
//! One structured enum per boundary: [`TransportError`] for the queue
//! driver, [`SagaStorageError`] for saga persistence, and [`BusError`] as
//! the error surfaced by the pipeline and the public bus API.
//!
//! The pipeline never swallows an error silently: every failure is either
//! captured by the retry step for tracking or rethrown out of a public API.
//! Dispose-phase callback errors are logged, never thrown.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by a transport (queue driver) implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// The destination queue does not exist
    #[error("queue not found: {address}")]
    QueueNotFound {
        /// Address that could not be resolved
        address: String,
    },

    /// Sending a message failed
    #[error("send to {address} failed: {source}")]
    Send {
        /// Destination address of the failed send
        address: String,
        /// Underlying driver error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Receiving from the input queue failed
    #[error("receive failed: {source}")]
    Receive {
        /// Underlying driver error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The transport has been shut down
    #[error("transport is closed")]
    Closed,
}

/// Errors raised by saga persistence implementations
#[derive(Debug, Error)]
pub enum SagaStorageError {
    /// Optimistic concurrency check failed: the stored revision no longer
    /// matches the revision that was loaded
    #[error("saga {id} revision mismatch: expected {expected}, found {actual}")]
    RevisionMismatch {
        /// Saga id whose update conflicted
        id: Uuid,
        /// Revision the caller loaded
        expected: u64,
        /// Revision currently persisted
        actual: u64,
    },

    /// A correlation property value is already owned by another saga
    /// instance of the same type
    #[error("correlation conflict on {saga_type}.{property} = {value}")]
    CorrelationConflict {
        /// Saga data type whose uniqueness constraint was violated
        saga_type: String,
        /// Correlation property name
        property: String,
        /// Conflicting value
        value: String,
    },

    /// The saga row to update or delete no longer exists
    #[error("saga {id} not found")]
    NotFound {
        /// Missing saga id
        id: Uuid,
    },

    /// Backend failure (connection, serialization of stored state, ...)
    #[error("saga storage failure: {source}")]
    Backend {
        /// Underlying storage error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// The error surfaced by the pipeline and the public bus API
#[derive(Debug, Error)]
pub enum BusError {
    /// A transport operation failed; the current context is aborted and
    /// the transport redelivers
    #[error("transport failure: {source}")]
    Transport {
        /// The transport error
        #[from]
        source: TransportError,
    },

    /// A message handler raised an error. Recorded by the error tracker;
    /// the message is redelivered until poison, then dead-lettered.
    #[error("handler failure: {source:#}")]
    Handler {
        /// The handler's error
        #[source]
        source: anyhow::Error,
    },

    /// Optimistic saga revision check failed; treated as a handler failure
    /// and retried
    #[error("saga concurrency conflict on {saga_type} {id} at revision {loaded_revision}")]
    SagaConcurrencyConflict {
        /// Saga data type
        saga_type: String,
        /// Saga id
        id: Uuid,
        /// Revision that was loaded before the conflicting update
        loaded_revision: u64,
    },

    /// Correlation property uniqueness violated; treated as a handler
    /// failure and retried
    #[error("saga correlation conflict on {saga_type}.{property} = {value}")]
    SagaCorrelationConflict {
        /// Saga data type
        saga_type: String,
        /// Correlation property name
        property: String,
        /// Conflicting value
        value: String,
    },

    /// Saga persistence failed for a reason other than the two conflict
    /// classes above
    #[error("saga storage error: {source}")]
    SagaStorage {
        /// The storage error
        #[from]
        source: SagaStorageError,
    },

    /// No destination mapping exists for the message type. Fails the
    /// originating send immediately; never retried.
    #[error("no route configured for message type {message_type}")]
    Routing {
        /// The unroutable logical message type
        message_type: String,
    },

    /// Message body could not be serialized or deserialized
    #[error("serialization failure for {message_type}: {source}")]
    Serialization {
        /// Logical message type involved
        message_type: String,
        /// Underlying serde error
        #[source]
        source: serde_json::Error,
    },

    /// The `type` header names a message type this endpoint has no decoder
    /// for
    #[error("unknown message type {message_type}")]
    UnknownMessageType {
        /// The unrecognized type name
        message_type: String,
    },

    /// A required header is missing from the transport message
    #[error("required header {name} is missing")]
    MissingHeader {
        /// Canonical header name
        name: &'static str,
    },

    /// An operation was attempted in a transaction context phase that no
    /// longer permits it
    #[error("transaction context is {state}; {operation} is not allowed")]
    IllegalContextState {
        /// State the context was found in
        state: &'static str,
        /// Operation that was rejected
        operation: &'static str,
    },

    /// A transaction-phase callback failed
    #[error("{phase} callback failed: {source:#}")]
    Callback {
        /// Phase whose callback failed
        phase: &'static str,
        /// The callback's error
        #[source]
        source: anyhow::Error,
    },

    /// A context item was requested with a type that does not match the
    /// stored value
    #[error("context item {key} holds a different type")]
    ContextItemType {
        /// Item key
        key: String,
    },

    /// Publishing reached subscribers but every delivery failed
    #[error("publish to topic {topic} failed for all {subscriber_count} subscribers")]
    PublishFailed {
        /// Topic that was published
        topic: String,
        /// Number of subscribers that were attempted
        subscriber_count: usize,
    },

    /// Generic storage failure from a pluggable port (subscriptions,
    /// timeouts)
    #[error("{context} storage failure: {source}")]
    Storage {
        /// Which port failed
        context: &'static str,
        /// Underlying storage error
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Raised at bus construction when wiring is incomplete or
    /// inconsistent; prevents startup
    #[error("configuration error: {message}")]
    Configuration {
        /// What is wrong with the configuration
        message: String,
    },
}

impl BusError {
    /// Wraps an arbitrary handler error
    pub fn handler(source: anyhow::Error) -> Self {
        Self::Handler { source }
    }

    /// Shorthand for a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// True when this error should be recorded by the error tracker and
    /// retried rather than surfaced to the caller of a send-side API
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::Routing { .. } | Self::Configuration { .. } | Self::IllegalContextState { .. }
        )
    }
}

/// Result alias used throughout the crate
pub type BusResult<T> = Result<T, BusError>;

/// Renders an error and its source chain on one line, `: `-separated.
///
/// Used for the `error-details` header and the error tracker, where the
/// full chain matters but multi-line output does not.
pub fn render_error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_chain_is_rendered_flat() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let err = TransportError::Send {
            address: "orders".to_string(),
            source: Box::new(io),
        };
        let rendered = render_error_chain(&err);
        assert!(rendered.contains("send to orders failed"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn routing_errors_are_not_retryable() {
        let err = BusError::Routing {
            message_type: "Hello".to_string(),
        };
        assert!(!err.is_retryable());
        let err = BusError::handler(anyhow::anyhow!("boom"));
        assert!(err.is_retryable());
    }
}
