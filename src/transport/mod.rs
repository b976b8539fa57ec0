//! Transport port: the queue-level boundary of the bus
//!
//! A transport moves [`TransportMessage`]s between logical queues inside a
//! [`TransactionContext`]: sends take effect on commit, and a received
//! message is returned to its queue on abort. The core ships an in-memory
//! implementation ([`inmem::InMemTransport`]); real drivers live in their
//! own crates behind this trait.

pub mod headers;
pub mod inmem;

use crate::domain_types::QueueAddress;
use crate::errors::TransportError;
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use bytes::Bytes;
use headers::Headers;
use tokio_util::sync::CancellationToken;

/// A message as it travels on the wire: ordered string headers plus an
/// opaque byte body. Immutable once it leaves the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    /// Wire headers; see [`headers`] for the canonical registry
    pub headers: Headers,
    /// Opaque serialized body
    pub body: Bytes,
}

impl TransportMessage {
    /// Creates a message from headers and body
    pub fn new(headers: Headers, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// The `message-id` header, when present
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID)
    }

    /// The logical `type` header, when present
    pub fn message_type(&self) -> Option<&str> {
        self.headers.get(headers::TYPE)
    }
}

/// Abstract send/receive over logical queues within a transaction context
#[async_trait]
pub trait Transport: Send + Sync {
    /// The input queue this transport receives from. `None` for a one-way
    /// client transport that can only send.
    fn address(&self) -> Option<&QueueAddress>;

    /// Sends a message to the destination queue. The send is enlisted in
    /// the supplied context and must only become visible when the context
    /// commits.
    async fn send(
        &self,
        destination: &QueueAddress,
        message: TransportMessage,
        ctx: &TransactionContext,
    ) -> Result<(), TransportError>;

    /// Receives the next message from the input queue, or `None` when the
    /// queue is empty. The received message must be returned to the queue
    /// if the context aborts.
    async fn receive(
        &self,
        ctx: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError>;

    /// Creates the queue behind the given address if the transport manages
    /// queue lifetimes
    async fn create_queue(&self, address: &QueueAddress) -> Result<(), TransportError>;

    /// True when the transport natively delivers messages carrying a
    /// future `deferred-until` at their due time. The deferral steps are
    /// removed from the pipeline for such transports.
    fn supports_deferred_delivery(&self) -> bool {
        false
    }
}
