//! In-memory transport
//!
//! A process-local transport over a shared [`InMemNetwork`]. Useful for
//! tests and for wiring several endpoints together inside one process: every
//! bus handed a clone of the same network sees the same queues.
//!
//! Delivery semantics match the transactional contract: sends become
//! visible on commit of the supplied context, and a received message goes
//! back to the front of its queue when the context aborts.

use super::{Transport, TransportMessage};
use crate::domain_types::QueueAddress;
use crate::errors::TransportError;
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// A set of named in-memory queues shared between transports
#[derive(Debug, Clone, Default)]
pub struct InMemNetwork {
    queues: Arc<DashMap<QueueAddress, Arc<Mutex<VecDeque<TransportMessage>>>>>,
}

impl InMemNetwork {
    /// Creates an empty network
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, address: &QueueAddress) -> Arc<Mutex<VecDeque<TransportMessage>>> {
        self.queues
            .entry(address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone()
    }

    /// Ensures a queue exists
    pub fn create_queue(&self, address: &QueueAddress) {
        let _ = self.queue(address);
    }

    /// Delivers a message to the back of a queue, creating the queue on
    /// first use
    pub fn deliver(&self, destination: &QueueAddress, message: TransportMessage) {
        trace!(destination = %destination, "delivering message");
        self.queue(destination)
            .lock()
            .expect("queue poisoned")
            .push_back(message);
    }

    /// Takes the next message off the front of a queue
    pub fn take_next(&self, address: &QueueAddress) -> Option<TransportMessage> {
        self.queue(address).lock().expect("queue poisoned").pop_front()
    }

    /// Returns a message to the front of a queue (abort path)
    pub fn return_message(&self, address: &QueueAddress, message: TransportMessage) {
        self.queue(address)
            .lock()
            .expect("queue poisoned")
            .push_front(message);
    }

    /// Number of messages currently queued at an address
    pub fn message_count(&self, address: &QueueAddress) -> usize {
        self.queue(address).lock().expect("queue poisoned").len()
    }

    /// Snapshot of the messages queued at an address, front first
    pub fn messages_in(&self, address: &QueueAddress) -> Vec<TransportMessage> {
        self.queue(address)
            .lock()
            .expect("queue poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

/// Transport over an [`InMemNetwork`]
#[derive(Debug, Clone)]
pub struct InMemTransport {
    network: InMemNetwork,
    input: Option<QueueAddress>,
}

impl InMemTransport {
    /// Creates a transport receiving from `input` on the given network
    pub fn new(network: InMemNetwork, input: QueueAddress) -> Self {
        network.create_queue(&input);
        Self {
            network,
            input: Some(input),
        }
    }

    /// Creates a send-only transport for a one-way client
    pub fn one_way(network: InMemNetwork) -> Self {
        Self {
            network,
            input: None,
        }
    }

    /// The network this transport is attached to
    pub fn network(&self) -> &InMemNetwork {
        &self.network
    }
}

#[async_trait]
impl Transport for InMemTransport {
    fn address(&self) -> Option<&QueueAddress> {
        self.input.as_ref()
    }

    async fn send(
        &self,
        destination: &QueueAddress,
        message: TransportMessage,
        ctx: &TransactionContext,
    ) -> Result<(), TransportError> {
        let network = self.network.clone();
        let address = destination.as_str().to_string();
        let destination = destination.clone();
        ctx.on_commit(move || async move {
            network.deliver(&destination, message);
            Ok(())
        })
        .map_err(|error| TransportError::Send {
            address,
            source: Box::new(error),
        })
    }

    async fn receive(
        &self,
        ctx: &TransactionContext,
        _cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, TransportError> {
        let input = self.input.clone().ok_or(TransportError::Closed)?;

        let Some(message) = self.network.take_next(&input) else {
            return Ok(None);
        };

        let network = self.network.clone();
        let returned = message.clone();
        ctx.on_aborted(move || async move {
            network.return_message(&input, returned);
            Ok(())
        })
        .map_err(|error| TransportError::Receive {
            source: Box::new(error),
        })?;

        Ok(Some(message))
    }

    async fn create_queue(&self, address: &QueueAddress) -> Result<(), TransportError> {
        self.network.create_queue(address);
        Ok(())
    }
}
