//! Staged middleware pipeline
//!
//! The bus runs every received message through an ordered chain of
//! incoming steps, and every outgoing message through a chain of outgoing
//! steps. A step does its work and passes a [`StepContext`] on by running
//! `next`; omitting `next` short-circuits the chain, which is a valid
//! policy (poison handling and deferral both consume messages this way).
//!
//! `next` is consumed by value, so a step cannot call it twice.

mod invoker;
mod pipeline;

pub use invoker::PipelineInvoker;
pub use pipeline::{Pipeline, StepPosition};

use crate::domain_types::QueueAddress;
use crate::errors::BusResult;
use crate::serializer::LogicalMessage;
use crate::transaction::TransactionContext;
use crate::transport::TransportMessage;
use async_trait::async_trait;
use std::sync::Arc;

/// The state a message carries through one pipeline invocation
#[derive(Debug)]
pub struct StepContext {
    transaction: Arc<TransactionContext>,
    /// The wire form of the message; present from the start on receive,
    /// produced by the serialize step on send
    pub transport_message: Option<TransportMessage>,
    /// The decoded form; produced by the deserialize step on receive,
    /// present from the start on send
    pub logical_message: Option<LogicalMessage>,
    /// Destination queues for an outgoing invocation (several for a
    /// publish, exactly one for a send)
    pub destinations: Vec<QueueAddress>,
}

impl StepContext {
    /// Context for an incoming pipeline run over a received message
    pub fn incoming(transaction: Arc<TransactionContext>, message: TransportMessage) -> Self {
        Self {
            transaction,
            transport_message: Some(message),
            logical_message: None,
            destinations: Vec::new(),
        }
    }

    /// Context for an outgoing pipeline run over a logical message
    pub fn outgoing(
        transaction: Arc<TransactionContext>,
        message: LogicalMessage,
        destinations: Vec<QueueAddress>,
    ) -> Self {
        Self {
            transaction,
            transport_message: None,
            logical_message: Some(message),
            destinations,
        }
    }

    /// Context for an outgoing pipeline run over a message that is already
    /// in wire form (dead-lettering, forwarding). The serialize step
    /// passes such messages through untouched.
    pub fn outgoing_raw(
        transaction: Arc<TransactionContext>,
        message: TransportMessage,
        destinations: Vec<QueueAddress>,
    ) -> Self {
        Self {
            transaction,
            transport_message: Some(message),
            logical_message: None,
            destinations,
        }
    }

    /// The transaction context this invocation runs inside
    pub fn transaction(&self) -> &Arc<TransactionContext> {
        &self.transaction
    }
}

/// One stage of the pipeline
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used for `Before`/`After` insertion and removal
    fn name(&self) -> &'static str;

    /// Processes the context, passing it on via `next` (at most once)
    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()>;
}

/// Continuation handed to a step; consumed by `run`
pub struct Next<'a> {
    steps: &'a [Arc<dyn Step>],
}

impl<'a> Next<'a> {
    pub(crate) fn new(steps: &'a [Arc<dyn Step>]) -> Self {
        Self { steps }
    }

    /// Invokes the rest of the chain. A no-op at the tail.
    pub async fn run(self, ctx: &mut StepContext) -> BusResult<()> {
        match self.steps.split_first() {
            Some((step, rest)) => step.process(ctx, Next::new(rest)).await,
            None => Ok(()),
        }
    }
}
