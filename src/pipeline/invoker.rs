//! Pipeline invoker
//!
//! Materializes the step chains once and threads contexts through them.

use super::{Next, Pipeline, Step, StepContext};
use crate::errors::BusResult;
use std::sync::Arc;

/// Threads step contexts through the incoming and outgoing chains.
///
/// The chains are materialized once per pipeline instance and reused for
/// every invocation; the pipeline is effectively immutable after bus start.
#[derive(Clone)]
pub struct PipelineInvoker {
    incoming: Arc<[Arc<dyn Step>]>,
    outgoing: Arc<[Arc<dyn Step>]>,
}

impl PipelineInvoker {
    /// Materializes the chains of the given pipeline
    pub fn new(pipeline: Pipeline) -> Self {
        let (incoming, outgoing) = pipeline.into_chains();
        Self { incoming, outgoing }
    }

    /// Runs the incoming chain over a received message
    pub async fn invoke_incoming(&self, ctx: &mut StepContext) -> BusResult<()> {
        Next::new(&self.incoming).run(ctx).await
    }

    /// Runs the outgoing chain over a message being sent
    pub async fn invoke_outgoing(&self, ctx: &mut StepContext) -> BusResult<()> {
        Next::new(&self.outgoing).run(ctx).await
    }
}

impl std::fmt::Debug for PipelineInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineInvoker")
            .field("incoming_steps", &self.incoming.len())
            .field("outgoing_steps", &self.outgoing.len())
            .finish()
    }
}
