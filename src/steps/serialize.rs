//! Serialize step: collapses the logical message to wire form
//!
//! Messages that enter the outgoing pipeline already in wire form
//! (dead-letter copies, due deferred envelopes) pass through untouched.

use crate::errors::{BusError, BusResult};
use crate::pipeline::{Next, Step, StepContext};
use crate::serializer::Serializer;
use async_trait::async_trait;
use std::sync::Arc;

/// Produces the [`crate::transport::TransportMessage`] for the send step
pub struct SerializeStep {
    serializer: Arc<dyn Serializer>,
}

impl SerializeStep {
    /// Step name for pipeline surgery
    pub const NAME: &'static str = "serialize";

    pub(crate) fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl Step for SerializeStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()> {
        if ctx.transport_message.is_none() {
            let logical = ctx
                .logical_message
                .as_ref()
                .ok_or_else(|| BusError::configuration("serialize step needs a logical message"))?;
            ctx.transport_message = Some(self.serializer.serialize(logical)?);
        }
        next.run(ctx).await
    }
}
