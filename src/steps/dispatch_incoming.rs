//! Dispatch step: hands the logical message to its handlers
//!
//! Resolves handlers for the runtime type and its declared ancestors,
//! invokes them sequentially within the current transaction context, then
//! lets the saga engine run the saga handlers. A message nobody handles is
//! a failure (tracked and eventually dead-lettered), not a silent drop.

use crate::bus::{Bus, BusLink};
use crate::dispatch::MessageContext;
use crate::errors::{BusError, BusResult};
use crate::pipeline::{Next, Step, StepContext};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::trace;

/// Terminal step of the incoming pipeline
pub struct DispatchStep {
    bus: Arc<BusLink>,
}

impl DispatchStep {
    /// Step name for pipeline surgery
    pub const NAME: &'static str = "dispatch";

    pub(crate) fn new(bus: Arc<BusLink>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Step for DispatchStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()> {
        let logical = ctx
            .logical_message
            .clone()
            .ok_or_else(|| BusError::configuration("dispatch step needs a logical message"))?;
        let inner = self.bus.get()?;

        let message_ctx = MessageContext::new(
            Bus::from_inner(Arc::clone(&inner)),
            logical.headers.clone(),
            Arc::clone(ctx.transaction()),
        );

        let chain = inner.registry.resolve_chain(Arc::clone(&logical.body));
        let mut invoked = 0;

        for (type_name, message) in &chain {
            for invoke in inner.registry.handler_invokers(type_name) {
                trace!(message_type = %type_name, "invoking handler");
                invoke(Arc::clone(message), message_ctx.clone())
                    .await
                    .map_err(BusError::handler)?;
                invoked += 1;
            }
        }

        invoked += inner
            .saga_engine
            .process(&inner.registry, &chain, &message_ctx, &inner.cancel)
            .await?;

        if invoked == 0 {
            return Err(BusError::handler(anyhow::anyhow!(
                "no handlers registered for message type {}",
                logical.message_type()
            )));
        }

        next.run(ctx).await
    }
}
