//! Deferred-messages step: the client side of deferral
//!
//! When this endpoint defers to an external timeout manager, messages
//! carrying `deferred-until` are forwarded there as-is (headers intact)
//! and local delivery is aborted by short-circuiting the chain.

use crate::domain_types::QueueAddress;
use crate::errors::{BusError, BusResult};
use crate::pipeline::{Next, Step, StepContext};
use crate::transport::headers;
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Forwards deferred messages to the configured timeout manager endpoint
pub struct DeferredMessagesStep {
    timeouts_address: Option<QueueAddress>,
    transport: Arc<dyn Transport>,
}

impl DeferredMessagesStep {
    /// Step name for pipeline surgery
    pub const NAME: &'static str = "deferred-messages";

    pub(crate) fn new(timeouts_address: Option<QueueAddress>, transport: Arc<dyn Transport>) -> Self {
        Self {
            timeouts_address,
            transport,
        }
    }
}

#[async_trait]
impl Step for DeferredMessagesStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()> {
        let deferred = ctx
            .transport_message
            .as_ref()
            .is_some_and(|m| m.headers.contains(headers::DEFERRED_UNTIL));
        if !deferred {
            return next.run(ctx).await;
        }

        // The handle-deferred step consumes deferred messages on endpoints
        // hosting a store; reaching this point without a forwarding target
        // means deferral is not wired up at all.
        let Some(timeouts_address) = &self.timeouts_address else {
            return Err(BusError::configuration(
                "received a deferred message but no timeout manager is configured",
            ));
        };

        let mut message = ctx
            .transport_message
            .clone()
            .ok_or_else(|| BusError::configuration("deferred-messages step needs a transport message"))?;

        if !message.headers.contains(headers::DEFERRED_RECIPIENT) {
            let recipient = message
                .headers
                .get(headers::RETURN_ADDRESS)
                .map(str::to_string)
                .ok_or(BusError::MissingHeader {
                    name: headers::DEFERRED_RECIPIENT,
                })?;
            message.headers.insert(headers::DEFERRED_RECIPIENT, recipient);
        }

        debug!(timeouts = %timeouts_address, "forwarding deferred message to timeout manager");
        self.transport
            .send(timeouts_address, message, ctx.transaction())
            .await?;

        // Short-circuit: the message is consumed locally
        Ok(())
    }
}
