//! Send step: terminal step of the outgoing pipeline
//!
//! Hands the wire message to the transport for every destination. For a
//! publish (`intent=pub-sub`) individual subscriber failures are logged
//! and only an all-subscribers failure aborts; point-to-point sends
//! propagate the first failure.

use crate::errors::{BusError, BusResult};
use crate::pipeline::{Next, Step, StepContext};
use crate::transport::headers;
use crate::transport::Transport;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{trace, warn};

/// Sends the serialized message to its destinations
pub struct SendStep {
    transport: Arc<dyn Transport>,
}

impl SendStep {
    /// Step name for pipeline surgery
    pub const NAME: &'static str = "send";

    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Step for SendStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()> {
        let message = ctx
            .transport_message
            .clone()
            .ok_or_else(|| BusError::configuration("send step needs a serialized message"))?;
        if ctx.destinations.is_empty() {
            return Err(BusError::configuration("send step has no destinations"));
        }

        let publishing = message.headers.get(headers::INTENT) == Some(headers::INTENT_PUB_SUB);
        let mut failures = 0;

        for destination in &ctx.destinations {
            trace!(destination = %destination, "sending message");
            match self
                .transport
                .send(destination, message.clone(), ctx.transaction())
                .await
            {
                Ok(()) => {}
                Err(error) if publishing => {
                    warn!(destination = %destination, %error, "delivery to subscriber failed");
                    failures += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }

        if publishing && failures == ctx.destinations.len() {
            let topic = message
                .headers
                .get(headers::TYPE)
                .unwrap_or("<unknown>")
                .to_string();
            return Err(BusError::PublishFailed {
                topic,
                subscriber_count: ctx.destinations.len(),
            });
        }

        next.run(ctx).await
    }
}
