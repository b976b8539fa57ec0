//! Retry step: first in the incoming pipeline
//!
//! Catches every downstream failure, records it against the message id,
//! and decides between rollback (the transport redelivers) and
//! dead-lettering (the message goes to the error queue and the original is
//! acknowledged).

use crate::bus::BusLink;
use crate::domain_types::QueueAddress;
use crate::error_tracker::ErrorTracker;
use crate::errors::BusResult;
use crate::pipeline::{Next, Step, StepContext};
use crate::transport::headers;
use crate::transport::TransportMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

/// Tracks failures per message id and routes poison messages to the error
/// queue
pub struct RetryStep {
    tracker: Arc<ErrorTracker>,
    error_queue: QueueAddress,
    bus: Arc<BusLink>,
}

impl RetryStep {
    /// Step name for pipeline surgery
    pub const NAME: &'static str = "retry";

    pub(crate) fn new(tracker: Arc<ErrorTracker>, error_queue: QueueAddress, bus: Arc<BusLink>) -> Self {
        Self {
            tracker,
            error_queue,
            bus,
        }
    }

    /// Forwards the message to the error queue through the outgoing
    /// pipeline, enlisted in the same transaction context so the copy and
    /// the ack of the original commit together.
    async fn dead_letter(
        &self,
        ctx: &StepContext,
        mut message: TransportMessage,
        details: &str,
    ) -> BusResult<()> {
        message.headers.insert(headers::ERROR_DETAILS, details);
        let inner = self.bus.get()?;
        if let Some(own) = inner.transport.address() {
            message.headers.insert_if_absent(headers::SOURCE_QUEUE, own.as_str());
        }

        let mut outgoing = StepContext::outgoing_raw(
            Arc::clone(ctx.transaction()),
            message,
            vec![self.error_queue.clone()],
        );
        inner.invoker.invoke_outgoing(&mut outgoing).await
    }
}

#[async_trait]
impl Step for RetryStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()> {
        let Some(message) = ctx.transport_message.clone() else {
            return next.run(ctx).await;
        };

        // A message without an id cannot be tracked; it is irredeemable
        // and dead-letters on first sight.
        let Some(message_id) = message.message_id().map(str::to_string) else {
            warn!("received message without a message-id header; dead-lettering");
            return self
                .dead_letter(ctx, message, "message has no message-id header")
                .await;
        };

        match next.run(ctx).await {
            Ok(()) => {
                self.tracker.clear(&message_id);
                Ok(())
            }
            Err(failure) => {
                self.tracker.register_error(&message_id, &failure);
                let attempts = self.tracker.failure_count(&message_id);

                if !self.tracker.has_failed_too_many_times(&message_id) {
                    warn!(message_id, attempts, error = %failure, "message handling failed; will retry");
                    return Err(failure);
                }

                error!(message_id, attempts, "message is poison; moving to error queue");
                let details = self
                    .tracker
                    .error_details(&message_id)
                    .unwrap_or_else(|| failure.to_string());
                self.dead_letter(ctx, message, &details).await?;
                self.tracker.clear(&message_id);
                // Returning Ok lets the worker commit: the error-queue copy
                // goes out and the original is acknowledged.
                Ok(())
            }
        }
    }
}
