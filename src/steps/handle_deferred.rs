//! Handle-deferred step: the timeout-manager side of deferral
//!
//! Present on endpoints that host a timeout store. A message arriving with
//! `deferred-until` is parked in the store (enlisted on commit) instead of
//! being dispatched; the poller returns it to its `deferred-recipient`
//! when due.

use crate::errors::{BusError, BusResult};
use crate::pipeline::{Next, Step, StepContext};
use crate::timeouts::TimeoutManager;
use crate::transport::headers;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Parks deferred messages in the local timeout store
pub struct HandleDeferredStep {
    timeouts: Option<Arc<dyn TimeoutManager>>,
}

impl HandleDeferredStep {
    /// Step name for pipeline surgery
    pub const NAME: &'static str = "handle-deferred";

    pub(crate) fn new(timeouts: Option<Arc<dyn TimeoutManager>>) -> Self {
        Self { timeouts }
    }
}

#[async_trait]
impl Step for HandleDeferredStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()> {
        let deferred = ctx
            .transport_message
            .as_ref()
            .is_some_and(|m| m.headers.contains(headers::DEFERRED_UNTIL));
        let Some(store) = (deferred.then(|| self.timeouts.clone())).flatten() else {
            return next.run(ctx).await;
        };

        let message = ctx
            .transport_message
            .as_mut()
            .ok_or_else(|| BusError::configuration("handle-deferred step needs a transport message"))?;

        let due_value = message
            .headers
            .remove(headers::DEFERRED_UNTIL)
            .ok_or(BusError::MissingHeader {
                name: headers::DEFERRED_UNTIL,
            })?;
        let due = headers::parse_time(&due_value).ok_or_else(|| {
            BusError::handler(anyhow::anyhow!("invalid deferred-until value: {due_value}"))
        })?;

        // The recipient defaults to whoever sent the message
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

        debug!(due = %due_value, "parking deferred message");
        let headers = message.headers.clone();
        let body = message.body.clone();
        ctx.transaction().on_commit(move || async move {
            store.defer(due, headers, body).await?;
            Ok(())
        })?;

        // Short-circuit: the message is consumed
        Ok(())
    }
}
