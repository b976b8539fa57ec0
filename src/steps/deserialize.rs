//! Deserialize step: decodes the wire message into its logical form

use crate::errors::{BusError, BusResult};
use crate::pipeline::{Next, Step, StepContext};
use crate::serializer::Serializer;
use async_trait::async_trait;
use std::sync::Arc;

/// Produces the [`crate::serializer::LogicalMessage`] for downstream steps
pub struct DeserializeStep {
    serializer: Arc<dyn Serializer>,
}

impl DeserializeStep {
    /// Step name for pipeline surgery
    pub const NAME: &'static str = "deserialize";

    pub(crate) fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }
}

#[async_trait]
impl Step for DeserializeStep {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn process(&self, ctx: &mut StepContext, next: Next<'_>) -> BusResult<()> {
        let message = ctx
            .transport_message
            .as_ref()
            .ok_or_else(|| BusError::configuration("deserialize step needs a transport message"))?;
        ctx.logical_message = Some(self.serializer.deserialize(message)?);
        next.run(ctx).await
    }
}
