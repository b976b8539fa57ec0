//! Saga engine: long-running, correlated, exclusively-accessed state
//!
//! A saga is a stateful conversation spanning many messages. Incoming
//! messages are matched to saga state through *correlation properties*:
//! named values extracted from both the message and the stored data. The
//! engine looks the state up, invokes the saga handler, and persists the
//! result under optimistic concurrency; an optional bucketed lock
//! serializes access to the same correlation values across workers.

mod engine;
mod lock;
mod storage;

pub use engine::SagaEngine;
pub use lock::BucketLock;
pub use storage::{
    InMemSagaSnapshotStorage, InMemSagaStorage, SagaSnapshotStorage, SagaStorage, StoredSagaData,
};

use crate::dispatch::{HandlerRegistry, MessageContext};
use crate::errors::BusResult;
use crate::serializer::{BusMessage, ErasedMessage};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use uuid::Uuid;

/// State persisted for one saga instance.
///
/// `id` is assigned once and never changes; `revision` increases strictly
/// monotonically with every update, which is what the optimistic
/// concurrency check keys on.
pub trait SagaData: Serialize + DeserializeOwned + Default + Send + Sync + 'static {
    /// The saga instance id
    fn id(&self) -> Uuid;

    /// Assigns the id; called once when the saga is initiated
    fn set_id(&mut self, id: Uuid);

    /// The persisted revision this state was loaded at
    fn revision(&self) -> u64;

    /// Updates the revision; called by the engine on persist
    fn set_revision(&mut self, revision: u64);

    /// Stable name of the saga data type
    fn saga_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// One correlation property: how to read the value from an incoming
/// message and from the stored saga data.
///
/// For a given `(saga data type, property)` pair the value must be unique
/// per saga instance; persistence enforces this.
pub struct CorrelationProperty<M, D> {
    property: &'static str,
    from_message: Arc<dyn Fn(&M) -> Option<String> + Send + Sync>,
    from_data: Arc<dyn Fn(&D) -> Option<String> + Send + Sync>,
}

impl<M, D> CorrelationProperty<M, D> {
    /// Declares a correlation property with its two extractors
    pub fn new(
        property: &'static str,
        from_message: impl Fn(&M) -> Option<String> + Send + Sync + 'static,
        from_data: impl Fn(&D) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            property,
            from_message: Arc::new(from_message),
            from_data: Arc::new(from_data),
        }
    }

    /// The property name
    pub fn property(&self) -> &'static str {
        self.property
    }

    pub(crate) fn message_value(&self, message: &M) -> Option<String> {
        (self.from_message)(message)
    }

    pub(crate) fn data_value(&self, data: &D) -> Option<String> {
        (self.from_data)(data)
    }
}

impl<M, D> Clone for CorrelationProperty<M, D> {
    fn clone(&self) -> Self {
        Self {
            property: self.property,
            from_message: Arc::clone(&self.from_message),
            from_data: Arc::clone(&self.from_data),
        }
    }
}

/// The saga state handed to a handler: the data plus completion marking
#[derive(Debug)]
pub struct SagaInstance<D> {
    /// The saga's domain state; mutate freely, the engine persists it
    pub data: D,
    completed: bool,
    is_new: bool,
}

impl<D> SagaInstance<D> {
    pub(crate) fn existing(data: D) -> Self {
        Self {
            data,
            completed: false,
            is_new: false,
        }
    }

    pub(crate) fn fresh(data: D) -> Self {
        Self {
            data,
            completed: false,
            is_new: true,
        }
    }

    /// Marks the saga finished: its state is deleted instead of updated
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    /// True when the saga was marked finished
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// True when this instance was created for the current message rather
    /// than loaded from storage
    pub fn is_new(&self) -> bool {
        self.is_new
    }
}

/// A handler participating in a saga for one message type
#[async_trait]
pub trait SagaHandler<M: BusMessage>: Send + Sync + 'static {
    /// The saga state this handler works on
    type Data: SagaData;

    /// The correlation properties connecting `M` to [`Self::Data`]
    fn correlations(&self) -> Vec<CorrelationProperty<M, Self::Data>>;

    /// True when a message of this type may start a new saga instance.
    /// Non-initiating handlers are skipped when no saga matches.
    fn is_initiator(&self) -> bool {
        false
    }

    /// Handles the message against the saga state
    async fn handle(
        &self,
        saga: &mut SagaInstance<Self::Data>,
        message: &M,
        ctx: &MessageContext,
    ) -> anyhow::Result<()>;
}

/// Storage handles threaded into an erased saga invocation
#[derive(Clone)]
pub(crate) struct SagaEnv {
    pub(crate) storage: Arc<dyn SagaStorage>,
    pub(crate) snapshots: Option<Arc<dyn SagaSnapshotStorage>>,
}

pub(crate) type SagaInvoker = Arc<
    dyn Fn(Arc<dyn ErasedMessage>, MessageContext, SagaEnv) -> BoxFuture<'static, BusResult<()>>
        + Send
        + Sync,
>;

type CorrelationValues = Arc<dyn Fn(&dyn ErasedMessage) -> Vec<(String, String)> + Send + Sync>;

/// Type-erased registration of one saga handler for one message type
#[derive(Clone)]
pub(crate) struct SagaRegistration {
    pub(crate) saga_type: &'static str,
    pub(crate) correlation_values: CorrelationValues,
    pub(crate) invoke: SagaInvoker,
}

impl HandlerRegistry {
    /// Registers a saga handler for a message type.
    ///
    /// Like regular registration this also registers the message decoder,
    /// so a saga endpoint decodes exactly the types its sagas react to.
    pub fn register_saga<M, H>(&self, handler: H)
    where
        M: BusMessage,
        H: SagaHandler<M>,
    {
        self.types().register::<M>();

        let handler = Arc::new(handler);
        let spec = Arc::new(handler.correlations());
        let is_initiator = handler.is_initiator();

        let extraction_spec = Arc::clone(&spec);
        let correlation_values: CorrelationValues = Arc::new(move |message| {
            let Some(typed) = message.as_any().downcast_ref::<M>() else {
                return Vec::new();
            };
            extraction_spec
                .iter()
                .filter_map(|prop| {
                    prop.message_value(typed)
                        .map(|value| (prop.property().to_string(), value))
                })
                .collect()
        });

        let invoke: SagaInvoker = Arc::new(move |message, ctx, env| {
            let handler = Arc::clone(&handler);
            let spec = Arc::clone(&spec);
            Box::pin(engine::run_saga_handler::<M, H>(
                handler,
                spec,
                is_initiator,
                message,
                ctx,
                env,
            ))
        });

        self.register_saga_entry(
            M::message_type(),
            SagaRegistration {
                saga_type: H::Data::saga_type(),
                correlation_values,
                invoke,
            },
        );
    }
}
