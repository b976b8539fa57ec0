//! # Omnibus — a durable, transport-agnostic service bus core
//!
//! Omnibus moves messages between logical queues with at-least-once
//! delivery, built around a configurable processing pipeline:
//!
//! - a **transactional receive loop**: workers drive one
//!   receive -> pipeline -> commit cycle at a time inside a transaction
//!   context with ordered commit/abort/dispose callbacks, automatic
//!   retries via an in-memory error tracker, and dead-lettering;
//! - staged **incoming and outgoing step pipelines** with decorator
//!   semantics and position-based insertion/removal;
//! - a **saga engine** with correlation-based lookup, optimistic
//!   concurrency on revisions, and bucketed exclusive-access locking;
//! - a **deferred-message manager** and **topic-based pub/sub** over
//!   pluggable storage.
//!
//! Concrete transports, persistence backends and serializers plug in
//! behind ports; in-memory reference implementations (plus a SQLite
//! timeout store) ship in-crate.
//!
//! ```no_run
//! use omnibus::{Bus, BusMessage, Handler, MessageContext, QueueAddress};
//! use omnibus::transport::inmem::{InMemNetwork, InMemTransport};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Hello { text: String }
//! impl BusMessage for Hello {}
//!
//! struct HelloHandler;
//!
//! #[async_trait::async_trait]
//! impl Handler<Hello> for HelloHandler {
//!     async fn handle(&self, message: &Hello, _ctx: &MessageContext) -> anyhow::Result<()> {
//!         println!("{}", message.text);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let network = InMemNetwork::new();
//!     let address = QueueAddress::try_new("greetings".to_string())?;
//!     let bus = Bus::configure()
//!         .transport(InMemTransport::new(network, address))
//!         .handlers(|registry| registry.register::<Hello, _>(HelloHandler))
//!         .start()
//!         .await?;
//!
//!     bus.send_local(Hello { text: "hi".to_string() }).await?;
//!     bus.stop().await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod domain_types;
pub mod error_tracker;
pub mod errors;
pub mod pipeline;
pub mod routing;
pub mod saga;
pub mod serializer;
pub mod steps;
pub mod subscriptions;
pub mod time_provider;
pub mod timeouts;
pub mod transaction;
pub mod transport;
pub mod worker;

pub use bus::Bus;
pub use config::{BusConfig, BusConfigurer};
pub use dispatch::{Handler, HandlerRegistry, MessageContext};
pub use domain_types::{
    DrainDeadlineMs, ErrorEntryMaxAgeMs, LockBucketCount, MaxDeliveryAttempts, MaxParallelism,
    QueueAddress, TimeoutTickIntervalMs, TopicName, WorkerCount,
};
pub use error_tracker::ErrorTracker;
pub use errors::{BusError, BusResult, SagaStorageError, TransportError};
pub use pipeline::{Next, Pipeline, PipelineInvoker, Step, StepContext, StepPosition};
pub use routing::Router;
pub use saga::{
    BucketLock, CorrelationProperty, InMemSagaSnapshotStorage, InMemSagaStorage, SagaData,
    SagaEngine, SagaHandler, SagaInstance, SagaSnapshotStorage, SagaStorage, StoredSagaData,
};
pub use serializer::{BusMessage, JsonSerializer, LogicalMessage, Serializer, TypeRegistry};
pub use subscriptions::{
    InMemSubscriptionStorage, SubscribeRequest, SubscriptionStorage, UnsubscribeRequest,
};
pub use time_provider::{RealTimeProvider, SharedTimeProvider, TimeProvider, VirtualTimeProvider};
pub use timeouts::{DueMessage, InMemTimeoutStore, SqliteTimeoutStore, TimeoutManager};
pub use transaction::{ContextState, TransactionContext};
pub use transport::headers::Headers;
pub use transport::{Transport, TransportMessage};
pub use worker::{BackoffStrategy, DefaultBackoffStrategy};
