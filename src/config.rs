//! Bus configuration and assembly
//!
//! [`BusConfig`] holds the recognized option set with validated defaults;
//! [`BusConfigurer`] wires the components in construction order, applies
//! the pipeline decorations (deferral steps removed for native-delay
//! transports, caller-supplied pipeline surgery), and starts the bus.
//! Missing mandatory wiring fails construction, never startup.

use crate::bus::{Bus, BusLink};
use crate::dispatch::HandlerRegistry;
use crate::domain_types::{
    DrainDeadlineMs, ErrorEntryMaxAgeMs, LockBucketCount, MaxDeliveryAttempts, MaxParallelism,
    QueueAddress, TimeoutTickIntervalMs, WorkerCount,
};
use crate::error_tracker::ErrorTracker;
use crate::errors::{BusError, BusResult};
use crate::pipeline::{Pipeline, PipelineInvoker, StepPosition};
use crate::routing::Router;
use crate::saga::{BucketLock, SagaEngine, SagaSnapshotStorage, SagaStorage};
use crate::serializer::{JsonSerializer, Serializer};
use crate::steps::{
    DeferredMessagesStep, DeserializeStep, DispatchStep, HandleDeferredStep, RetryStep, SendStep,
    SerializeStep,
};
use crate::subscriptions::{
    SubscribeRequest, SubscriptionRequestHandler, SubscriptionStorage, UnsubscribeRequest,
};
use crate::time_provider::{RealTimeProvider, SharedTimeProvider};
use crate::timeouts::{InMemTimeoutStore, TimeoutManager};
use crate::transport::Transport;
use crate::worker::{BackoffStrategy, DefaultBackoffStrategy};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The recognized configuration option set
#[derive(Clone)]
pub struct BusConfig {
    /// Receive worker count; zero configures a one-way client
    pub number_of_workers: WorkerCount,
    /// In-flight pipeline invocations allowed per worker
    pub max_parallelism_per_worker: MaxParallelism,
    /// Failures before a message is dead-lettered
    pub max_delivery_attempts: MaxDeliveryAttempts,
    /// Dead-letter destination
    pub error_queue_address: QueueAddress,
    /// Striping of the saga exclusive-access lock
    pub max_lock_buckets: LockBucketCount,
    /// Timeout manager poll cadence
    pub timeout_tick_interval: TimeoutTickIntervalMs,
    /// Maximum wait for in-flight messages at stop
    pub shutdown_drain_deadline: DrainDeadlineMs,
    /// Age-based eviction horizon for idle error tracker entries
    pub error_entry_max_age: ErrorEntryMaxAgeMs,
    /// Whether saga handling takes the bucketed exclusive-access lock
    pub enforce_exclusive_saga_access: bool,
    /// External timeout manager endpoint. `None` hosts a local store.
    pub timeouts_address: Option<QueueAddress>,
    backoff: Arc<dyn BackoffStrategy>,
}

impl BusConfig {
    /// The documented defaults: one worker at parallelism one, five
    /// delivery attempts, dead-letters to `error`, 1024 lock buckets,
    /// one-second timeout ticks.
    ///
    /// # Panics
    /// Never in practice; the hardcoded defaults are in range for their
    /// domain types.
    pub fn new() -> Self {
        Self {
            number_of_workers: WorkerCount::default(),
            max_parallelism_per_worker: MaxParallelism::default(),
            max_delivery_attempts: MaxDeliveryAttempts::default(),
            error_queue_address: QueueAddress::try_new("error".to_string())
                .expect("default error queue address is valid"),
            max_lock_buckets: LockBucketCount::default(),
            timeout_tick_interval: TimeoutTickIntervalMs::default(),
            shutdown_drain_deadline: DrainDeadlineMs::default(),
            error_entry_max_age: ErrorEntryMaxAgeMs::default(),
            enforce_exclusive_saga_access: true,
            timeouts_address: None,
            backoff: Arc::new(DefaultBackoffStrategy::new()),
        }
    }

    /// Replaces the retry backoff strategy
    pub fn set_backoff(&mut self, backoff: impl BackoffStrategy + 'static) {
        self.backoff = Arc::new(backoff);
    }

    pub(crate) fn backoff(&self) -> Arc<dyn BackoffStrategy> {
        Arc::clone(&self.backoff)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BusConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfig")
            .field("number_of_workers", &self.number_of_workers)
            .field("max_parallelism_per_worker", &self.max_parallelism_per_worker)
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("error_queue_address", &self.error_queue_address)
            .field("timeouts_address", &self.timeouts_address)
            .finish_non_exhaustive()
    }
}

type PipelineCustomizer = Box<dyn FnOnce(&mut Pipeline) -> BusResult<()> + Send>;

/// Wires the bus together.
///
/// The transport is mandatory; everything else has an in-memory default:
/// JSON serialization, local subscription storage, in-memory saga storage,
/// and (unless an external timeouts endpoint is configured) an in-memory
/// timeout store.
pub struct BusConfigurer {
    config: BusConfig,
    transport: Option<Arc<dyn Transport>>,
    router: Arc<Router>,
    registry: Arc<HandlerRegistry>,
    serializer: Option<Arc<dyn Serializer>>,
    subscriptions: Option<Arc<dyn SubscriptionStorage>>,
    saga_storage: Option<Arc<dyn SagaStorage>>,
    snapshot_storage: Option<Arc<dyn SagaSnapshotStorage>>,
    timeout_store: Option<Arc<dyn TimeoutManager>>,
    time: SharedTimeProvider,
    pipeline_customizers: Vec<PipelineCustomizer>,
}

impl BusConfigurer {
    pub(crate) fn new() -> Self {
        Self {
            config: BusConfig::new(),
            transport: None,
            router: Arc::new(Router::new()),
            registry: Arc::new(HandlerRegistry::new()),
            serializer: None,
            subscriptions: None,
            saga_storage: None,
            snapshot_storage: None,
            timeout_store: None,
            time: Arc::new(RealTimeProvider::new()),
            pipeline_customizers: Vec::new(),
        }
    }

    /// Sets the transport (mandatory)
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Configures type-based routes
    pub fn routes(self, configure: impl FnOnce(&Router)) -> Self {
        configure(&self.router);
        self
    }

    /// Registers handlers and sagas
    pub fn handlers(self, configure: impl FnOnce(&HandlerRegistry)) -> Self {
        configure(&self.registry);
        self
    }

    /// Adjusts configuration options
    pub fn options(mut self, configure: impl FnOnce(&mut BusConfig)) -> Self {
        configure(&mut self.config);
        self
    }

    /// Replaces the serializer
    pub fn serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.serializer = Some(Arc::new(serializer));
        self
    }

    /// Replaces subscription storage
    pub fn subscription_storage(mut self, storage: impl SubscriptionStorage + 'static) -> Self {
        self.subscriptions = Some(Arc::new(storage));
        self
    }

    /// Replaces saga storage
    pub fn saga_storage(mut self, storage: impl SagaStorage + 'static) -> Self {
        self.saga_storage = Some(Arc::new(storage));
        self
    }

    /// Enables saga snapshotting into the given store
    pub fn saga_snapshots(mut self, storage: impl SagaSnapshotStorage + 'static) -> Self {
        self.snapshot_storage = Some(Arc::new(storage));
        self
    }

    /// Hosts the given timeout store on this endpoint
    pub fn timeout_store(mut self, store: impl TimeoutManager + 'static) -> Self {
        self.timeout_store = Some(Arc::new(store));
        self
    }

    /// Defers through an external timeout manager endpoint instead of
    /// hosting a store
    pub fn defer_to(mut self, timeouts_address: QueueAddress) -> Self {
        self.config.timeouts_address = Some(timeouts_address);
        self
    }

    /// Replaces the time provider (tests pin or advance the clock)
    pub fn time_provider(mut self, time: SharedTimeProvider) -> Self {
        self.time = time;
        self
    }

    /// Queues custom pipeline surgery, applied after the built-in steps
    /// are assembled
    pub fn pipeline(mut self, customize: impl FnOnce(&mut Pipeline) -> BusResult<()> + Send + 'static) -> Self {
        self.pipeline_customizers.push(Box::new(customize));
        self
    }

    /// Builds and starts the bus
    pub async fn start(self) -> BusResult<Bus> {
        let transport = self.transport.ok_or_else(|| {
            BusError::configuration("a transport is required; configure one with .transport(...)")
        })?;
        let config = self.config;

        if config.timeouts_address.is_some() && self.timeout_store.is_some() {
            return Err(BusError::configuration(
                "either host a timeout store or defer to an external endpoint, not both",
            ));
        }
        if transport.address().is_none() && !config.number_of_workers.is_one_way() {
            return Err(BusError::configuration(
                "a transport without an input queue requires number_of_workers = 0 (one-way client)",
            ));
        }

        let registry = self.registry;
        let serializer = self
            .serializer
            .unwrap_or_else(|| Arc::new(JsonSerializer::new(registry.types())));
        let subscriptions = self.subscriptions.unwrap_or_else(|| {
            Arc::new(crate::subscriptions::InMemSubscriptionStorage::local())
        });
        let saga_storage = self
            .saga_storage
            .unwrap_or_else(|| Arc::new(crate::saga::InMemSagaStorage::new()));
        let time = self.time;

        let timeouts: Option<Arc<dyn TimeoutManager>> = if config.timeouts_address.is_some() {
            None
        } else {
            Some(
                self.timeout_store
                    .unwrap_or_else(|| Arc::new(InMemTimeoutStore::new(Arc::clone(&time)))),
            )
        };

        // Decentralized subscribers ask for changes with these commands;
        // every endpoint can answer them against its local storage.
        registry.register::<SubscribeRequest, _>(SubscriptionRequestHandler::new(Arc::clone(
            &subscriptions,
        )));
        registry.register::<UnsubscribeRequest, _>(SubscriptionRequestHandler::new(Arc::clone(
            &subscriptions,
        )));

        transport.create_queue(&config.error_queue_address).await?;

        let error_tracker = Arc::new(ErrorTracker::new(
            config.max_delivery_attempts,
            config.error_entry_max_age,
            Arc::clone(&time),
        ));
        let link = Arc::new(BusLink::default());

        let mut pipeline = Pipeline::new();
        pipeline.insert_incoming(
            Arc::new(RetryStep::new(
                Arc::clone(&error_tracker),
                config.error_queue_address.clone(),
                Arc::clone(&link),
            )),
            StepPosition::First,
        )?;
        pipeline.insert_incoming(
            Arc::new(HandleDeferredStep::new(timeouts.clone())),
            StepPosition::After(RetryStep::NAME),
        )?;
        pipeline.insert_incoming(
            Arc::new(DeferredMessagesStep::new(
                config.timeouts_address.clone(),
                Arc::clone(&transport),
            )),
            StepPosition::After(HandleDeferredStep::NAME),
        )?;
        pipeline.insert_incoming(
            Arc::new(DeserializeStep::new(Arc::clone(&serializer))),
            StepPosition::Last,
        )?;
        pipeline.insert_incoming(Arc::new(DispatchStep::new(Arc::clone(&link))), StepPosition::Last)?;
        pipeline.insert_outgoing(
            Arc::new(SerializeStep::new(Arc::clone(&serializer))),
            StepPosition::Last,
        )?;
        pipeline.insert_outgoing(Arc::new(SendStep::new(Arc::clone(&transport))), StepPosition::Last)?;

        if transport.supports_deferred_delivery() {
            let removed = pipeline.remove_incoming(|step| {
                step.name() == HandleDeferredStep::NAME || step.name() == DeferredMessagesStep::NAME
            });
            debug!(removed, "transport handles deferred delivery natively");
        }

        for customize in self.pipeline_customizers {
            customize(&mut pipeline)?;
        }
        debug!(?pipeline, "pipeline assembled");

        let saga_engine = SagaEngine::new(
            saga_storage,
            self.snapshot_storage,
            BucketLock::new(config.max_lock_buckets),
            config.enforce_exclusive_saga_access,
        );

        let inner = Arc::new(crate::bus::BusInner {
            config,
            transport,
            router: self.router,
            registry,
            subscriptions,
            saga_engine,
            error_tracker,
            timeouts,
            invoker: PipelineInvoker::new(pipeline),
            time,
            cancel: CancellationToken::new(),
            running: tokio::sync::Mutex::new(None),
        });
        link.attach(&inner);

        let bus = Bus::from_inner(inner);
        bus.start().await?;
        Ok(bus)
    }
}

impl std::fmt::Debug for BusConfigurer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusConfigurer")
            .field("has_transport", &self.transport.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
