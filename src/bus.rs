//! The bus: public send/publish/reply/subscribe/defer surface
//!
//! Every outgoing operation funnels through the outgoing pipeline inside
//! the ambient transaction context when a message is being handled (the
//! send leaves when the incoming message commits), or inside a fresh
//! implicit context completed on the spot otherwise.
//!
//! `start` spawns the receive workers, the timeout poller, and the error
//! tracker purge task; `stop` cancels them and drains in-flight work up to
//! the configured deadline.

use crate::config::{BusConfig, BusConfigurer};
use crate::dispatch::HandlerRegistry;
use crate::domain_types::{QueueAddress, TopicName};
use crate::error_tracker::ErrorTracker;
use crate::errors::{BusError, BusResult};
use crate::pipeline::{PipelineInvoker, StepContext};
use crate::routing::Router;
use crate::saga::SagaEngine;
use crate::serializer::{BusMessage, LogicalMessage};
use crate::subscriptions::{SubscribeRequest, SubscriptionStorage, UnsubscribeRequest};
use crate::time_provider::SharedTimeProvider;
use crate::timeouts::{DueMessage, TimeoutManager};
use crate::transaction::TransactionContext;
use crate::transport::headers::{self, Headers};
use crate::transport::{Transport, TransportMessage};
use crate::worker::{WorkerPool, WorkerShared};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

tokio::task_local! {
    /// The per-task handling scope: set by a worker around one incoming
    /// pipeline invocation so sends made anywhere inside it (handlers,
    /// steps) enlist in the same unit of work
    pub(crate) static AMBIENT: HandlingScope;
}

/// What the ambient scope carries: the transaction of the message being
/// handled plus its headers (for reply addressing and correlation flow)
#[derive(Clone)]
pub(crate) struct HandlingScope {
    pub(crate) transaction: Arc<TransactionContext>,
    pub(crate) headers: Headers,
}

pub(crate) fn current_scope() -> Option<HandlingScope> {
    AMBIENT.try_with(|scope| scope.clone()).ok()
}

/// Late-bound reference from pipeline steps back to the bus, set once the
/// bus is assembled
#[derive(Default)]
pub(crate) struct BusLink(OnceLock<Weak<BusInner>>);

impl BusLink {
    pub(crate) fn attach(&self, inner: &Arc<BusInner>) {
        let _ = self.0.set(Arc::downgrade(inner));
    }

    pub(crate) fn get(&self) -> BusResult<Arc<BusInner>> {
        self.0
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| BusError::configuration("bus is not available"))
    }
}

pub(crate) struct BusInner {
    pub(crate) config: BusConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) router: Arc<Router>,
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) subscriptions: Arc<dyn SubscriptionStorage>,
    pub(crate) saga_engine: SagaEngine,
    pub(crate) error_tracker: Arc<ErrorTracker>,
    pub(crate) timeouts: Option<Arc<dyn TimeoutManager>>,
    pub(crate) invoker: PipelineInvoker,
    pub(crate) time: SharedTimeProvider,
    pub(crate) cancel: CancellationToken,
    pub(crate) running: Mutex<Option<Running>>,
}

pub(crate) struct Running {
    workers: WorkerPool,
    poller: Option<JoinHandle<()>>,
    purger: JoinHandle<()>,
}

impl BusInner {
    fn own_address(&self) -> Option<QueueAddress> {
        self.transport.address().cloned()
    }

    /// Stamps the outgoing header set: identity, type, timing, addressing
    /// and the correlation chain flowed from the message under handling
    fn build_headers(&self, message_type: &str, intent: &str, user: Headers) -> Headers {
        let mut built = user;
        built.insert_if_absent(headers::MESSAGE_ID, Uuid::new_v4().to_string());
        built.insert_if_absent(headers::TYPE, message_type);
        built.insert_if_absent(headers::SENT_TIME, headers::format_time(self.time.now()));
        built.insert_if_absent(headers::INTENT, intent);
        if let Some(own) = self.own_address() {
            built.insert_if_absent(headers::RETURN_ADDRESS, own.as_str());
        }

        match current_scope() {
            Some(scope) => {
                let correlation = scope
                    .headers
                    .get(headers::CORRELATION_ID)
                    .or_else(|| scope.headers.get(headers::MESSAGE_ID));
                if let Some(correlation) = correlation {
                    built.insert_if_absent(headers::CORRELATION_ID, correlation);
                }
                let sequence = scope
                    .headers
                    .get(headers::CORRELATION_SEQUENCE)
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(0);
                built.insert_if_absent(headers::CORRELATION_SEQUENCE, (sequence + 1).to_string());
            }
            None => {
                let own_id = built
                    .get(headers::MESSAGE_ID)
                    .unwrap_or_default()
                    .to_string();
                built.insert_if_absent(headers::CORRELATION_ID, own_id);
                built.insert_if_absent(headers::CORRELATION_SEQUENCE, "0");
            }
        }
        built
    }

    /// Runs the outgoing pipeline inside the ambient context when one
    /// exists, else inside a fresh implicit context completed immediately
    pub(crate) async fn send_logical(
        &self,
        destinations: Vec<QueueAddress>,
        message: LogicalMessage,
    ) -> BusResult<()> {
        match current_scope() {
            Some(scope) => {
                let mut ctx = StepContext::outgoing(scope.transaction, message, destinations);
                self.invoker.invoke_outgoing(&mut ctx).await
            }
            None => {
                let transaction = Arc::new(TransactionContext::new());
                let mut ctx =
                    StepContext::outgoing(Arc::clone(&transaction), message, destinations);
                let outcome = match self.invoker.invoke_outgoing(&mut ctx).await {
                    Ok(()) => transaction.complete().await,
                    Err(error) => {
                        if let Err(abort_error) = transaction.abort().await {
                            warn!(%abort_error, "failed to abort implicit send context");
                        }
                        Err(error)
                    }
                };
                transaction.dispose().await;
                outcome
            }
        }
    }
}

/// The top-level send/receive facade.
///
/// Cheap to clone; clones share the same underlying bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Entry point of the configuration assembly
    pub fn configure() -> BusConfigurer {
        BusConfigurer::new()
    }

    pub(crate) fn from_inner(inner: Arc<BusInner>) -> Self {
        Self { inner }
    }

    /// The input queue address, when this endpoint has one
    pub fn address(&self) -> Option<QueueAddress> {
        self.inner.own_address()
    }

    /// The error tracker, exposed for diagnostics
    pub fn error_tracker(&self) -> &Arc<ErrorTracker> {
        &self.inner.error_tracker
    }

    /// Starts the receive workers (unless in one-way mode), the timeout
    /// poller, and the tracker purge task
    pub async fn start(&self) -> BusResult<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(BusError::configuration("bus has been stopped"));
        }
        let mut running = self.inner.running.lock().await;
        if running.is_some() {
            return Err(BusError::configuration("bus is already started"));
        }

        let worker_count = self.inner.config.number_of_workers.as_usize();
        let shared = Arc::new(WorkerShared {
            bus: Arc::downgrade(&self.inner),
            parallelism: self.inner.config.max_parallelism_per_worker.as_usize(),
            drain_deadline: self.inner.config.shutdown_drain_deadline.as_duration(),
            backoff: self.inner.config.backoff(),
        });
        let workers = WorkerPool::start(shared, self.inner.cancel.child_token(), worker_count);

        let poller = self.inner.timeouts.as_ref().map(|store| {
            tokio::spawn(run_timeout_poller(
                Arc::downgrade(&self.inner),
                Arc::clone(store),
                self.inner.config.timeout_tick_interval.as_duration(),
                self.inner.cancel.child_token(),
            ))
        });

        let purger = tokio::spawn(run_tracker_purge(
            Arc::clone(&self.inner.error_tracker),
            purge_interval(&self.inner.config),
            self.inner.cancel.child_token(),
        ));

        *running = Some(Running {
            workers,
            poller,
            purger,
        });
        info!(
            workers = worker_count,
            one_way = self.inner.config.number_of_workers.is_one_way(),
            "bus started"
        );
        Ok(())
    }

    /// Stops the bus: cancels receive and background tasks, drains
    /// in-flight messages up to the configured deadline
    pub async fn stop(&self) -> BusResult<()> {
        let running = self.inner.running.lock().await.take();
        let Some(running) = running else {
            return Err(BusError::configuration("bus is not started"));
        };

        info!("stopping bus");
        self.inner.cancel.cancel();
        running.workers.stop().await;
        if let Some(poller) = running.poller {
            if let Err(join_error) = poller.await {
                warn!(%join_error, "timeout poller task failed");
            }
        }
        if let Err(join_error) = running.purger.await {
            warn!(%join_error, "tracker purge task failed");
        }
        info!("bus stopped");
        Ok(())
    }

    /// Adjusts the worker count of a running bus.
    ///
    /// A bus configured as a one-way client rejects this: zero workers is
    /// a mode, not a count.
    pub async fn set_number_of_workers(&self, count: usize) -> BusResult<()> {
        if self.inner.config.number_of_workers.is_one_way() {
            return Err(BusError::configuration(
                "a one-way client cannot be given receive workers",
            ));
        }
        let mut running = self.inner.running.lock().await;
        let Some(running) = running.as_mut() else {
            return Err(BusError::configuration("bus is not started"));
        };
        running.workers.set_worker_count(count);
        Ok(())
    }

    /// Current worker count, for diagnostics
    pub async fn worker_count(&self) -> usize {
        self.inner
            .running
            .lock()
            .await
            .as_ref()
            .map(|running| running.workers.worker_count())
            .unwrap_or(0)
    }

    /// Sends a message to the destination mapped for its type
    pub async fn send<M: BusMessage>(&self, message: M) -> BusResult<()> {
        self.send_with_headers(message, Headers::new()).await
    }

    /// [`Bus::send`] with caller-supplied headers (stamped headers are
    /// only added where absent)
    pub async fn send_with_headers<M: BusMessage>(
        &self,
        message: M,
        user_headers: Headers,
    ) -> BusResult<()> {
        let destination = self.inner.router.destination_for(M::message_type())?;
        self.send_to(destination, message, user_headers).await
    }

    /// Sends a message to this endpoint's own input queue
    pub async fn send_local<M: BusMessage>(&self, message: M) -> BusResult<()> {
        let destination = self.require_own_address("send_local")?;
        self.send_to(destination, message, Headers::new()).await
    }

    /// Replies to the message currently being handled, using its
    /// `return-address`
    pub async fn reply<M: BusMessage>(&self, message: M) -> BusResult<()> {
        self.reply_with_headers(message, Headers::new()).await
    }

    /// [`Bus::reply`] with caller-supplied headers
    pub async fn reply_with_headers<M: BusMessage>(
        &self,
        message: M,
        user_headers: Headers,
    ) -> BusResult<()> {
        let scope = current_scope().ok_or_else(|| {
            BusError::configuration("reply is only available while a message is being handled")
        })?;
        let return_address =
            scope
                .headers
                .get(headers::RETURN_ADDRESS)
                .ok_or(BusError::MissingHeader {
                    name: headers::RETURN_ADDRESS,
                })?;
        let destination = QueueAddress::try_new(return_address.to_string())
            .map_err(|_| BusError::configuration("return-address header is not a valid queue"))?;
        self.send_to(destination, message, user_headers).await
    }

    /// Defers a message: it arrives on this endpoint's input queue no
    /// earlier than `delay` from now
    pub async fn defer<M: BusMessage>(&self, delay: Duration, message: M) -> BusResult<()> {
        self.defer_with_headers(delay, message, Headers::new()).await
    }

    /// [`Bus::defer`] with caller-supplied headers
    pub async fn defer_with_headers<M: BusMessage>(
        &self,
        delay: Duration,
        message: M,
        mut user_headers: Headers,
    ) -> BusResult<()> {
        let recipient = self.require_own_address("defer")?;
        let due = self.inner.time.now()
            + chrono::Duration::from_std(delay)
                .map_err(|_| BusError::configuration("defer delay is out of range"))?;
        user_headers.insert(headers::DEFERRED_UNTIL, headers::format_time(due));
        user_headers.insert_if_absent(headers::DEFERRED_RECIPIENT, recipient.as_str());

        // The deferred message goes to the timeout manager endpoint: an
        // external one when configured, else our own input queue (whose
        // pipeline parks it in the local store).
        let destination = self
            .inner
            .config
            .timeouts_address
            .clone()
            .unwrap_or(recipient);
        self.send_to(destination, message, user_headers).await
    }

    /// Publishes a message to every subscriber of its type-derived topic
    pub async fn publish<M: BusMessage>(&self, message: M) -> BusResult<()> {
        self.publish_with_headers(message, Headers::new()).await
    }

    /// [`Bus::publish`] with caller-supplied headers
    pub async fn publish_with_headers<M: BusMessage>(
        &self,
        message: M,
        user_headers: Headers,
    ) -> BusResult<()> {
        let topic = topic_for::<M>()?;
        let subscribers = self.inner.subscriptions.subscribers(&topic).await?;
        if subscribers.is_empty() {
            debug!(topic = %topic, "publish with no subscribers");
            return Ok(());
        }

        let built = self
            .inner
            .build_headers(M::message_type(), headers::INTENT_PUB_SUB, user_headers);
        let logical = LogicalMessage::from_message(built, message);
        self.inner.send_logical(subscribers, logical).await
    }

    /// Subscribes this endpoint to the topic derived from `M`
    pub async fn subscribe<M: BusMessage>(&self) -> BusResult<()> {
        let topic = topic_for::<M>()?;
        let subscriber_address = self.require_own_address("subscribe")?;

        if self.inner.subscriptions.is_centralized() {
            return self
                .inner
                .subscriptions
                .register(&topic, &subscriber_address)
                .await;
        }

        let publisher = self.inner.router.destination_for(M::message_type())?;
        debug!(topic = %topic, publisher = %publisher, "sending subscribe request");
        self.send_to(
            publisher,
            SubscribeRequest {
                topic,
                subscriber_address,
            },
            Headers::new(),
        )
        .await
    }

    /// Removes this endpoint's subscription to the topic derived from `M`
    pub async fn unsubscribe<M: BusMessage>(&self) -> BusResult<()> {
        let topic = topic_for::<M>()?;
        let subscriber_address = self.require_own_address("unsubscribe")?;

        if self.inner.subscriptions.is_centralized() {
            return self
                .inner
                .subscriptions
                .unregister(&topic, &subscriber_address)
                .await;
        }

        let publisher = self.inner.router.destination_for(M::message_type())?;
        self.send_to(
            publisher,
            UnsubscribeRequest {
                topic,
                subscriber_address,
            },
            Headers::new(),
        )
        .await
    }

    async fn send_to<M: BusMessage>(
        &self,
        destination: QueueAddress,
        message: M,
        user_headers: Headers,
    ) -> BusResult<()> {
        let built = self
            .inner
            .build_headers(M::message_type(), headers::INTENT_P2P, user_headers);
        let logical = LogicalMessage::from_message(built, message);
        self.inner.send_logical(vec![destination], logical).await
    }

    fn require_own_address(&self, operation: &str) -> BusResult<QueueAddress> {
        self.inner.own_address().ok_or_else(|| {
            BusError::configuration(format!("a one-way client cannot {operation}"))
        })
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("address", &self.inner.own_address())
            .finish()
    }
}

fn topic_for<M: BusMessage>() -> BusResult<TopicName> {
    TopicName::try_new(M::message_type().to_string())
        .map_err(|_| BusError::configuration("message type name is not a valid topic"))
}

fn purge_interval(config: &BusConfig) -> Duration {
    (config.error_entry_max_age.as_duration() / 2).min(Duration::from_secs(60))
}

/// Periodic tick draining due envelopes out of the timeout store
async fn run_timeout_poller(
    bus: Weak<BusInner>,
    store: Arc<dyn TimeoutManager>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let Some(bus) = bus.upgrade() else { break };

        let due = match store.due_messages().await {
            Ok(due) => due,
            Err(error) => {
                warn!(%error, "failed to query due messages");
                continue;
            }
        };
        for message in due {
            if let Err(error) = deliver_due_message(&bus, message).await {
                warn!(%error, "failed to deliver due message");
            }
        }
    }
    debug!("timeout poller stopped");
}

/// Sends one due envelope to its recipient; the envelope is removed on
/// commit of that send, atomically with it
async fn deliver_due_message(bus: &Arc<BusInner>, due: Arc<dyn DueMessage>) -> BusResult<()> {
    let recipient = due
        .headers()
        .get(headers::DEFERRED_RECIPIENT)
        .or_else(|| due.headers().get(headers::RETURN_ADDRESS))
        .ok_or(BusError::MissingHeader {
            name: headers::DEFERRED_RECIPIENT,
        })?;
    let recipient = QueueAddress::try_new(recipient.to_string())
        .map_err(|_| BusError::configuration("deferred-recipient is not a valid queue"))?;

    let mut delivered_headers = due.headers().clone();
    delivered_headers.remove(headers::DEFERRED_RECIPIENT);
    let message = TransportMessage::new(delivered_headers, due.body().clone());

    let transaction = Arc::new(TransactionContext::new());
    let mut ctx = StepContext::outgoing_raw(Arc::clone(&transaction), message, vec![recipient]);
    let outcome = match bus.invoker.invoke_outgoing(&mut ctx).await {
        Ok(()) => {
            let due = Arc::clone(&due);
            match transaction.on_commit(move || async move { due.mark_as_processed().await }) {
                Ok(()) => transaction.complete().await,
                Err(error) => Err(error),
            }
        }
        Err(error) => {
            if let Err(abort_error) = transaction.abort().await {
                warn!(%abort_error, "failed to abort due-message context");
            }
            Err(error)
        }
    };
    transaction.dispose().await;
    outcome
}

/// Periodic eviction of aged error tracker entries
async fn run_tracker_purge(
    tracker: Arc<ErrorTracker>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => tracker.purge_stale(),
        }
    }
    debug!("error tracker purge task stopped");
}
