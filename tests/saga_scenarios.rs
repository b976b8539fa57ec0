//! Saga engine scenarios: initiation, correlation, optimistic concurrency
//! under worker races, exclusive access, completion, and snapshotting.

use async_trait::async_trait;
use omnibus::transport::headers;
use omnibus::transport::inmem::{InMemNetwork, InMemTransport};
use omnibus::{
    Bus, BusMessage, CorrelationProperty, Headers, InMemSagaSnapshotStorage, InMemSagaStorage,
    MessageContext, QueueAddress, SagaData, SagaHandler, SagaInstance, StoredSagaData,
    TransportMessage, WorkerCount,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CounterSagaData {
    id: Uuid,
    revision: u64,
    customer: String,
    counter: u32,
}

impl SagaData for CounterSagaData {
    fn id(&self) -> Uuid {
        self.id
    }

    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    fn saga_type() -> &'static str {
        "CounterSaga"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Increment {
    customer: String,
}

impl BusMessage for Increment {
    fn message_type() -> &'static str {
        "Increment"
    }
}

struct CounterSaga {
    invocations: Arc<AtomicUsize>,
    handler_delay: Duration,
    complete_at: Option<u32>,
    initiator: bool,
}

impl CounterSaga {
    fn new(invocations: Arc<AtomicUsize>) -> Self {
        Self {
            invocations,
            handler_delay: Duration::ZERO,
            complete_at: None,
            initiator: true,
        }
    }
}

#[async_trait]
impl SagaHandler<Increment> for CounterSaga {
    type Data = CounterSagaData;

    fn correlations(&self) -> Vec<CorrelationProperty<Increment, CounterSagaData>> {
        vec![CorrelationProperty::new(
            "customer",
            |message: &Increment| Some(message.customer.clone()),
            |data: &CounterSagaData| {
                (!data.customer.is_empty()).then(|| data.customer.clone())
            },
        )]
    }

    fn is_initiator(&self) -> bool {
        self.initiator
    }

    async fn handle(
        &self,
        saga: &mut SagaInstance<CounterSagaData>,
        message: &Increment,
        _ctx: &MessageContext,
    ) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        if saga.is_new() {
            saga.data.customer = message.customer.clone();
        }
        if !self.handler_delay.is_zero() {
            tokio::time::sleep(self.handler_delay).await;
        }
        saga.data.counter += 1;
        if self.complete_at == Some(saga.data.counter) {
            saga.mark_completed();
        }
        Ok(())
    }
}

fn addr(name: &str) -> QueueAddress {
    QueueAddress::try_new(name.to_string()).unwrap()
}

fn increment_message(id: &str, customer: &str) -> TransportMessage {
    TransportMessage::new(
        Headers::from([(headers::MESSAGE_ID, id), (headers::TYPE, "Increment")]),
        format!("{{\"customer\":\"{customer}\"}}"),
    )
}

fn seeded_saga(customer: &str) -> StoredSagaData {
    let data = CounterSagaData {
        id: Uuid::new_v4(),
        revision: 0,
        customer: customer.to_string(),
        counter: 0,
    };
    StoredSagaData {
        id: data.id,
        revision: 0,
        saga_type: "CounterSaga".to_string(),
        body: serde_json::to_value(&data).unwrap(),
        correlations: vec![("customer".to_string(), customer.to_string())],
    }
}

async fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn initiator_creates_saga_state_at_revision_zero() {
    let network = InMemNetwork::new();
    let input = addr("sagas");
    network.deliver(&input, increment_message("m1", "acme"));

    let storage = InMemSagaStorage::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .saga_storage(storage.clone())
        .handlers({
            let invocations = Arc::clone(&invocations);
            move |registry| registry.register_saga::<Increment, _>(CounterSaga::new(invocations))
        })
        .start()
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || storage.saga_count() == 1).await);
    assert!(wait_until(Duration::from_secs(2), || network.message_count(&input) == 0).await);

    let stored = storage.get_by_correlation("CounterSaga", "customer", "acme").unwrap();
    assert_eq!(stored.revision, 0);
    let data: CounterSagaData = serde_json::from_value(stored.body).unwrap();
    assert_eq!(data.counter, 1);
    assert_eq!(data.customer, "acme");
    assert_ne!(data.id, Uuid::nil());

    bus.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn concurrent_updates_resolve_via_revision_conflict_and_retry() {
    let network = InMemNetwork::new();
    let input = addr("sagas");
    // Both messages are queued before the bus starts, so the two workers
    // pick them up together.
    network.deliver(&input, increment_message("m1", "x"));
    network.deliver(&input, increment_message("m2", "x"));

    let storage = InMemSagaStorage::new();
    let seeded = seeded_saga("x");
    let saga_id = seeded.id;
    storage.seed(seeded);

    let invocations = Arc::new(AtomicUsize::new(0));
    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .saga_storage(storage.clone())
        .handlers({
            let invocations = Arc::clone(&invocations);
            move |registry| {
                registry.register_saga::<Increment, _>(CounterSaga {
                    invocations,
                    handler_delay: Duration::from_millis(300),
                    complete_at: None,
                    initiator: false,
                })
            }
        })
        .options(|options| {
            options.number_of_workers = WorkerCount::try_new(2).unwrap();
            // Disable the exclusive lock so the optimistic revision check
            // is what resolves the race
            options.enforce_exclusive_saga_access = false;
        })
        .start()
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            storage.get(saga_id).map(|row| row.revision) == Some(2)
        })
        .await,
        "saga never reached revision 2"
    );
    assert!(wait_until(Duration::from_secs(2), || network.message_count(&input) == 0).await);

    let stored = storage.get(saga_id).unwrap();
    let data: CounterSagaData = serde_json::from_value(stored.body).unwrap();
    assert_eq!(data.counter, 2, "both increments must land exactly once");

    // Two commits plus exactly one conflicting attempt that was retried
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(bus.error_tracker().failure_count("m1"), 0);
    assert_eq!(bus.error_tracker().failure_count("m2"), 0);

    bus.stop().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn exclusive_access_serializes_workers_without_conflicts() {
    let network = InMemNetwork::new();
    let input = addr("sagas");
    network.deliver(&input, increment_message("m1", "x"));
    network.deliver(&input, increment_message("m2", "x"));

    let storage = InMemSagaStorage::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .saga_storage(storage.clone())
        .handlers({
            let invocations = Arc::clone(&invocations);
            move |registry| {
                registry.register_saga::<Increment, _>(CounterSaga {
                    invocations,
                    handler_delay: Duration::from_millis(200),
                    complete_at: None,
                    initiator: true,
                })
            }
        })
        .options(|options| {
            options.number_of_workers = WorkerCount::try_new(2).unwrap();
        })
        .start()
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            storage
                .get_by_correlation("CounterSaga", "customer", "x")
                .map(|row| row.revision)
                == Some(1)
        })
        .await
    );

    let stored = storage.get_by_correlation("CounterSaga", "customer", "x").unwrap();
    let data: CounterSagaData = serde_json::from_value(stored.body).unwrap();
    assert_eq!(data.counter, 2);
    // Serialized by the bucket lock: no conflicts, no retries
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(storage.saga_count(), 1);

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn completed_saga_state_is_deleted() {
    let network = InMemNetwork::new();
    let input = addr("sagas");
    network.deliver(&input, increment_message("m1", "acme"));
    network.deliver(&input, increment_message("m2", "acme"));

    let storage = InMemSagaStorage::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .saga_storage(storage.clone())
        .handlers({
            let invocations = Arc::clone(&invocations);
            move |registry| {
                registry.register_saga::<Increment, _>(CounterSaga {
                    invocations,
                    handler_delay: Duration::ZERO,
                    complete_at: Some(2),
                    initiator: true,
                })
            }
        })
        .start()
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        invocations.load(Ordering::SeqCst) == 2 && storage.saga_count() == 0
    })
    .await);

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn non_initiating_handler_skips_unknown_correlation() {
    let network = InMemNetwork::new();
    let input = addr("sagas");
    network.deliver(&input, increment_message("m1", "nobody"));

    let storage = InMemSagaStorage::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .saga_storage(storage.clone())
        .handlers({
            let invocations = Arc::clone(&invocations);
            move |registry| {
                registry.register_saga::<Increment, _>(CounterSaga {
                    invocations,
                    handler_delay: Duration::ZERO,
                    complete_at: None,
                    initiator: false,
                })
            }
        })
        .start()
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || network.message_count(&input) == 0).await);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
    assert_eq!(storage.saga_count(), 0);
    assert_eq!(network.message_count(&addr("error")), 0);

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn snapshots_are_written_per_revision() {
    let network = InMemNetwork::new();
    let input = addr("sagas");
    network.deliver(&input, increment_message("m1", "acme"));
    network.deliver(&input, increment_message("m2", "acme"));

    let storage = InMemSagaStorage::new();
    let snapshots = InMemSagaSnapshotStorage::new();
    let invocations = Arc::new(AtomicUsize::new(0));
    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .saga_storage(storage.clone())
        .saga_snapshots(snapshots.clone())
        .handlers({
            let invocations = Arc::clone(&invocations);
            move |registry| registry.register_saga::<Increment, _>(CounterSaga::new(invocations))
        })
        .start()
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || snapshots.snapshot_count() == 2).await);

    let stored = storage.get_by_correlation("CounterSaga", "customer", "acme").unwrap();
    let (first, audit) = snapshots.get(stored.id, 0).unwrap();
    assert_eq!(first.revision, 0);
    assert!(audit.get(headers::MESSAGE_ID).is_some());
    assert!(snapshots.get(stored.id, 1).is_some());

    bus.stop().await.unwrap();
}
