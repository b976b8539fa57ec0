//! Deferred-message scenarios: local timeout store, delivery timing, and
//! forwarding to an external timeout manager endpoint.

use async_trait::async_trait;
use omnibus::transport::inmem::{InMemNetwork, InMemTransport};
use omnibus::{
    Bus, BusMessage, Handler, InMemTimeoutStore, MessageContext, QueueAddress, RealTimeProvider,
    TimeoutTickIntervalMs,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
struct Ping(String);

impl BusMessage for Ping {
    fn message_type() -> &'static str {
        "Ping"
    }
}

struct ArrivalRecorder {
    arrivals: Arc<Mutex<Vec<Instant>>>,
}

#[async_trait]
impl Handler<Ping> for ArrivalRecorder {
    async fn handle(&self, _message: &Ping, _ctx: &MessageContext) -> anyhow::Result<()> {
        self.arrivals.lock().unwrap().push(Instant::now());
        Ok(())
    }
}

fn addr(name: &str) -> QueueAddress {
    QueueAddress::try_new(name.to_string()).unwrap()
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
async fn deferred_message_arrives_after_its_due_time_exactly_once() {
    let network = InMemNetwork::new();
    let input = addr("input");
    let store = InMemTimeoutStore::new(Arc::new(RealTimeProvider::new()));
    let arrivals = Arc::new(Mutex::new(Vec::new()));

    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .timeout_store(store.clone())
        .handlers({
            let arrivals = Arc::clone(&arrivals);
            move |registry| registry.register::<Ping, _>(ArrivalRecorder { arrivals })
        })
        .options(|options| {
            options.timeout_tick_interval = TimeoutTickIntervalMs::try_new(50).unwrap();
        })
        .start()
        .await
        .unwrap();

    let delay = Duration::from_millis(500);
    let deferred_at = Instant::now();
    bus.defer(delay, Ping("later".to_string())).await.unwrap();

    // The envelope is parked, not delivered
    assert!(wait_until(Duration::from_secs(1), || store.pending_count() == 1).await);
    assert!(arrivals.lock().unwrap().is_empty());

    assert!(
        wait_until(Duration::from_secs(3), || !arrivals.lock().unwrap().is_empty()).await,
        "deferred message never arrived"
    );
    let arrived_at = arrivals.lock().unwrap()[0];
    assert!(
        arrived_at.duration_since(deferred_at) >= delay,
        "delivered before the due time"
    );

    // No second delivery on later ticks
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(arrivals.lock().unwrap().len(), 1);
    assert_eq!(store.pending_count(), 0);

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn defer_through_an_external_timeout_manager_endpoint() {
    let network = InMemNetwork::new();
    let timeouts_queue = addr("timeouts");
    let client_queue = addr("client");

    // The timeouts endpoint hosts the store; it has no handlers of its own
    let store = InMemTimeoutStore::new(Arc::new(RealTimeProvider::new()));
    let timeout_manager = Bus::configure()
        .transport(InMemTransport::new(network.clone(), timeouts_queue.clone()))
        .timeout_store(store.clone())
        .options(|options| {
            options.timeout_tick_interval = TimeoutTickIntervalMs::try_new(50).unwrap();
        })
        .start()
        .await
        .unwrap();

    let arrivals = Arc::new(Mutex::new(Vec::new()));
    let client = Bus::configure()
        .transport(InMemTransport::new(network.clone(), client_queue.clone()))
        .defer_to(timeouts_queue.clone())
        .handlers({
            let arrivals = Arc::clone(&arrivals);
            move |registry| registry.register::<Ping, _>(ArrivalRecorder { arrivals })
        })
        .start()
        .await
        .unwrap();

    let deferred_at = Instant::now();
    let delay = Duration::from_millis(300);
    client.defer(delay, Ping("roundtrip".to_string())).await.unwrap();

    // The envelope lands in the remote store, then comes back to the client
    assert!(
        wait_until(Duration::from_secs(3), || !arrivals.lock().unwrap().is_empty()).await,
        "deferred message never returned from the timeouts endpoint"
    );
    let arrived_at = arrivals.lock().unwrap()[0];
    assert!(arrived_at.duration_since(deferred_at) >= delay);
    assert_eq!(store.pending_count(), 0);

    client.stop().await.unwrap();
    timeout_manager.stop().await.unwrap();
}

#[tokio::test]
async fn handler_can_defer_its_own_follow_up() {
    struct DeferringHandler {
        first_seen: Arc<AtomicUsize>,
        follow_ups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<Ping> for DeferringHandler {
        async fn handle(&self, message: &Ping, ctx: &MessageContext) -> anyhow::Result<()> {
            if message.0 == "start" {
                self.first_seen.fetch_add(1, Ordering::SeqCst);
                ctx.bus()
                    .defer(Duration::from_millis(150), Ping("follow-up".to_string()))
                    .await?;
            } else {
                self.follow_ups.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    let network = InMemNetwork::new();
    let input = addr("input");
    let first_seen = Arc::new(AtomicUsize::new(0));
    let follow_ups = Arc::new(AtomicUsize::new(0));

    let bus = Bus::configure()
        .transport(InMemTransport::new(network.clone(), input.clone()))
        .handlers({
            let first_seen = Arc::clone(&first_seen);
            let follow_ups = Arc::clone(&follow_ups);
            move |registry| {
                registry.register::<Ping, _>(DeferringHandler {
                    first_seen,
                    follow_ups,
                })
            }
        })
        .options(|options| {
            options.timeout_tick_interval = TimeoutTickIntervalMs::try_new(50).unwrap();
        })
        .start()
        .await
        .unwrap();

    bus.send_local(Ping("start".to_string())).await.unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || follow_ups.load(Ordering::SeqCst) == 1).await,
        "deferred follow-up never arrived"
    );
    assert_eq!(first_seen.load(Ordering::SeqCst), 1);

    bus.stop().await.unwrap();
}
