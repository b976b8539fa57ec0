//! Pub/sub scenarios: decentralized subscribe round-trips, centralized
//! storage, unsubscription, and publish semantics.

use async_trait::async_trait;
use omnibus::transport::inmem::{InMemNetwork, InMemTransport};
use omnibus::{
    Bus, BusMessage, Handler, InMemSubscriptionStorage, MessageContext, QueueAddress, TopicName,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PriceChanged {
    symbol: String,
    price: u64,
}

impl BusMessage for PriceChanged {
    fn message_type() -> &'static str {
        "PriceChanged"
    }
}

struct PriceRecorder {
    seen: Arc<Mutex<Vec<(String, u64)>>>,
}

#[async_trait]
impl Handler<PriceChanged> for PriceRecorder {
    async fn handle(&self, message: &PriceChanged, _ctx: &MessageContext) -> anyhow::Result<()> {
        self.seen
            .lock()
            .unwrap()
            .push((message.symbol.clone(), message.price));
        Ok(())
    }
}

fn addr(name: &str) -> QueueAddress {
    QueueAddress::try_new(name.to_string()).unwrap()
}

fn topic(name: &str) -> TopicName {
    TopicName::try_new(name.to_string()).unwrap()
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
async fn decentralized_subscribe_round_trip_delivers_exactly_once() {
    let network = InMemNetwork::new();
    let publisher_queue = addr("publisher");
    let subscriber_queue = addr("subscriber");

    let publisher_storage = InMemSubscriptionStorage::local();
    let publisher = Bus::configure()
        .transport(InMemTransport::new(network.clone(), publisher_queue.clone()))
        .subscription_storage(publisher_storage.clone())
        .start()
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Bus::configure()
        .transport(InMemTransport::new(network.clone(), subscriber_queue.clone()))
        .routes(|router| router.map::<PriceChanged>(addr("publisher")))
        .handlers({
            let seen = Arc::clone(&seen);
            move |registry| registry.register::<PriceChanged, _>(PriceRecorder { seen })
        })
        .start()
        .await
        .unwrap();

    subscriber.subscribe::<PriceChanged>().await.unwrap();

    // The subscribe request is a wire message; wait until the publisher
    // has handled it
    assert!(
        wait_until(Duration::from_secs(2), || {
            publisher_storage.is_subscribed(&topic("PriceChanged"), &subscriber_queue)
        })
        .await,
        "publisher never registered the subscriber"
    );

    publisher
        .publish(PriceChanged {
            symbol: "OMNI".to_string(),
            price: 42,
        })
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await,
        "event never reached the subscriber"
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*seen.lock().unwrap(), vec![("OMNI".to_string(), 42)]);

    subscriber.stop().await.unwrap();
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn centralized_storage_needs_no_round_trip() {
    let network = InMemNetwork::new();
    let shared = InMemSubscriptionStorage::centralized();

    let publisher = Bus::configure()
        .transport(InMemTransport::new(network.clone(), addr("publisher")))
        .subscription_storage(shared.clone())
        .start()
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Bus::configure()
        .transport(InMemTransport::new(network.clone(), addr("subscriber")))
        .subscription_storage(shared.clone())
        .handlers({
            let seen = Arc::clone(&seen);
            move |registry| registry.register::<PriceChanged, _>(PriceRecorder { seen })
        })
        .start()
        .await
        .unwrap();

    // Centralized: the subscriber mutates the shared store directly, no
    // routing to the publisher is needed
    subscriber.subscribe::<PriceChanged>().await.unwrap();
    assert!(shared.is_subscribed(&topic("PriceChanged"), &addr("subscriber")));

    publisher
        .publish(PriceChanged {
            symbol: "OMNI".to_string(),
            price: 7,
        })
        .await
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()).await);
    assert_eq!(seen.lock().unwrap().len(), 1);

    subscriber.stop().await.unwrap();
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn unsubscribed_endpoint_stops_receiving() {
    let network = InMemNetwork::new();
    let shared = InMemSubscriptionStorage::centralized();

    let publisher = Bus::configure()
        .transport(InMemTransport::new(network.clone(), addr("publisher")))
        .subscription_storage(shared.clone())
        .start()
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let subscriber = Bus::configure()
        .transport(InMemTransport::new(network.clone(), addr("subscriber")))
        .subscription_storage(shared.clone())
        .handlers({
            let seen = Arc::clone(&seen);
            move |registry| registry.register::<PriceChanged, _>(PriceRecorder { seen })
        })
        .start()
        .await
        .unwrap();

    subscriber.subscribe::<PriceChanged>().await.unwrap();
    subscriber.unsubscribe::<PriceChanged>().await.unwrap();
    assert!(!shared.is_subscribed(&topic("PriceChanged"), &addr("subscriber")));

    publisher
        .publish(PriceChanged {
            symbol: "OMNI".to_string(),
            price: 1,
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(seen.lock().unwrap().is_empty());

    subscriber.stop().await.unwrap();
    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn publish_without_subscribers_succeeds() {
    let network = InMemNetwork::new();
    let publisher = Bus::configure()
        .transport(InMemTransport::new(network, addr("publisher")))
        .start()
        .await
        .unwrap();

    publisher
        .publish(PriceChanged {
            symbol: "OMNI".to_string(),
            price: 0,
        })
        .await
        .unwrap();

    publisher.stop().await.unwrap();
}

#[tokio::test]
async fn publish_reaches_every_subscriber() {
    let network = InMemNetwork::new();
    let shared = InMemSubscriptionStorage::centralized();

    let publisher = Bus::configure()
        .transport(InMemTransport::new(network.clone(), addr("publisher")))
        .subscription_storage(shared.clone())
        .start()
        .await
        .unwrap();

    let mut subscribers = Vec::new();
    let mut seen_logs = Vec::new();
    for name in ["sub-a", "sub-b", "sub-c"] {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let bus = Bus::configure()
            .transport(InMemTransport::new(network.clone(), addr(name)))
            .subscription_storage(shared.clone())
            .handlers({
                let seen = Arc::clone(&seen);
                move |registry| registry.register::<PriceChanged, _>(PriceRecorder { seen })
            })
            .start()
            .await
            .unwrap();
        bus.subscribe::<PriceChanged>().await.unwrap();
        subscribers.push(bus);
        seen_logs.push(seen);
    }

    publisher
        .publish(PriceChanged {
            symbol: "OMNI".to_string(),
            price: 99,
        })
        .await
        .unwrap();

    for seen in &seen_logs {
        let seen = Arc::clone(seen);
        assert!(
            wait_until(Duration::from_secs(2), move || !seen.lock().unwrap().is_empty()).await,
            "a subscriber missed the event"
        );
    }

    for bus in subscribers {
        bus.stop().await.unwrap();
    }
    publisher.stop().await.unwrap();
}
