//! In-memory timeout store

use super::{DueMessage, TimeoutManager};
use crate::errors::BusResult;
use crate::time_provider::SharedTimeProvider;
use crate::transport::headers::Headers;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Envelope key: due time in unix milliseconds plus an insertion sequence
/// so envelopes with equal due times stay ordered
type EnvelopeKey = (i64, u64);

#[derive(Debug, Clone)]
struct Envelope {
    headers: Headers,
    body: Bytes,
}

/// Timeout store backed by an ordered in-memory map.
///
/// Clones share the underlying store, so a test can hold one handle while
/// the bus polls another.
#[derive(Clone)]
pub struct InMemTimeoutStore {
    envelopes: Arc<Mutex<BTreeMap<EnvelopeKey, Envelope>>>,
    sequence: Arc<AtomicU64>,
    time: SharedTimeProvider,
}

impl InMemTimeoutStore {
    /// Creates an empty store reading the given clock
    pub fn new(time: SharedTimeProvider) -> Self {
        Self {
            envelopes: Arc::new(Mutex::new(BTreeMap::new())),
            sequence: Arc::new(AtomicU64::new(0)),
            time,
        }
    }

    /// Number of envelopes currently parked
    pub fn pending_count(&self) -> usize {
        self.envelopes.lock().expect("timeout store poisoned").len()
    }
}

#[async_trait]
impl TimeoutManager for InMemTimeoutStore {
    async fn defer(&self, due: DateTime<Utc>, headers: Headers, body: Bytes) -> BusResult<()> {
        let key = (
            due.timestamp_millis(),
            self.sequence.fetch_add(1, Ordering::Relaxed),
        );
        self.envelopes
            .lock()
            .expect("timeout store poisoned")
            .insert(key, Envelope { headers, body });
        Ok(())
    }

    async fn due_messages(&self) -> BusResult<Vec<Arc<dyn DueMessage>>> {
        let now = self.time.now().timestamp_millis();
        let envelopes = self.envelopes.lock().expect("timeout store poisoned");
        Ok(envelopes
            .range(..=(now, u64::MAX))
            .map(|(key, envelope)| {
                Arc::new(InMemDueMessage {
                    store: Arc::clone(&self.envelopes),
                    key: *key,
                    headers: envelope.headers.clone(),
                    body: envelope.body.clone(),
                }) as Arc<dyn DueMessage>
            })
            .collect())
    }
}

impl std::fmt::Debug for InMemTimeoutStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemTimeoutStore")
            .field("pending", &self.pending_count())
            .finish()
    }
}

struct InMemDueMessage {
    store: Arc<Mutex<BTreeMap<EnvelopeKey, Envelope>>>,
    key: EnvelopeKey,
    headers: Headers,
    body: Bytes,
}

#[async_trait]
impl DueMessage for InMemDueMessage {
    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn body(&self) -> &Bytes {
        &self.body
    }

    async fn mark_as_processed(&self) -> anyhow::Result<()> {
        self.store
            .lock()
            .expect("timeout store poisoned")
            .remove(&self.key);
        Ok(())
    }
}
