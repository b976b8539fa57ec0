//! Saga engine: lock-set computation, lookup, invocation, persistence

use super::{
    BucketLock, CorrelationProperty, SagaData, SagaEnv, SagaHandler, SagaInstance,
    SagaRegistration, SagaSnapshotStorage, SagaStorage, StoredSagaData,
};
use crate::dispatch::{HandlerRegistry, MessageContext};
use crate::errors::{BusError, BusResult, SagaStorageError};
use crate::serializer::{BusMessage, ErasedMessage};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

/// Mediates saga handler invocations: computes the lock set over every
/// saga registration interested in the message, acquires the buckets in
/// ascending order, runs the handlers, and releases in reverse.
pub struct SagaEngine {
    storage: Arc<dyn SagaStorage>,
    snapshots: Option<Arc<dyn SagaSnapshotStorage>>,
    lock: BucketLock,
    enforce_exclusive_access: bool,
}

impl SagaEngine {
    /// Creates an engine over the given storage and lock
    pub fn new(
        storage: Arc<dyn SagaStorage>,
        snapshots: Option<Arc<dyn SagaSnapshotStorage>>,
        lock: BucketLock,
        enforce_exclusive_access: bool,
    ) -> Self {
        Self {
            storage,
            snapshots,
            lock,
            enforce_exclusive_access,
        }
    }

    /// Runs every saga registration matching the dispatch chain.
    /// Returns the number of saga handlers invoked.
    pub(crate) async fn process(
        &self,
        registry: &HandlerRegistry,
        chain: &[(String, Arc<dyn ErasedMessage>)],
        ctx: &MessageContext,
        cancel: &CancellationToken,
    ) -> BusResult<usize> {
        let mut work: Vec<(SagaRegistration, Arc<dyn ErasedMessage>)> = Vec::new();
        for (type_name, message) in chain {
            for registration in registry.saga_registrations(type_name) {
                work.push((registration, Arc::clone(message)));
            }
        }
        if work.is_empty() {
            return Ok(0);
        }

        let _guard = if self.enforce_exclusive_access {
            Some(self.acquire_lock_set(&work, cancel).await?)
        } else {
            None
        };

        let env = SagaEnv {
            storage: Arc::clone(&self.storage),
            snapshots: self.snapshots.clone(),
        };
        let mut invoked = 0;
        for (registration, message) in work {
            (registration.invoke)(message, ctx.clone(), env.clone()).await?;
            invoked += 1;
        }
        Ok(invoked)
    }

    /// Builds the deduplicated, ascending bucket set over every
    /// correlation value of every interested saga handler, and acquires
    /// the buckets in that order. The global order makes concurrent
    /// workers deadlock-free.
    async fn acquire_lock_set(
        &self,
        work: &[(SagaRegistration, Arc<dyn ErasedMessage>)],
        cancel: &CancellationToken,
    ) -> BusResult<LockSetGuard<'_>> {
        let mut buckets = BTreeSet::new();
        for (registration, message) in work {
            for (property, value) in (registration.correlation_values)(message.as_ref()) {
                let lock_id = format!("{}:{}:{}", registration.saga_type, property, value);
                buckets.insert(self.lock.bucket_for(&lock_id));
            }
        }

        let mut guard = LockSetGuard {
            lock: &self.lock,
            held: Vec::with_capacity(buckets.len()),
        };
        for bucket in buckets {
            trace!(bucket, "acquiring saga lock bucket");
            if !self.lock.acquire(bucket, cancel).await {
                // Already-held buckets release via the guard
                return Err(BusError::handler(anyhow::anyhow!(
                    "saga lock acquisition cancelled"
                )));
            }
            guard.held.push(bucket);
        }
        Ok(guard)
    }
}

impl std::fmt::Debug for SagaEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaEngine")
            .field("exclusive_access", &self.enforce_exclusive_access)
            .field("lock_buckets", &self.lock.bucket_count())
            .finish()
    }
}

/// Releases held buckets in reverse acquisition order on every exit path
struct LockSetGuard<'a> {
    lock: &'a BucketLock,
    held: Vec<usize>,
}

impl Drop for LockSetGuard<'_> {
    fn drop(&mut self) {
        for bucket in self.held.iter().rev() {
            self.lock.release(*bucket);
        }
    }
}

/// The per-handler saga flow: find (or initiate), invoke, persist under
/// optimistic concurrency, snapshot.
pub(crate) async fn run_saga_handler<M, H>(
    handler: Arc<H>,
    spec: Arc<Vec<CorrelationProperty<M, H::Data>>>,
    is_initiator: bool,
    message: Arc<dyn ErasedMessage>,
    ctx: MessageContext,
    env: SagaEnv,
) -> BusResult<()>
where
    M: BusMessage,
    H: SagaHandler<M>,
{
    let saga_type = H::Data::saga_type();
    let typed = message
        .as_any()
        .downcast_ref::<M>()
        .ok_or_else(|| BusError::handler(anyhow::anyhow!("message body is not a {}", M::message_type())))?;

    let mut found: Option<StoredSagaData> = None;
    for property in spec.iter() {
        let Some(value) = property.message_value(typed) else {
            continue;
        };
        if let Some(stored) = env
            .storage
            .find(saga_type, property.property(), &value)
            .await?
        {
            found = Some(stored);
            break;
        }
    }

    let (mut instance, loaded_revision) = match found {
        Some(stored) => {
            let loaded_revision = stored.revision;
            let data: H::Data =
                serde_json::from_value(stored.body).map_err(|source| BusError::Serialization {
                    message_type: saga_type.to_string(),
                    source,
                })?;
            (SagaInstance::existing(data), loaded_revision)
        }
        None if is_initiator => {
            let mut data = H::Data::default();
            data.set_id(Uuid::new_v4());
            data.set_revision(0);
            debug!(saga_type, id = %data.id(), "initiating saga");
            (SagaInstance::fresh(data), 0)
        }
        None => {
            debug!(
                saga_type,
                message_type = M::message_type(),
                "no saga matches and handler is not an initiator; skipping"
            );
            return Ok(());
        }
    };

    handler
        .handle(&mut instance, typed, &ctx)
        .await
        .map_err(BusError::handler)?;

    persist(instance, loaded_revision, &spec, &ctx, &env).await
}

async fn persist<M, D>(
    mut instance: SagaInstance<D>,
    loaded_revision: u64,
    spec: &[CorrelationProperty<M, D>],
    ctx: &MessageContext,
    env: &SagaEnv,
) -> BusResult<()>
where
    D: SagaData,
{
    let saga_type = D::saga_type();
    let id = instance.data.id();

    if instance.is_completed() {
        if !instance.is_new() {
            env.storage
                .delete(id, loaded_revision)
                .await
                .map_err(|error| map_storage_error(error, saga_type, id, loaded_revision))?;
        }
        debug!(saga_type, %id, "saga completed");
        return Ok(());
    }

    let revision = if instance.is_new() {
        0
    } else {
        loaded_revision + 1
    };
    instance.data.set_revision(revision);

    let correlations: Vec<(String, String)> = spec
        .iter()
        .filter_map(|property| {
            property
                .data_value(&instance.data)
                .map(|value| (property.property().to_string(), value))
        })
        .collect();

    let body = serde_json::to_value(&instance.data).map_err(|source| BusError::Serialization {
        message_type: saga_type.to_string(),
        source,
    })?;
    let stored = StoredSagaData {
        id,
        revision,
        saga_type: saga_type.to_string(),
        body,
        correlations,
    };

    if instance.is_new() {
        env.storage
            .insert(stored.clone())
            .await
            .map_err(|error| map_storage_error(error, saga_type, id, loaded_revision))?;
    } else {
        env.storage
            .update(stored.clone(), loaded_revision)
            .await
            .map_err(|error| map_storage_error(error, saga_type, id, loaded_revision))?;
    }

    if let Some(snapshots) = &env.snapshots {
        snapshots.save(&stored, ctx.headers()).await?;
    }
    Ok(())
}

fn map_storage_error(
    error: SagaStorageError,
    saga_type: &'static str,
    id: Uuid,
    loaded_revision: u64,
) -> BusError {
    match error {
        SagaStorageError::RevisionMismatch { .. } | SagaStorageError::NotFound { .. } => {
            BusError::SagaConcurrencyConflict {
                saga_type: saga_type.to_string(),
                id,
                loaded_revision,
            }
        }
        SagaStorageError::CorrelationConflict {
            saga_type,
            property,
            value,
        } => BusError::SagaCorrelationConflict {
            saga_type,
            property,
            value,
        },
        other => BusError::SagaStorage { source: other },
    }
}
