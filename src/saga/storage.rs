//! Saga persistence ports and the in-memory reference implementations

use crate::errors::SagaStorageError;
use crate::transport::headers::Headers;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A saga instance as persistence sees it: identity, revision, the
/// serialized domain state, and the correlation values indexing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSagaData {
    /// Saga instance id
    pub id: Uuid,
    /// Revision this row carries
    pub revision: u64,
    /// Stable saga data type name
    pub saga_type: String,
    /// Serialized domain state
    pub body: serde_json::Value,
    /// `(property, value)` pairs this instance is findable under
    pub correlations: Vec<(String, String)>,
}

/// Saga persistence port.
///
/// Implementations must enforce correlation-value uniqueness per
/// `(saga_type, property)` and the optimistic revision checks on update
/// and delete.
#[async_trait]
pub trait SagaStorage: Send + Sync {
    /// Finds the saga instance owning the given correlation value
    async fn find(
        &self,
        saga_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<StoredSagaData>, SagaStorageError>;

    /// Inserts a new saga instance
    async fn insert(&self, data: StoredSagaData) -> Result<(), SagaStorageError>;

    /// Updates an existing instance where the stored revision still equals
    /// `expected_revision`
    async fn update(
        &self,
        data: StoredSagaData,
        expected_revision: u64,
    ) -> Result<(), SagaStorageError>;

    /// Deletes a completed instance under the same revision guard
    async fn delete(&self, id: Uuid, expected_revision: u64) -> Result<(), SagaStorageError>;
}

/// Optional port for immutable saga snapshots keyed by `(id, revision)`
#[async_trait]
pub trait SagaSnapshotStorage: Send + Sync {
    /// Writes one snapshot of the persisted state plus audit metadata
    async fn save(
        &self,
        data: &StoredSagaData,
        audit_headers: &Headers,
    ) -> Result<(), SagaStorageError>;
}

type CorrelationKey = (String, String, String);

#[derive(Default)]
struct SagaStore {
    rows: HashMap<Uuid, StoredSagaData>,
    index: HashMap<CorrelationKey, Uuid>,
}

impl SagaStore {
    fn key(saga_type: &str, property: &str, value: &str) -> CorrelationKey {
        (
            saga_type.to_string(),
            property.to_string(),
            value.to_string(),
        )
    }

    fn check_uniqueness(&self, data: &StoredSagaData) -> Result<(), SagaStorageError> {
        for (property, value) in &data.correlations {
            let key = Self::key(&data.saga_type, property, value);
            if let Some(owner) = self.index.get(&key) {
                if *owner != data.id {
                    return Err(SagaStorageError::CorrelationConflict {
                        saga_type: data.saga_type.clone(),
                        property: property.clone(),
                        value: value.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    fn unindex(&mut self, id: Uuid) {
        if let Some(row) = self.rows.get(&id) {
            let keys: Vec<CorrelationKey> = row
                .correlations
                .iter()
                .map(|(property, value)| Self::key(&row.saga_type, property, value))
                .collect();
            for key in keys {
                self.index.remove(&key);
            }
        }
    }

    fn index(&mut self, data: &StoredSagaData) {
        for (property, value) in &data.correlations {
            self.index
                .insert(Self::key(&data.saga_type, property, value), data.id);
        }
    }
}

/// In-memory saga storage.
///
/// A single mutex guards rows and the correlation index together, so the
/// revision check and the uniqueness check are atomic with the write.
/// Clones share the underlying store.
#[derive(Clone, Default)]
pub struct InMemSagaStorage {
    store: Arc<Mutex<SagaStore>>,
}

impl InMemSagaStorage {
    /// Creates an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live saga instances
    pub fn saga_count(&self) -> usize {
        self.store.lock().expect("saga store poisoned").rows.len()
    }

    /// Looks a saga up by id, for assertions in tests
    pub fn get(&self, id: Uuid) -> Option<StoredSagaData> {
        self.store
            .lock()
            .expect("saga store poisoned")
            .rows
            .get(&id)
            .cloned()
    }

    /// Synchronous correlation lookup, for assertions in tests
    pub fn get_by_correlation(
        &self,
        saga_type: &str,
        property: &str,
        value: &str,
    ) -> Option<StoredSagaData> {
        let store = self.store.lock().expect("saga store poisoned");
        let id = store.index.get(&SagaStore::key(saga_type, property, value))?;
        store.rows.get(id).cloned()
    }

    /// Seeds a saga row directly, bypassing the uniqueness checks
    pub fn seed(&self, data: StoredSagaData) {
        let mut store = self.store.lock().expect("saga store poisoned");
        store.index(&data);
        store.rows.insert(data.id, data);
    }
}

#[async_trait]
impl SagaStorage for InMemSagaStorage {
    async fn find(
        &self,
        saga_type: &str,
        property: &str,
        value: &str,
    ) -> Result<Option<StoredSagaData>, SagaStorageError> {
        let store = self.store.lock().expect("saga store poisoned");
        let id = store.index.get(&SagaStore::key(saga_type, property, value));
        Ok(id.and_then(|id| store.rows.get(id)).cloned())
    }

    async fn insert(&self, data: StoredSagaData) -> Result<(), SagaStorageError> {
        let mut store = self.store.lock().expect("saga store poisoned");
        store.check_uniqueness(&data)?;
        store.index(&data);
        store.rows.insert(data.id, data);
        Ok(())
    }

    async fn update(
        &self,
        data: StoredSagaData,
        expected_revision: u64,
    ) -> Result<(), SagaStorageError> {
        let mut store = self.store.lock().expect("saga store poisoned");

        let current = store
            .rows
            .get(&data.id)
            .ok_or(SagaStorageError::NotFound { id: data.id })?;
        if current.revision != expected_revision {
            return Err(SagaStorageError::RevisionMismatch {
                id: data.id,
                expected: expected_revision,
                actual: current.revision,
            });
        }

        store.check_uniqueness(&data)?;
        store.unindex(data.id);
        store.index(&data);
        store.rows.insert(data.id, data);
        Ok(())
    }

    async fn delete(&self, id: Uuid, expected_revision: u64) -> Result<(), SagaStorageError> {
        let mut store = self.store.lock().expect("saga store poisoned");

        let current = store.rows.get(&id).ok_or(SagaStorageError::NotFound { id })?;
        if current.revision != expected_revision {
            return Err(SagaStorageError::RevisionMismatch {
                id,
                expected: expected_revision,
                actual: current.revision,
            });
        }

        store.unindex(id);
        store.rows.remove(&id);
        Ok(())
    }
}

impl std::fmt::Debug for InMemSagaStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemSagaStorage")
            .field("sagas", &self.saga_count())
            .finish()
    }
}

/// In-memory snapshot store keyed by `(id, revision)`
#[derive(Clone, Default)]
pub struct InMemSagaSnapshotStorage {
    snapshots: Arc<DashMap<(Uuid, u64), (StoredSagaData, Headers)>>,
}

impl InMemSagaSnapshotStorage {
    /// Creates an empty snapshot store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots written
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    /// Reads one snapshot back, for assertions in tests
    pub fn get(&self, id: Uuid, revision: u64) -> Option<(StoredSagaData, Headers)> {
        self.snapshots.get(&(id, revision)).map(|s| s.clone())
    }
}

#[async_trait]
impl SagaSnapshotStorage for InMemSagaSnapshotStorage {
    async fn save(
        &self,
        data: &StoredSagaData,
        audit_headers: &Headers,
    ) -> Result<(), SagaStorageError> {
        self.snapshots
            .insert((data.id, data.revision), (data.clone(), audit_headers.clone()));
        Ok(())
    }
}

impl std::fmt::Debug for InMemSagaSnapshotStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemSagaSnapshotStorage")
            .field("snapshots", &self.snapshots.len())
            .finish()
    }
}
