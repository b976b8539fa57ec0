//! Transaction context: the per-message unit of work
//!
//! Every received message is processed inside a [`TransactionContext`]
//! carrying an item bag and four ordered callback lists. Transports enlist
//! their send/ack work on `on_commit`/`on_aborted`, steps park per-message
//! state in the item bag, and anything acquired inside a step registers its
//! release via `on_disposed`.
//!
//! Lifecycle: `Fresh -> (Completing -> Completed) | Aborted -> Disposed`.
//! Exactly one of completed/aborted holds before dispose, and dispose always
//! runs, with callbacks in reverse registration order.

use crate::errors::{BusError, BusResult};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

type Callback = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Lifecycle state of a transaction context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Created, neither completed nor aborted
    Fresh,
    /// `complete()` is running commit callbacks
    Completing,
    /// Commit callbacks succeeded and completed callbacks have run
    Completed,
    /// The unit of work was rolled back
    Aborted,
    /// Disposed callbacks have run; terminal
    Disposed,
}

impl ContextState {
    fn name(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Disposed => "disposed",
        }
    }
}

/// Scoped bag of items plus ordered commit/completed/aborted/disposed
/// callback lists governing one message-processing unit of work.
///
/// Not shared across worker boundaries: only the worker owning the context
/// (and the steps it runs) touch it.
pub struct TransactionContext {
    items: DashMap<String, Arc<dyn Any + Send + Sync>>,
    state: Mutex<ContextState>,
    on_commit: CallbackList,
    on_completed: CallbackList,
    on_aborted: CallbackList,
    on_disposed: CallbackList,
}

struct CallbackList {
    phase: &'static str,
    callbacks: Mutex<Vec<Callback>>,
    ran: AtomicBool,
}

impl CallbackList {
    fn new(phase: &'static str) -> Self {
        Self {
            phase,
            callbacks: Mutex::new(Vec::new()),
            ran: AtomicBool::new(false),
        }
    }

    fn push(&self, callback: Callback) -> BusResult<()> {
        if self.ran.load(Ordering::SeqCst) {
            return Err(BusError::IllegalContextState {
                state: self.phase,
                operation: "callback registration",
            });
        }
        self.callbacks
            .lock()
            .expect("callback list poisoned")
            .push(callback);
        Ok(())
    }

    /// Takes the registered callbacks, marking the phase as run.
    /// Later registrations against this phase fail.
    fn drain(&self) -> Vec<Callback> {
        self.ran.store(true, Ordering::SeqCst);
        std::mem::take(&mut *self.callbacks.lock().expect("callback list poisoned"))
    }
}

impl TransactionContext {
    /// Creates a fresh context
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            state: Mutex::new(ContextState::Fresh),
            on_commit: CallbackList::new("commit"),
            on_completed: CallbackList::new("completed"),
            on_aborted: CallbackList::new("aborted"),
            on_disposed: CallbackList::new("disposed"),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ContextState {
        *self.state.lock().expect("context state poisoned")
    }

    fn transition(&self, from: &[ContextState], to: ContextState, operation: &'static str) -> BusResult<()> {
        let mut state = self.state.lock().expect("context state poisoned");
        if !from.contains(&state) {
            return Err(BusError::IllegalContextState {
                state: state.name(),
                operation,
            });
        }
        *state = to;
        Ok(())
    }

    /// Stores an item in the bag, replacing any previous value under the key
    pub fn set_item<T: Send + Sync + 'static>(&self, key: &str, value: T) {
        self.items.insert(key.to_string(), Arc::new(value));
    }

    /// Reads a typed item from the bag
    pub fn get_item<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        let item = self.items.get(key)?.clone();
        item.downcast::<T>().ok()
    }

    /// Thread-safe memoization within the context: the factory runs at most
    /// once for a given key.
    pub fn get_or_add<T, F>(&self, key: &str, factory: F) -> BusResult<Arc<T>>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> T,
    {
        let entry = self
            .items
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(factory()) as Arc<dyn Any + Send + Sync>)
            .clone();
        entry.downcast::<T>().map_err(|_| BusError::ContextItemType {
            key: key.to_string(),
        })
    }

    /// Registers an asynchronous callback to run when the context commits.
    /// Commit callbacks run in registration order.
    pub fn on_commit<F, Fut>(&self, callback: F) -> BusResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_commit.push(Box::new(move || Box::pin(callback())))
    }

    /// Registers a callback to run after a successful commit
    pub fn on_completed<F, Fut>(&self, callback: F) -> BusResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_completed.push(Box::new(move || Box::pin(callback())))
    }

    /// Registers a callback to run when the context aborts
    pub fn on_aborted<F, Fut>(&self, callback: F) -> BusResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_aborted.push(Box::new(move || Box::pin(callback())))
    }

    /// Registers a callback to run on dispose. Disposed callbacks run in
    /// reverse registration order; their errors are logged, never thrown.
    pub fn on_disposed<F, Fut>(&self, callback: F) -> BusResult<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.on_disposed.push(Box::new(move || Box::pin(callback())))
    }

    /// Completes the unit of work: runs commit callbacks in registration
    /// order, then completed callbacks.
    ///
    /// The first failing commit callback aborts the context (aborted
    /// callbacks run) and its error is propagated.
    pub async fn complete(&self) -> BusResult<()> {
        self.transition(&[ContextState::Fresh], ContextState::Completing, "complete")?;

        for callback in self.on_commit.drain() {
            if let Err(error) = callback().await {
                debug!(%error, "commit callback failed; aborting context");
                self.transition(&[ContextState::Completing], ContextState::Aborted, "abort")?;
                self.run_aborted_callbacks().await;
                return Err(BusError::Callback {
                    phase: "commit",
                    source: error,
                });
            }
        }

        self.transition(&[ContextState::Completing], ContextState::Completed, "complete")?;

        for callback in self.on_completed.drain() {
            if let Err(error) = callback().await {
                return Err(BusError::Callback {
                    phase: "completed",
                    source: error,
                });
            }
        }

        Ok(())
    }

    /// Aborts the unit of work and runs aborted callbacks in registration
    /// order. Transports use these to return the received message.
    pub async fn abort(&self) -> BusResult<()> {
        self.transition(&[ContextState::Fresh], ContextState::Aborted, "abort")?;
        self.run_aborted_callbacks().await;
        Ok(())
    }

    async fn run_aborted_callbacks(&self) {
        for callback in self.on_aborted.drain() {
            if let Err(error) = callback().await {
                warn!(%error, "aborted callback failed");
            }
        }
    }

    /// Runs disposed callbacks in reverse registration order, swallowing
    /// (but logging) their errors. Always safe to call exactly once at the
    /// end of the unit of work.
    pub async fn dispose(&self) {
        {
            let mut state = self.state.lock().expect("context state poisoned");
            if matches!(*state, ContextState::Fresh | ContextState::Completing) {
                warn!(
                    state = state.name(),
                    "context disposed without complete or abort"
                );
            }
            *state = ContextState::Disposed;
        }

        let mut callbacks = self.on_disposed.drain();
        callbacks.reverse();
        for callback in callbacks {
            if let Err(error) = callback().await {
                warn!(%error, "disposed callback failed");
            }
        }
    }
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("state", &self.state())
            .field("items", &self.items.len())
            .finish()
    }
}
