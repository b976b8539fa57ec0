//! Time abstraction layer for testable time-dependent operations
//!
//! The error tracker's age-based eviction, the timeout manager's due-time
//! queries, and the `sent-time`/`deferred-until` headers all read the clock
//! through a [`TimeProvider`], so tests can pin or advance time without
//! conditional compilation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep as tokio_sleep;

/// Trait for providing time-related functionality
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Get the current UTC wall-clock time
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the specified duration
    async fn sleep(&self, duration: Duration);
}

/// Real time provider for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a new real time provider
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }
}

/// Manually-advanced time provider for tests.
///
/// `now()` returns a pinned instant until [`VirtualTimeProvider::advance`]
/// moves it forward; sleeps yield but do not wait.
#[derive(Debug, Clone)]
pub struct VirtualTimeProvider {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl VirtualTimeProvider {
    /// Creates a virtual clock starting at the current wall-clock time
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Creates a virtual clock pinned to the given instant
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Moves the clock forward
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("virtual clock poisoned");
        *now += chrono::Duration::from_std(delta).expect("delta out of range");
    }
}

impl Default for VirtualTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for VirtualTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("virtual clock poisoned")
    }

    async fn sleep(&self, _duration: Duration) {
        // Yield so concurrent tasks make progress, but never wait
        tokio::task::yield_now().await;
    }
}

/// Type alias for a shared time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;
