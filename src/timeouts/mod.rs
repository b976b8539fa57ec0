//! Timeout manager: durable storage for deferred messages
//!
//! A deferred message is parked here as an envelope of `(approximate due
//! time, headers, body)` until its due time passes. The bus polls
//! [`TimeoutManager::due_messages`] on a fixed tick and sends each due
//! envelope to its `deferred-recipient`; the envelope is removed
//! atomically with that send by enlisting [`DueMessage::mark_as_processed`]
//! on the send's commit.
//!
//! Delivery is guaranteed at or after the due time; the slack is the tick
//! period plus queueing delay.

mod inmem;
mod sqlite;

pub use inmem::InMemTimeoutStore;
pub use sqlite::SqliteTimeoutStore;

use crate::errors::BusResult;
use crate::transport::headers::Headers;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A deferred envelope whose due time has passed
#[async_trait]
pub trait DueMessage: Send + Sync {
    /// Headers of the original message (with `deferred-until` stripped)
    fn headers(&self) -> &Headers;

    /// Body of the original message
    fn body(&self) -> &Bytes;

    /// Removes the envelope from the store. Enlisted on commit of the
    /// re-delivery send; an envelope that is never marked is yielded
    /// again on a later tick (at-least-once).
    async fn mark_as_processed(&self) -> anyhow::Result<()>;
}

/// Durable store of deferred envelopes ordered by due time
#[async_trait]
pub trait TimeoutManager: Send + Sync {
    /// Parks a message until its approximate due time
    async fn defer(&self, due: DateTime<Utc>, headers: Headers, body: Bytes) -> BusResult<()>;

    /// The envelopes whose due time has passed, oldest first
    async fn due_messages(&self) -> BusResult<Vec<Arc<dyn DueMessage>>>;
}
