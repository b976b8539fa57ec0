//! Type-based routing
//!
//! Maps logical message types to destination queue addresses. The map is
//! supplied at configuration time, exact-match only; a missing mapping on
//! send is a [`BusError::Routing`] surfaced to the caller, never retried.

use crate::domain_types::QueueAddress;
use crate::errors::{BusError, BusResult};
use crate::serializer::BusMessage;
use dashmap::DashMap;

/// Destination lookup keyed by logical message type name.
///
/// For pub/sub the same mapping names the endpoint that owns a topic, so
/// decentralized subscribe requests know where to go.
#[derive(Debug, Default)]
pub struct Router {
    routes: DashMap<String, QueueAddress>,
}

impl Router {
    /// Creates an empty router
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a message type to a destination
    pub fn map<M: BusMessage>(&self, destination: QueueAddress) {
        self.map_type(M::message_type(), destination);
    }

    /// Maps a type by its logical name
    pub fn map_type(&self, message_type: impl Into<String>, destination: QueueAddress) {
        self.routes.insert(message_type.into(), destination);
    }

    /// Resolves the destination for a message type
    pub fn destination_for(&self, message_type: &str) -> BusResult<QueueAddress> {
        self.routes
            .get(message_type)
            .map(|route| route.clone())
            .ok_or_else(|| BusError::Routing {
                message_type: message_type.to_string(),
            })
    }

    /// Number of configured routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no routes are configured
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
