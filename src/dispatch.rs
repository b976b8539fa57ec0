//! Handler registry and dispatch
//!
//! Handlers are registered once, keyed by logical type name, and resolved
//! per message without any reflective construction on the hot path.
//! Registering a handler for `M` also registers `M`'s decoder with the
//! serializer's type registry, so an endpoint decodes exactly the types it
//! handles.
//!
//! Polymorphic dispatch is explicit: a message type may declare ancestors
//! via [`HandlerRegistry::declare_ancestor`], giving handlers of the more
//! general type a converted view of the message. Resolution walks the
//! runtime type first, then its declared ancestors depth-first in
//! declaration order.

use crate::serializer::{BusMessage, ErasedMessage, TypeRegistry};
use crate::transaction::TransactionContext;
use crate::transport::headers::{self, Headers};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;

use crate::bus::Bus;
use crate::saga::SagaRegistration;

/// A message handler.
///
/// Handlers for one message run sequentially within the same transaction
/// context; the first failure aborts the whole set and the message is
/// retried until it turns poison.
#[async_trait]
pub trait Handler<M: BusMessage>: Send + Sync + 'static {
    /// Handles one message
    async fn handle(&self, message: &M, ctx: &MessageContext) -> anyhow::Result<()>;
}

/// What a handler sees of the message being processed: its headers, the
/// owning transaction context, and the bus surface for sending from inside
/// the handler.
#[derive(Clone)]
pub struct MessageContext {
    bus: Bus,
    headers: Headers,
    transaction: Arc<TransactionContext>,
}

impl MessageContext {
    pub(crate) fn new(bus: Bus, headers: Headers, transaction: Arc<TransactionContext>) -> Self {
        Self {
            bus,
            headers,
            transaction,
        }
    }

    /// The bus, for replies and further sends from inside a handler.
    /// Everything sent here is enlisted in the ambient transaction and
    /// only leaves when the incoming message commits.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Headers of the message being handled
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// The `message-id` header
    pub fn message_id(&self) -> Option<&str> {
        self.headers.get(headers::MESSAGE_ID)
    }

    /// The `correlation-id` header
    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.get(headers::CORRELATION_ID)
    }

    /// The `return-address` header
    pub fn return_address(&self) -> Option<&str> {
        self.headers.get(headers::RETURN_ADDRESS)
    }

    /// The transaction context of the current unit of work
    pub fn transaction(&self) -> &Arc<TransactionContext> {
        &self.transaction
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("message_id", &self.message_id())
            .finish()
    }
}

pub(crate) type HandlerInvoker =
    Arc<dyn Fn(Arc<dyn ErasedMessage>, MessageContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) struct HandlerRegistration {
    pub(crate) invoke: HandlerInvoker,
}

type AncestorConverter =
    Arc<dyn Fn(&dyn ErasedMessage) -> Option<Arc<dyn ErasedMessage>> + Send + Sync>;

struct AncestorLink {
    ancestor_type: &'static str,
    convert: AncestorConverter,
}

/// Registry of handlers, saga handlers, decoders and ancestor links,
/// keyed by logical message type name
pub struct HandlerRegistry {
    types: Arc<TypeRegistry>,
    handlers: DashMap<String, Vec<HandlerRegistration>>,
    sagas: DashMap<String, Vec<SagaRegistration>>,
    ancestors: DashMap<String, Vec<AncestorLink>>,
}

impl HandlerRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self {
            types: Arc::new(TypeRegistry::new()),
            handlers: DashMap::new(),
            sagas: DashMap::new(),
            ancestors: DashMap::new(),
        }
    }

    /// The decoder registry shared with the serializer
    pub fn types(&self) -> Arc<TypeRegistry> {
        Arc::clone(&self.types)
    }

    /// Registers a handler for a message type
    pub fn register<M, H>(&self, handler: H)
    where
        M: BusMessage,
        H: Handler<M>,
    {
        self.types.register::<M>();
        let handler = Arc::new(handler);
        let invoke: HandlerInvoker = Arc::new(move |message, ctx| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let typed = message
                    .as_any()
                    .downcast_ref::<M>()
                    .ok_or_else(|| anyhow::anyhow!("message body is not a {}", M::message_type()))?;
                handler.handle(typed, &ctx).await
            })
        });
        self.handlers
            .entry(M::message_type().to_string())
            .or_default()
            .push(HandlerRegistration { invoke });
    }

    /// Declares `A` an ancestor of `M`: handlers registered for `A` also
    /// receive `M` messages, converted by `convert`. Ancestors compose
    /// transitively through `A`'s own declarations.
    pub fn declare_ancestor<M, A>(&self, convert: fn(&M) -> A)
    where
        M: BusMessage,
        A: BusMessage,
    {
        let link = AncestorLink {
            ancestor_type: A::message_type(),
            convert: Arc::new(move |message| {
                message
                    .as_any()
                    .downcast_ref::<M>()
                    .map(|typed| Arc::new(convert(typed)) as Arc<dyn ErasedMessage>)
            }),
        };
        self.ancestors
            .entry(M::message_type().to_string())
            .or_default()
            .push(link);
    }

    pub(crate) fn register_saga_entry(&self, message_type: &'static str, entry: SagaRegistration) {
        self.sagas
            .entry(message_type.to_string())
            .or_default()
            .push(entry);
    }

    /// Resolves the dispatch chain for a message: the runtime type first,
    /// then declared ancestors depth-first in declaration order, each with
    /// its converted body. Duplicate types are visited once.
    pub(crate) fn resolve_chain(
        &self,
        message: Arc<dyn ErasedMessage>,
    ) -> Vec<(String, Arc<dyn ErasedMessage>)> {
        let mut chain = Vec::new();
        let mut visited = std::collections::HashSet::new();
        self.walk(message, &mut chain, &mut visited);
        chain
    }

    fn walk(
        &self,
        message: Arc<dyn ErasedMessage>,
        chain: &mut Vec<(String, Arc<dyn ErasedMessage>)>,
        visited: &mut std::collections::HashSet<String>,
    ) {
        let type_name = message.message_type().to_string();
        if !visited.insert(type_name.clone()) {
            return;
        }

        let links: Vec<(AncestorConverter, &'static str)> = self
            .ancestors
            .get(&type_name)
            .map(|links| {
                links
                    .iter()
                    .map(|link| (Arc::clone(&link.convert), link.ancestor_type))
                    .collect()
            })
            .unwrap_or_default();

        chain.push((type_name, Arc::clone(&message)));

        for (convert, ancestor_type) in links {
            if let Some(converted) = convert(message.as_ref()) {
                self.walk(converted, chain, visited);
            } else {
                tracing::warn!(ancestor_type, "ancestor conversion failed");
            }
        }
    }

    /// Clones the handler invokers for a type; the shard lock is released
    /// before anything is awaited
    pub(crate) fn handler_invokers(&self, message_type: &str) -> Vec<HandlerInvoker> {
        self.handlers
            .get(message_type)
            .map(|entry| entry.iter().map(|r| Arc::clone(&r.invoke)).collect())
            .unwrap_or_default()
    }

    pub(crate) fn saga_registrations(&self, message_type: &str) -> Vec<SagaRegistration> {
        self.sagas
            .get(message_type)
            .map(|entry| entry.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// True when any handler (regular or saga) is registered for the type
    pub fn handles(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type) || self.sagas.contains_key(message_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handled_types", &self.handlers.len())
            .field("saga_types", &self.sagas.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
    }

    impl BusMessage for OrderPlaced {
        fn message_type() -> &'static str {
            "orders.placed"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct OrderEvent {
        order_id: String,
    }

    impl BusMessage for OrderEvent {
        fn message_type() -> &'static str {
            "orders.event"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct AuditableEvent {
        description: String,
    }

    impl BusMessage for AuditableEvent {
        fn message_type() -> &'static str {
            "audit.event"
        }
    }

    #[test]
    fn chain_starts_with_the_runtime_type() {
        let registry = HandlerRegistry::new();
        let message: Arc<dyn ErasedMessage> = Arc::new(OrderPlaced {
            order_id: "o-1".to_string(),
        });

        let chain = registry.resolve_chain(message);
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].0, "orders.placed");
    }

    #[test]
    fn ancestors_resolve_transitively_deepest_first() {
        let registry = HandlerRegistry::new();
        registry.declare_ancestor::<OrderPlaced, OrderEvent>(|placed| OrderEvent {
            order_id: placed.order_id.clone(),
        });
        registry.declare_ancestor::<OrderEvent, AuditableEvent>(|event| AuditableEvent {
            description: format!("order {}", event.order_id),
        });

        let message: Arc<dyn ErasedMessage> = Arc::new(OrderPlaced {
            order_id: "o-1".to_string(),
        });
        let chain = registry.resolve_chain(message);

        let names: Vec<&str> = chain.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, vec!["orders.placed", "orders.event", "audit.event"]);

        let audit = chain[2].1.as_any().downcast_ref::<AuditableEvent>().unwrap();
        assert_eq!(audit.description, "order o-1");
    }

    #[test]
    fn registering_a_handler_registers_the_decoder() {
        let registry = HandlerRegistry::new();
        struct NoopHandler;

        #[async_trait]
        impl Handler<OrderPlaced> for NoopHandler {
            async fn handle(
                &self,
                _message: &OrderPlaced,
                _ctx: &MessageContext,
            ) -> anyhow::Result<()> {
                Ok(())
            }
        }

        registry.register::<OrderPlaced, _>(NoopHandler);
        assert!(registry.types().knows("orders.placed"));
        assert!(registry.handles("orders.placed"));
    }
}
