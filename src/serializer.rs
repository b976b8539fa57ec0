//! Serializer port and the JSON reference implementation
//!
//! A [`LogicalMessage`] is the decoded form of a [`TransportMessage`]: the
//! same headers plus a domain object instead of bytes. The serializer step
//! creates it early in the receive pipeline and collapses it back to a
//! transport message in the send pipeline.
//!
//! Message bodies are type-erased behind [`ErasedMessage`] so the pipeline
//! can carry any registered domain type; decoding goes through a
//! [`TypeRegistry`] keyed by logical type name, populated once at handler
//! registration and cached per type.

use crate::errors::{BusError, BusResult};
use crate::transport::headers::{self, Headers};
use crate::transport::TransportMessage;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::sync::Arc;

/// Media type stamped by the JSON serializer
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=utf-8";

/// A message type that can travel on the bus.
///
/// The logical type name doubles as the pub/sub topic for typed publishes;
/// override [`BusMessage::message_type`] when the default (the Rust type
/// path) is not the wire name you want.
pub trait BusMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Logical type name carried in the `type` header
    fn message_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Object-safe view of a decoded message body
pub trait ErasedMessage: Send + Sync {
    /// Downcast support for handler invocation
    fn as_any(&self) -> &(dyn Any + Send + Sync);

    /// Logical type name of the concrete message
    fn message_type(&self) -> &'static str;

    /// Serializes the body to a JSON value
    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error>;
}

impl<M: BusMessage> ErasedMessage for M {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn message_type(&self) -> &'static str {
        M::message_type()
    }

    fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}

/// A decoded message: headers plus the domain object
#[derive(Clone)]
pub struct LogicalMessage {
    /// Message headers, shared with the transport form
    pub headers: Headers,
    /// The decoded body
    pub body: Arc<dyn ErasedMessage>,
}

impl LogicalMessage {
    /// Wraps a concrete message with the given headers
    pub fn from_message<M: BusMessage>(headers: Headers, message: M) -> Self {
        Self {
            headers,
            body: Arc::new(message),
        }
    }

    /// Logical type name of the body
    pub fn message_type(&self) -> &'static str {
        self.body.message_type()
    }

    /// Attempts to view the body as a concrete type
    pub fn downcast_ref<M: BusMessage>(&self) -> Option<&M> {
        self.body.as_any().downcast_ref::<M>()
    }
}

impl std::fmt::Debug for LogicalMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalMessage")
            .field("message_type", &self.message_type())
            .field("headers", &self.headers)
            .finish()
    }
}

type Decoder = Arc<dyn Fn(&[u8]) -> Result<Arc<dyn ErasedMessage>, serde_json::Error> + Send + Sync>;

/// Decoders keyed by logical type name.
///
/// Registering a handler for a message type also registers its decoder
/// here, so the set of decodable types is exactly the set of handled types.
#[derive(Default)]
pub struct TypeRegistry {
    decoders: DashMap<String, Decoder>,
}

impl TypeRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the decoder for a message type; idempotent
    pub fn register<M: BusMessage>(&self) {
        self.decoders
            .entry(M::message_type().to_string())
            .or_insert_with(|| {
                Arc::new(|bytes: &[u8]| {
                    let message: M = serde_json::from_slice(bytes)?;
                    Ok(Arc::new(message) as Arc<dyn ErasedMessage>)
                })
            });
    }

    /// True when a decoder exists for the type name
    pub fn knows(&self, message_type: &str) -> bool {
        self.decoders.contains_key(message_type)
    }

    fn decoder(&self, message_type: &str) -> Option<Decoder> {
        self.decoders.get(message_type).map(|d| d.clone())
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.decoders.len())
            .finish()
    }
}

/// Serializer port: collapses logical messages to wire form and back
pub trait Serializer: Send + Sync {
    /// Encodes a logical message into its wire form
    fn serialize(&self, message: &LogicalMessage) -> BusResult<TransportMessage>;

    /// Decodes a wire message back into a logical message
    fn deserialize(&self, message: &TransportMessage) -> BusResult<LogicalMessage>;
}

/// JSON serializer over a [`TypeRegistry`]
pub struct JsonSerializer {
    types: Arc<TypeRegistry>,
}

impl JsonSerializer {
    /// Creates a serializer that decodes via the given registry
    pub fn new(types: Arc<TypeRegistry>) -> Self {
        Self { types }
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, message: &LogicalMessage) -> BusResult<TransportMessage> {
        let message_type = message.message_type();
        let value = message
            .body
            .to_json()
            .map_err(|source| BusError::Serialization {
                message_type: message_type.to_string(),
                source,
            })?;
        let body = serde_json::to_vec(&value).map_err(|source| BusError::Serialization {
            message_type: message_type.to_string(),
            source,
        })?;

        let mut headers = message.headers.clone();
        headers.insert_if_absent(headers::TYPE, message_type);
        headers.insert_if_absent(headers::CONTENT_TYPE, JSON_CONTENT_TYPE);

        Ok(TransportMessage::new(headers, body))
    }

    fn deserialize(&self, message: &TransportMessage) -> BusResult<LogicalMessage> {
        let message_type = message
            .message_type()
            .ok_or(BusError::MissingHeader {
                name: headers::TYPE,
            })?
            .to_string();

        let decoder = self
            .types
            .decoder(&message_type)
            .ok_or_else(|| BusError::UnknownMessageType {
                message_type: message_type.clone(),
            })?;

        let body = decoder(&message.body).map_err(|source| BusError::Serialization {
            message_type: message_type.clone(),
            source,
        })?;

        Ok(LogicalMessage {
            headers: message.headers.clone(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    impl BusMessage for Greeting {}

    fn serializer() -> JsonSerializer {
        let types = Arc::new(TypeRegistry::new());
        types.register::<Greeting>();
        JsonSerializer::new(types)
    }

    #[test]
    fn round_trips_the_domain_object() {
        let serializer = serializer();
        let original = Greeting {
            text: "hi".to_string(),
        };
        let logical = LogicalMessage::from_message(Headers::new(), original.clone());

        let wire = serializer.serialize(&logical).unwrap();
        assert_eq!(
            wire.message_type(),
            Some(<Greeting as BusMessage>::message_type())
        );
        assert_eq!(
            wire.headers.get(headers::CONTENT_TYPE),
            Some(JSON_CONTENT_TYPE)
        );

        let decoded = serializer.deserialize(&wire).unwrap();
        assert_eq!(decoded.downcast_ref::<Greeting>(), Some(&original));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let serializer = serializer();
        let mut headers = Headers::new();
        headers.insert(headers::TYPE, "nope");
        let wire = TransportMessage::new(headers, "{}");

        assert!(matches!(
            serializer.deserialize(&wire),
            Err(BusError::UnknownMessageType { .. })
        ));
    }

    #[test]
    fn missing_type_header_is_rejected() {
        let serializer = serializer();
        let wire = TransportMessage::new(Headers::new(), "{}");
        assert!(matches!(
            serializer.deserialize(&wire),
            Err(BusError::MissingHeader { .. })
        ));
    }

    #[test]
    fn malformed_body_is_a_serialization_error() {
        let serializer = serializer();
        let mut headers = Headers::new();
        headers.insert(headers::TYPE, <Greeting as BusMessage>::message_type());
        let wire = TransportMessage::new(headers, "not json");

        assert!(matches!(
            serializer.deserialize(&wire),
            Err(BusError::Serialization { .. })
        ));
    }
}
