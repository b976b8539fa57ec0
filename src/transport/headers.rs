//! Canonical header registry and the ordered header map
//!
//! The header dictionary is the stable wire contract: each transport maps
//! these names onto its own envelope. Keys are case-sensitive and
//! insertion order is preserved, so pass-through transports keep headers
//! byte-for-byte.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Unique id of the message; the retry step keys its tracking on this
pub const MESSAGE_ID: &str = "message-id";
/// Id linking a message to the conversation that caused it
pub const CORRELATION_ID: &str = "correlation-id";
/// Depth of the conversation chain, incremented per hop
pub const CORRELATION_SEQUENCE: &str = "correlation-sequence";
/// Queue address replies should be sent to
pub const RETURN_ADDRESS: &str = "return-address";
/// Queue the message was received from
pub const SOURCE_QUEUE: &str = "source-queue";
/// Messaging intent: [`INTENT_P2P`] or [`INTENT_PUB_SUB`]
pub const INTENT: &str = "intent";
/// Point-to-point intent value
pub const INTENT_P2P: &str = "p2p";
/// Publish/subscribe intent value
pub const INTENT_PUB_SUB: &str = "pub-sub";
/// ISO-8601 UTC timestamp stamped when the message was sent
pub const SENT_TIME: &str = "sent-time";
/// Logical type name of the message body
pub const TYPE: &str = "type";
/// Media type of the serialized body
pub const CONTENT_TYPE: &str = "content-type";
/// Optional body encoding (e.g. a compression scheme)
pub const CONTENT_ENCODING: &str = "content-encoding";
/// ISO-8601 due time of a deferred message
pub const DEFERRED_UNTIL: &str = "deferred-until";
/// Queue address a deferred message is delivered to when due
pub const DEFERRED_RECIPIENT: &str = "deferred-recipient";
/// Duration after which an undelivered message may be dropped
pub const TIME_TO_BE_RECEIVED: &str = "time-to-be-received";
/// Flag marking a message that may be delivered without durability
pub const EXPRESS: &str = "express";
/// Accumulated failure descriptions, stamped before dead-lettering
pub const ERROR_DETAILS: &str = "error-details";
/// Optional integer priority hint for transports that support it
pub const PRIORITY: &str = "priority";

/// Ordered mapping from header name to value.
///
/// Insertion order is preserved on iteration; replacing a value keeps the
/// key's original position. Keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header map
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Number of headers
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no headers are present
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Looks up a header value
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// True when the header is present
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Sets a header, returning the previous value. A replaced header
    /// keeps its original position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) -> Option<String> {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(key, _)| *key == name) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                self.0.push((name, value));
                None
            }
        }
    }

    /// Sets a header only when it is not already present
    pub fn insert_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.0.push((name.to_string(), value.into()));
        }
    }

    /// Removes a header, returning its value
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let index = self.0.iter().position(|(key, _)| key == name)?;
        Some(self.0.remove(index).1)
    }

    /// Iterates headers in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

impl<const N: usize> From<[(&str, &str); N]> for Headers {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

/// Formats a timestamp the way header values carry it: ISO-8601 UTC
pub fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses an ISO-8601 header value back into a UTC timestamp
pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|time| time.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn insertion_order_is_preserved() {
        let mut headers = Headers::new();
        headers.insert("b", "2");
        headers.insert("a", "1");
        headers.insert("c", "3");

        let keys: Vec<&str> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn replace_keeps_position() {
        let mut headers = Headers::from([("x", "1"), ("y", "2")]);
        assert_eq!(headers.insert("x", "9"), Some("1".to_string()));

        let entries: Vec<(&str, &str)> = headers.iter().collect();
        assert_eq!(entries, vec![("x", "9"), ("y", "2")]);
    }

    #[test]
    fn keys_are_case_sensitive() {
        let mut headers = Headers::new();
        headers.insert("Type", "upper");
        assert!(headers.get(TYPE).is_none());
        assert_eq!(headers.get("Type"), Some("upper"));
    }

    #[test]
    fn time_round_trips_through_header_format() {
        let now = Utc::now();
        let parsed = parse_time(&format_time(now)).unwrap();
        // Formatting keeps microsecond precision
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
    }

    proptest! {
        #[test]
        fn insert_then_remove_restores_absence(name in "[a-z-]{1,20}", value in ".{0,40}") {
            let mut headers = Headers::from([("seed", "v")]);
            prop_assume!(name != "seed");
            headers.insert(name.clone(), value);
            headers.remove(&name);
            prop_assert!(!headers.contains(&name));
            prop_assert_eq!(headers.len(), 1);
        }
    }
}
