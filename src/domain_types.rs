//! Domain types for the bus core
//!
//! Strongly-typed domain values for the service bus to prevent primitive
//! obsession and keep configuration values inside their valid ranges.

use nutype::nutype;
use std::time::Duration;

/// Address of a logical queue (an endpoint's input queue, the error queue,
/// a timeout manager endpoint, ...).
///
/// Transports map this to whatever addressing scheme they use on the wire.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 255),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct QueueAddress(String);

impl QueueAddress {
    /// Returns the address as a string slice
    pub fn as_str(&self) -> &str {
        self
    }
}

/// A publish/subscribe topic, derived from a logical message type name.
///
/// Topic strings are case-sensitive.
#[nutype(
    validate(len_char_min = 1, len_char_max = 1024),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        Deref
    )
)]
pub struct TopicName(String);

impl TopicName {
    /// Returns the topic as a string slice
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Number of receive workers. Zero means one-way client mode: the bus can
/// send and publish but never performs a receive call.
#[nutype(
    validate(less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1
)]
pub struct WorkerCount(usize);

impl WorkerCount {
    /// Gets the value as usize
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }

    /// True when this count configures a one-way client
    pub fn is_one_way(&self) -> bool {
        self.into_inner() == 0
    }
}

/// Upper bound on in-flight pipeline invocations per worker
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1024),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1
)]
pub struct MaxParallelism(usize);

impl MaxParallelism {
    /// Gets the value as usize for use with a semaphore
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Delivery attempts before a message is considered poison and dead-lettered
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 1000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 5
)]
pub struct MaxDeliveryAttempts(u32);

impl MaxDeliveryAttempts {
    /// Gets the value as u32
    pub fn as_u32(&self) -> u32 {
        self.into_inner()
    }
}

/// Number of buckets the saga exclusive-access lock is striped over.
///
/// More buckets trade memory for fewer hash collisions between unrelated
/// correlation values.
#[nutype(
    validate(greater_or_equal = 1, less_or_equal = 65536),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1024
)]
pub struct LockBucketCount(usize);

impl LockBucketCount {
    /// Gets the value as usize
    pub fn as_usize(&self) -> usize {
        self.into_inner()
    }
}

/// Timeout manager poll cadence in milliseconds
#[nutype(
    validate(greater_or_equal = 10, less_or_equal = 3_600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 1000
)]
pub struct TimeoutTickIntervalMs(u64);

impl TimeoutTickIntervalMs {
    /// Converts to a Duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Maximum wait for in-flight messages when the bus stops, in milliseconds
#[nutype(
    validate(greater_or_equal = 100, less_or_equal = 600_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 10_000
)]
pub struct DrainDeadlineMs(u64);

impl DrainDeadlineMs {
    /// Converts to a Duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

/// Age after which an idle error-tracker entry is purged, in milliseconds
#[nutype(
    validate(greater_or_equal = 1000, less_or_equal = 86_400_000),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Display,
        Default,
        TryFrom,
        Into
    ),
    default = 600_000
)]
pub struct ErrorEntryMaxAgeMs(u64);

impl ErrorEntryMaxAgeMs {
    /// Converts to a Duration
    pub fn as_duration(&self) -> Duration {
        Duration::from_millis(self.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_address_trims_and_rejects_empty() {
        let addr = QueueAddress::try_new("  orders  ".to_string()).unwrap();
        assert_eq!(addr.as_str(), "orders");
        assert!(QueueAddress::try_new("   ".to_string()).is_err());
    }

    #[test]
    fn worker_count_zero_is_one_way() {
        assert!(WorkerCount::try_new(0).unwrap().is_one_way());
        assert!(!WorkerCount::default().is_one_way());
        assert_eq!(WorkerCount::default().as_usize(), 1);
    }

    #[test]
    fn defaults_match_documented_values() {
        assert_eq!(MaxDeliveryAttempts::default().as_u32(), 5);
        assert_eq!(LockBucketCount::default().as_usize(), 1024);
        assert_eq!(
            TimeoutTickIntervalMs::default().as_duration(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        assert!(MaxParallelism::try_new(0).is_err());
        assert!(MaxDeliveryAttempts::try_new(0).is_err());
        assert!(TimeoutTickIntervalMs::try_new(1).is_err());
    }
}
