//! In-memory error tracker
//!
//! Tracks delivery failures per message id so the retry step can decide
//! when a message has turned poison. Entries are evicted on successful
//! handling, when the message is dead-lettered, or by age when a message
//! simply stops arriving (a periodic purge task runs while the bus is
//! started).

use crate::domain_types::{ErrorEntryMaxAgeMs, MaxDeliveryAttempts};
use crate::errors::{BusError, render_error_chain};
use crate::time_provider::SharedTimeProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, trace};

/// Cap on the rendered `error-details` header value
const MAX_ERROR_DETAILS_LEN: usize = 32 * 1024;

#[derive(Debug, Clone)]
struct TrackedMessage {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    errors: Vec<String>,
}

/// Concurrent mapping of message id to failure history
pub struct ErrorTracker {
    entries: DashMap<String, TrackedMessage>,
    max_attempts: MaxDeliveryAttempts,
    max_age: ErrorEntryMaxAgeMs,
    time: SharedTimeProvider,
}

impl ErrorTracker {
    /// Creates a tracker with the given poison threshold and entry age cap
    pub fn new(
        max_attempts: MaxDeliveryAttempts,
        max_age: ErrorEntryMaxAgeMs,
        time: SharedTimeProvider,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            max_attempts,
            max_age,
            time,
        }
    }

    /// Records one failed delivery attempt
    pub fn register_error(&self, message_id: &str, error: &BusError) {
        let now = self.time.now();
        let rendered = render_error_chain(error);
        trace!(message_id, error = %rendered, "registering delivery failure");

        let mut entry = self
            .entries
            .entry(message_id.to_string())
            .or_insert_with(|| TrackedMessage {
                first_seen: now,
                last_seen: now,
                errors: Vec::new(),
            });
        entry.last_seen = now;
        entry.errors.push(rendered);
    }

    /// Number of failures recorded for the message
    pub fn failure_count(&self, message_id: &str) -> u32 {
        self.entries
            .get(message_id)
            .map(|entry| entry.errors.len() as u32)
            .unwrap_or(0)
    }

    /// True when the message has reached the poison threshold
    pub fn has_failed_too_many_times(&self, message_id: &str) -> bool {
        self.failure_count(message_id) >= self.max_attempts.as_u32()
    }

    /// Concatenated description of every recorded failure, capped at a
    /// fixed length for the `error-details` header
    pub fn error_details(&self, message_id: &str) -> Option<String> {
        let entry = self.entries.get(message_id)?;
        let mut details = entry.errors.join("; ");
        if details.len() > MAX_ERROR_DETAILS_LEN {
            details.truncate(MAX_ERROR_DETAILS_LEN);
            details.push_str(" (truncated)");
        }
        Some(details)
    }

    /// Forgets the message: called on successful handling and after
    /// dead-lettering
    pub fn clear(&self, message_id: &str) {
        if self.entries.remove(message_id).is_some() {
            trace!(message_id, "cleared error tracking");
        }
    }

    /// Removes entries whose last failure is older than the configured age
    pub fn purge_stale(&self) {
        let cutoff = self.time.now()
            - chrono::Duration::from_std(self.max_age.as_duration())
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.last_seen >= cutoff);
        let purged = before - self.entries.len();
        if purged > 0 {
            debug!(purged, "purged stale error tracker entries");
        }
    }

    /// Age of the oldest tracked entry, for diagnostics
    pub fn oldest_entry_age(&self) -> Option<chrono::Duration> {
        let now = self.time.now();
        self.entries
            .iter()
            .map(|entry| now - entry.first_seen)
            .max()
    }

    /// Number of messages currently tracked
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }
}

impl std::fmt::Debug for ErrorTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorTracker")
            .field("tracked", &self.entries.len())
            .field("max_attempts", &self.max_attempts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_provider::VirtualTimeProvider;
    use std::sync::Arc;
    use std::time::Duration;

    fn boom() -> BusError {
        BusError::handler(anyhow::anyhow!("boom"))
    }

    fn tracker(clock: &VirtualTimeProvider) -> ErrorTracker {
        ErrorTracker::new(
            MaxDeliveryAttempts::try_new(3).unwrap(),
            ErrorEntryMaxAgeMs::try_new(60_000).unwrap(),
            Arc::new(clock.clone()),
        )
    }

    #[test]
    fn poison_threshold_is_reached_after_max_attempts() {
        let clock = VirtualTimeProvider::new();
        let tracker = tracker(&clock);

        tracker.register_error("m1", &boom());
        tracker.register_error("m1", &boom());
        assert!(!tracker.has_failed_too_many_times("m1"));

        tracker.register_error("m1", &boom());
        assert!(tracker.has_failed_too_many_times("m1"));
        assert_eq!(tracker.failure_count("m1"), 3);
    }

    #[test]
    fn error_details_concatenate_every_failure() {
        let clock = VirtualTimeProvider::new();
        let tracker = tracker(&clock);
        for _ in 0..3 {
            tracker.register_error("m1", &boom());
        }

        let details = tracker.error_details("m1").unwrap();
        assert_eq!(details.matches("boom").count(), 3);
    }

    #[test]
    fn clear_forgets_the_message() {
        let clock = VirtualTimeProvider::new();
        let tracker = tracker(&clock);
        tracker.register_error("m1", &boom());
        tracker.clear("m1");
        assert_eq!(tracker.failure_count("m1"), 0);
        assert!(tracker.error_details("m1").is_none());
    }

    #[test]
    fn purge_removes_only_aged_entries() {
        let clock = VirtualTimeProvider::new();
        let tracker = tracker(&clock);

        tracker.register_error("old", &boom());
        clock.advance(Duration::from_secs(120));
        tracker.register_error("recent", &boom());

        tracker.purge_stale();
        assert_eq!(tracker.failure_count("old"), 0);
        assert_eq!(tracker.failure_count("recent"), 1);
    }

    #[test]
    fn details_are_capped() {
        let clock = VirtualTimeProvider::new();
        let tracker = tracker(&clock);
        let long = "x".repeat(20_000);
        for _ in 0..3 {
            tracker.register_error("m1", &BusError::handler(anyhow::anyhow!(long.clone())));
        }

        let details = tracker.error_details("m1").unwrap();
        assert!(details.len() <= MAX_ERROR_DETAILS_LEN + " (truncated)".len());
        assert!(details.ends_with("(truncated)"));
    }
}
