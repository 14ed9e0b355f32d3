use std::collections::VecDeque;

use serde::Serialize;
use serde_with::hex::Hex;
use serde_with::serde_as;
use time::OffsetDateTime;

/// Number of notifications retained by default.
pub const DEFAULT_LOG_CAPACITY: usize = 100;

/// One value pushed by a subscribed characteristic.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct NotificationEvent {
    sequence: u64,
    service_uuid: String,
    characteristic_uuid: String,
    #[serde_as(as = "Hex")]
    value: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    received_at: OffsetDateTime,
}

impl NotificationEvent {
    #[must_use]
    pub fn new(
        sequence: u64,
        service_uuid: String,
        characteristic_uuid: String,
        value: Vec<u8>,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            sequence,
            service_uuid,
            characteristic_uuid,
            value,
            received_at,
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn service_uuid(&self) -> &str {
        &self.service_uuid
    }

    #[must_use]
    pub fn characteristic_uuid(&self) -> &str {
        &self.characteristic_uuid
    }

    #[must_use]
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// Returns the value as UTF-8 text when it decodes cleanly.
    #[must_use]
    pub fn value_as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }

    #[must_use]
    pub fn received_at(&self) -> OffsetDateTime {
        self.received_at
    }
}

/// Bounded notification history, newest first.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    entries: VecDeque<NotificationEvent>,
    capacity: usize,
}

impl Default for NotificationLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }
}

impl NotificationLog {
    /// Creates an empty log holding at most `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Prepends `event`, returning the oldest entry when it had to be evicted.
    pub fn push(&mut self, event: NotificationEvent) -> Option<NotificationEvent> {
        debug_assert!(
            self.entries
                .front()
                .is_none_or(|newest| newest.sequence < event.sequence),
            "notification sequence ids must increase"
        );
        self.entries.push_front(event);
        if self.entries.len() > self.capacity {
            return self.entries.pop_back();
        }
        None
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Returns the retained events, most recent first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<NotificationEvent> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
