//! Structured observability events.
//!
//! Retries, pool exhaustion, cache evictions/invalidations and refresh
//! failures are reported as an `Event {kind, timestamp, context}`. Events are
//! always written to `tracing`; callers that want them elsewhere (metrics,
//! audit channel) install an `EventSink`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RetryAttempt,
    RetryExhausted,
    PoolExhausted,
    ConnectionOpened,
    ConnectionRetired,
    CacheEviction,
    CacheInvalidation,
    CacheFallback,
    TransactionRolledBack,
    RefreshSucceeded,
    RefreshFailed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::RetryAttempt => "retry_attempt",
            EventKind::RetryExhausted => "retry_exhausted",
            EventKind::PoolExhausted => "pool_exhausted",
            EventKind::ConnectionOpened => "connection_opened",
            EventKind::ConnectionRetired => "connection_retired",
            EventKind::CacheEviction => "cache_eviction",
            EventKind::CacheInvalidation => "cache_invalidation",
            EventKind::CacheFallback => "cache_fallback",
            EventKind::TransactionRolledBack => "transaction_rolled_back",
            EventKind::RefreshSucceeded => "refresh_succeeded",
            EventKind::RefreshFailed => "refresh_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub context: Map<String, JsonValue>,
}

impl Event {
    pub fn new(kind: EventKind, context: JsonValue) -> Self {
        let context = match context {
            JsonValue::Object(map) => map,
            JsonValue::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("detail".to_string(), other);
                map
            }
        };
        Self {
            kind,
            timestamp: Utc::now(),
            context,
        }
    }
}

/// Receives every event emitted by the layer.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &Event);
}

/// Cheap-to-clone handle shared by all components.
#[derive(Clone, Default)]
pub struct Events {
    sink: Option<Arc<dyn EventSink>>,
}

impl Events {
    pub fn new(sink: Option<Arc<dyn EventSink>>) -> Self {
        Self { sink }
    }

    pub fn emit(&self, kind: EventKind, context: JsonValue) {
        let event = Event::new(kind, context);
        tracing::debug!(
            target: "storekit::events",
            kind = %event.kind,
            context = %JsonValue::Object(event.context.clone()),
            "event"
        );
        if let Some(sink) = &self.sink {
            sink.record(&event);
        }
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Events")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

/// Sink that keeps every event in memory, for tests.
#[cfg(test)]
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: parking_lot::Mutex<Vec<Event>>,
}

#[cfg(test)]
impl RecordingSink {
    pub(crate) fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[cfg(test)]
impl EventSink for RecordingSink {
    fn record(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}
