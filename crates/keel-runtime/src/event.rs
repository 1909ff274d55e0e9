//! Event log handed to plugins and actions.
//!
//! Every entry is kept in memory (so callers can report what happened during an apply) and
//! forwarded to the configured sinks. The default sink mirrors events to `tracing`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// One log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event ID.
    pub id: Uuid,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    pub level: EventLevel,

    /// What the event is about, e.g. an action id or an instance key.
    pub scope: String,

    pub message: String,

    /// Structured details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub fields: serde_json::Value,
}

/// Destination for events besides the in-memory buffer.
pub trait EventSink: Send + Sync {
    fn record(&self, event: &Event);
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn record(&self, event: &Event) {
        let fields = &event.fields;
        match event.level {
            EventLevel::Debug => {
                tracing::debug!(scope = %event.scope, %fields, "{}", event.message)
            }
            EventLevel::Info => tracing::info!(scope = %event.scope, %fields, "{}", event.message),
            EventLevel::Warn => tracing::warn!(scope = %event.scope, %fields, "{}", event.message),
            EventLevel::Error => {
                tracing::error!(scope = %event.scope, %fields, "{}", event.message)
            }
        }
    }
}

/// Shared, append-only event log. Clones and scoped children write to the same buffer.
#[derive(Clone)]
pub struct EventLog {
    scope: String,
    events: Arc<Mutex<Vec<Event>>>,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventLog {
    /// Create a log that mirrors to `tracing`.
    pub fn new(scope: impl Into<String>) -> Self {
        Self::with_sinks(scope, vec![Arc::new(TracingSink)])
    }

    /// Create a log with custom sinks (none keeps events in memory only).
    pub fn with_sinks(scope: impl Into<String>, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self {
            scope: scope.into(),
            events: Arc::new(Mutex::new(Vec::new())),
            sinks: Arc::new(sinks),
        }
    }

    /// A child log writing to the same buffer under another scope.
    pub fn scoped(&self, scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            events: self.events.clone(),
            sinks: self.sinks.clone(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn log(&self, level: EventLevel, message: impl Into<String>, fields: serde_json::Value) {
        let event = Event {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            level,
            scope: self.scope.clone(),
            message: message.into(),
            fields,
        };
        for sink in self.sinks.iter() {
            sink.record(&event);
        }
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.log(EventLevel::Debug, message, serde_json::Value::Null);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(EventLevel::Info, message, serde_json::Value::Null);
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.log(EventLevel::Warn, message, serde_json::Value::Null);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.log(EventLevel::Error, message, serde_json::Value::Null);
    }

    /// Snapshot of all events recorded so far, oldest first.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Events at or above `level`.
    pub fn events_at_least(&self, level: EventLevel) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.level >= level)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("scope", &self.scope)
            .field("events", &self.len())
            .finish()
    }
}
