//! Lifecycle event model for the history subsystem
//!
//! Provides typed event emission for structural tree mutations

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Lifecycle event types emitted by the migration executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LifecycleEvent {
    ExecutionCreated {
        instance_id: String,
        execution_id: String,
        activity_id: Option<String>,
    },
    ExecutionEnded {
        instance_id: String,
        execution_id: String,
        activity_id: Option<String>,
    },
    ProcessInstanceStarted {
        instance_id: String,
        definition_id: String,
        super_instance_id: Option<String>,
    },
    ProcessInstanceEnded {
        instance_id: String,
        definition_id: String,
    },
}

impl LifecycleEvent {
    /// The process instance this event belongs to
    pub fn instance_id(&self) -> &str {
        match self {
            Self::ExecutionCreated { instance_id, .. }
            | Self::ExecutionEnded { instance_id, .. }
            | Self::ProcessInstanceStarted { instance_id, .. }
            | Self::ProcessInstanceEnded { instance_id, .. } => instance_id,
        }
    }
}

/// Event envelope with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub sequence: u64,
    pub timestamp: u64,
    pub event: LifecycleEvent,
}

/// Sink for consumers that want the raw event stream alongside the
/// history store (testing, audit taps)
pub trait HistorySink: Send + Sync {
    fn record(&self, envelope: &EventEnvelope);
}

/// A simple logging sink
pub struct LoggingHistorySink;

impl HistorySink for LoggingHistorySink {
    fn record(&self, envelope: &EventEnvelope) {
        tracing::debug!("Lifecycle event: {:?}", envelope);
    }
}

/// A buffering sink that collects envelopes
pub struct BufferingHistorySink {
    events: Arc<parking_lot::RwLock<Vec<EventEnvelope>>>,
}

impl BufferingHistorySink {
    pub fn new() -> Self {
        Self {
            events: Arc::new(parking_lot::RwLock::new(Vec::new())),
        }
    }

    pub fn get_events(&self) -> Vec<EventEnvelope> {
        self.events.read().clone()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }
}

impl Default for BufferingHistorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl HistorySink for BufferingHistorySink {
    fn record(&self, envelope: &EventEnvelope) {
        self.events.write().push(envelope.clone());
    }
}

/// Global sequence counter for envelopes
static EVENT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Get the next event sequence number
pub fn next_sequence() -> u64 {
    EVENT_SEQUENCE.fetch_add(1, Ordering::SeqCst)
}

/// Get current timestamp in milliseconds
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
