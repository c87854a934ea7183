//! Event observers.
//!
//! State transitions are announced to an explicit observer list,
//! consumed synchronously on the thread that caused the transition.
//! Observers must be cheap and non-blocking; anything slow should hand
//! off to its own channel.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Notable state transitions in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwitchboardEvent {
    ServerRegistered { name: String },
    ServerUnregistered { name: String },
    ServerMarkedInactive { name: String },
    MetricsUpdated { name: String },
    DecisionCached { server: String },
    SnapshotFlushed { interactions: usize },
    PatternsPruned { count: usize },
}

/// Synchronous event consumer.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &SwitchboardEvent);
}

/// Explicit observer list. Publishing walks the current subscribers in
/// subscription order.
#[derive(Default)]
pub struct EventBus {
    observers: Mutex<Vec<Arc<dyn EventObserver>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn EventObserver>) {
        self.observers.lock().unwrap().push(observer);
    }

    pub fn publish(&self, event: &SwitchboardEvent) {
        let observers = self.observers.lock().unwrap().clone();
        for observer in observers {
            observer.on_event(event);
        }
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

// ============================================================================
// Tests
// ============================================================================
