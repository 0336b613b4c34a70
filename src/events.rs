//! Lifecycle events and their observers.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::Span;

use crate::error::{Error, Result};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxEventType {
    SandboxCreated,
    SandboxCleaned,
    ExecutionStarted,
    ExecutionEnded,
    ValidationFailed,
}

impl fmt::Display for SandboxEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxEventType::SandboxCreated => "sandbox_created",
            SandboxEventType::SandboxCleaned => "sandbox_cleaned",
            SandboxEventType::ExecutionStarted => "execution_started",
            SandboxEventType::ExecutionEnded => "execution_ended",
            SandboxEventType::ValidationFailed => "validation_failed",
        };
        f.write_str(s)
    }
}

/// A lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxEvent {
    pub event_type: SandboxEventType,
    /// Worktree ID, or the request ID for execution events.
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: HashMap<String, String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl SandboxEvent {
    pub fn new(event_type: SandboxEventType, sandbox_id: impl Into<String>) -> Self {
        Self {
            event_type,
            sandbox_id: sandbox_id.into(),
            timestamp: Utc::now(),
            data: HashMap::new(),
            error: None,
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.data.insert(key.into(), value.to_string());
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receives events synchronously from [`EventManager::emit`].
///
/// Observers run on the emitting task, so they should return quickly. Use a
/// [`ChannelObserver`] to hand events off to another task.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &SandboxEvent) -> Result<()>;
}

/// Handle returned by [`EventManager::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

struct Registry {
    next_id: u64,
    observers: Vec<(ObserverId, Arc<dyn EventObserver>)>,
}

/// Ordered observer registry with synchronous fan-out.
pub struct EventManager {
    registry: RwLock<Registry>,
    span: Span,
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new()
    }
}

impl EventManager {
    pub fn new() -> Self {
        Self::with_span(tracing::info_span!("events"))
    }

    pub fn with_span(span: Span) -> Self {
        Self {
            registry: RwLock::new(Registry {
                next_id: 0,
                observers: Vec::new(),
            }),
            span,
        }
    }

    /// Registers an observer; it will see events after those already registered.
    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) -> ObserverId {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let id = ObserverId(registry.next_id);
        registry.next_id += 1;
        registry.observers.push((id, observer));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.observers.len();
        registry.observers.retain(|(existing, _)| *existing != id);
        registry.observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .len()
    }

    /// Delivers `event` to every observer in registration order. Observer
    /// errors are logged and never reach the emitter.
    pub fn emit(&self, event: SandboxEvent) {
        let observers: Vec<_> = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        tracing::debug!(parent: &self.span, event = %event.event_type, sandbox_id = %event.sandbox_id, observers = observers.len(), "emitting event");

        for observer in observers {
            if let Err(e) = observer.on_event(&event) {
                tracing::warn!(parent: &self.span, event = %event.event_type, error = %e, "event observer failed");
            }
        }
    }
}

/// Forwards events to an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SandboxEvent>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<SandboxEvent>) -> Self {
        Self { tx }
    }

    /// Creates an observer and the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SandboxEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl EventObserver for ChannelObserver {
    fn on_event(&self, event: &SandboxEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| Error::Internal("event receiver dropped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
    }

    impl EventObserver for Recorder {
        fn on_event(&self, event: &SandboxEvent) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event.event_type));
            Ok(())
        }
    }

    struct Failing;

    impl EventObserver for Failing {
        fn on_event(&self, _event: &SandboxEvent) -> Result<()> {
            Err(Error::Internal("observer broke".to_string()))
        }
    }

    #[test]
    fn observers_run_in_registration_order() {
        let events = EventManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        events.add_observer(Arc::new(Recorder {
            name: "a",
            seen: Arc::clone(&seen),
        }));
        events.add_observer(Arc::new(Failing));
        events.add_observer(Arc::new(Recorder {
            name: "b",
            seen: Arc::clone(&seen),
        }));

        events.emit(SandboxEvent::new(SandboxEventType::SandboxCreated, "wt-1"));

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["a:sandbox_created", "b:sandbox_created"]
        );
    }

    #[test]
    fn removed_observers_stop_receiving() {
        let events = EventManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = events.add_observer(Arc::new(Recorder {
            name: "a",
            seen: Arc::clone(&seen),
        }));

        assert!(events.remove_observer(id));
        assert!(!events.remove_observer(id));
        assert_eq!(events.observer_count(), 0);

        events.emit(SandboxEvent::new(SandboxEventType::SandboxCleaned, "wt-1"));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn channel_observer_forwards_events() {
        let events = EventManager::new();
        let (observer, mut rx) = ChannelObserver::channel();
        events.add_observer(Arc::new(observer));

        events.emit(
            SandboxEvent::new(SandboxEventType::ExecutionEnded, "req-1")
                .with_data("status", "completed")
                .with_error("none"),
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, SandboxEventType::ExecutionEnded);
        assert_eq!(event.sandbox_id, "req-1");
        assert_eq!(event.data.get("status").map(String::as_str), Some("completed"));
        assert_eq!(event.error.as_deref(), Some("none"));
    }

    #[test]
    fn dropped_receiver_does_not_affect_emitter() {
        let events = EventManager::new();
        let (observer, rx) = ChannelObserver::channel();
        events.add_observer(Arc::new(observer));
        drop(rx);

        events.emit(SandboxEvent::new(SandboxEventType::ValidationFailed, "req-2"));
    }

    #[test]
    fn event_type_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&SandboxEventType::ValidationFailed).unwrap(),
            "\"validation_failed\""
        );
    }
}
