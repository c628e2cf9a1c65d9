//! Execution events
//!
//! The engine narrates a run through typed events fanned out to registered
//! listeners. Listener failures are logged and swallowed; observability
//! never fails a step. The audit trail is one listener among others.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowpilot_core::traits::AuditSink;
use flowpilot_core::types::{AuditEvent, AuditSeverity};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Types of execution events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    StepRetrying,
    StepCacheHit,
}

/// Event emitted during workflow execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub execution_id: String,
    pub step_id: Option<String>,
    pub data: Map<String, Value>,
}

impl ExecutionEvent {
    pub fn run(event_type: EventType, execution_id: &str) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            execution_id: execution_id.to_string(),
            step_id: None,
            data: Map::new(),
        }
    }

    pub fn step(event_type: EventType, execution_id: &str, step_id: &str) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            execution_id: execution_id.to_string(),
            step_id: Some(step_id.to_string()),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: &str, value: Value) -> Self {
        self.data.insert(key.to_string(), value);
        self
    }
}

/// Trait for event listeners
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()>;
}

/// Fan-out of events to listeners; errors never propagate
#[derive(Default, Clone)]
pub struct EventBus {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.listeners.push(listener);
    }

    pub async fn emit(&self, event: ExecutionEvent) {
        for listener in &self.listeners {
            if let Err(e) = listener.on_event(&event).await {
                warn!("event listener failed on {:?}: {}", event.event_type, e);
            }
        }
    }
}

/// Bridges execution events into the append-only audit trail
pub struct AuditEventListener {
    sink: Arc<dyn AuditSink>,
    user_id: String,
    resource_name: String,
}

impl AuditEventListener {
    pub fn new(sink: Arc<dyn AuditSink>, user_id: &str, resource_name: &str) -> Self {
        Self {
            sink,
            user_id: user_id.to_string(),
            resource_name: resource_name.to_string(),
        }
    }
}

#[async_trait]
impl EventListener for AuditEventListener {
    async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
        let severity = match event.event_type {
            EventType::RunFailed | EventType::StepFailed => AuditSeverity::Error,
            EventType::RunCancelled | EventType::StepRetrying => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        };
        let (entity_type, entity_id) = match &event.step_id {
            Some(step_id) => ("workflow_step", step_id.clone()),
            None => ("workflow_execution", event.execution_id.clone()),
        };
        self.sink
            .append(AuditEvent {
                action: serde_json::to_value(event.event_type)?
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                entity_type: entity_type.to_string(),
                entity_id,
                user_id: self.user_id.clone(),
                resource_name: self.resource_name.clone(),
                details: Value::Object(event.data.clone()),
                severity,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<EventType>>,
    }

    #[async_trait]
    impl EventListener for Recorder {
        async fn on_event(&self, event: &ExecutionEvent) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(event.event_type);
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventListener for Failing {
        async fn on_event(&self, _event: &ExecutionEvent) -> anyhow::Result<()> {
            anyhow::bail!("listener down")
        }
    }

    #[tokio::test]
    async fn test_fan_out_survives_failing_listener() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let mut bus = EventBus::new();
        bus.add_listener(Arc::new(Failing));
        bus.add_listener(recorder.clone());

        bus.emit(ExecutionEvent::run(EventType::RunStarted, "exec")).await;
        bus.emit(ExecutionEvent::step(EventType::StepCompleted, "exec", "s1"))
            .await;

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(*seen, vec![EventType::RunStarted, EventType::StepCompleted]);
    }
}
