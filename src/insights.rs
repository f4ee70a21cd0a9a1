//! Write-only telemetry sink.

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use serde_json::Value;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsightsLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct InsightsEvent {
    pub group: &'static str,
    pub name: String,
    pub level: InsightsLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_sid: Option<String>,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl InsightsEvent {
    pub fn new(group: &'static str, name: impl Into<String>, level: InsightsLevel) -> Self {
        Self {
            group,
            name: name.into(),
            level,
            call_sid: None,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_call(mut self, call_sid: &str) -> Self {
        self.call_sid = Some(call_sid.to_string());
        self
    }

    pub fn with_payload(mut self, payload: impl Serialize) -> Self {
        self.payload = serde_json::to_value(payload).unwrap_or(Value::Null);
        self
    }
}

/// Receives telemetry. Implementations must not block.
pub trait InsightsSink: Send + Sync {
    fn publish(&self, event: InsightsEvent);
}

/// Logs every event at debug level.
#[derive(Debug, Default)]
pub struct LogInsightsSink;

impl InsightsSink for LogInsightsSink {
    fn publish(&self, event: InsightsEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => debug!(target: "Insights", "{json}"),
            Err(e) => debug!(target: "Insights", "{}/{}: unserializable payload: {e}", event.group, event.name),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemoryInsightsSink {
    events: Mutex<Vec<InsightsEvent>>,
}

impl MemoryInsightsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InsightsEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn named(&self, name: &str) -> Vec<InsightsEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.name == name)
            .collect()
    }
}

impl InsightsSink for MemoryInsightsSink {
    fn publish(&self, event: InsightsEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_sink_records_in_order() {
        let sink = MemoryInsightsSink::new();
        sink.publish(InsightsEvent::new("connection", "open", InsightsLevel::Info));
        sink.publish(
            InsightsEvent::new("call", "summary", InsightsLevel::Info)
                .with_call("CA1")
                .with_payload(json!({"samples": 3})),
        );
        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(sink.named("summary")[0].call_sid.as_deref(), Some("CA1"));
        assert_eq!(sink.named("summary")[0].payload["samples"], 3);
    }
}
