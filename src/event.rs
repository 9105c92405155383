//! Events flowing through a serving graph.
//!
//! An event carries one unit of inbound work: an id that stays fixed for the
//! whole traversal, a JSON body that steps rewrite, the logical operation
//! path, and the transport trigger that delivered it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of transport that delivered the event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Http,
    Stream,
    Cron,
    #[default]
    None,
}

impl TriggerKind {
    /// Synchronous callers get fail-fast readiness semantics.
    pub fn is_synchronous(&self) -> bool {
        matches!(self, Self::Http | Self::None)
    }
}

/// Transport metadata attached to an event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Transport-specific source name (topic, schedule, route).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Trigger {
    pub fn new(kind: TriggerKind) -> Self {
        Self { kind, name: None }
    }
}

/// Request method. Health and metadata operations are only answered for `Get`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    #[default]
    Post,
}

/// One unit of inbound work traversing the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub body: Value,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub trigger: Trigger,
    /// Set by steps that answer the request themselves (health, metadata).
    #[serde(default)]
    pub terminated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Error message, populated for full-event error handlers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Name of the step that raised `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_state: Option<String>,
}

impl Event {
    /// Create a POST event with a freshly generated id.
    pub fn new(body: Value) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), body)
    }

    pub fn with_id(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
            path: String::new(),
            method: Method::Post,
            trigger: Trigger::default(),
            terminated: false,
            status_code: None,
            error: None,
            origin_state: None,
        }
    }

    /// Build an event from an optional caller-supplied id.
    pub fn from_request(id: Option<String>, body: Value) -> Self {
        match id.filter(|s| !s.is_empty()) {
            Some(id) => Self::with_id(id, body),
            None => Self::new(body),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn trigger(mut self, kind: TriggerKind) -> Self {
        self.trigger = Trigger::new(kind);
        self
    }

    /// Operation name: the path without surrounding slashes.
    pub fn operation(&self) -> &str {
        self.path.trim_matches('/')
    }

    /// Replace the body, keeping id, path and trigger.
    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    /// Mark the event as answered by the current step.
    pub fn terminate(mut self, status_code: u16, body: Value) -> Self {
        self.terminated = true;
        self.status_code = Some(status_code);
        self.body = body;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn generated_ids_are_unique() {
        let a = Event::new(json!({}));
        let b = Event::new(json!({}));
        assert_ne!(a.id, b.id);
        assert!(!a.id.is_empty());
    }

    #[test]
    fn from_request_keeps_supplied_id() {
        let event = Event::from_request(Some("req-1".into()), json!({"n": 1}));
        assert_eq!(event.id, "req-1");

        let event = Event::from_request(Some(String::new()), json!({}));
        assert!(!event.id.is_empty());
    }

    #[test]
    fn operation_strips_slashes() {
        let event = Event::new(json!({})).path("/infer/");
        assert_eq!(event.operation(), "infer");
    }

    #[test]
    fn trigger_sync_semantics() {
        assert!(TriggerKind::Http.is_synchronous());
        assert!(TriggerKind::None.is_synchronous());
        assert!(!TriggerKind::Stream.is_synchronous());
        assert!(!TriggerKind::Cron.is_synchronous());
    }

    #[test]
    fn event_deserializes_with_defaults() {
        let event: Event = serde_json::from_value(json!({"id": "x", "body": [1, 2]})).unwrap();
        assert_eq!(event.method, Method::Post);
        assert_eq!(event.trigger.kind, TriggerKind::None);
        assert!(!event.terminated);
    }
}
