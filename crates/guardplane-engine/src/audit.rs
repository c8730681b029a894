//! Structured audit events.
//!
//! Every manager records its mutations and fail-safe activations as
//! structured events with stable keys. The accumulated log is the
//! observability surface of the control plane; there is no separate
//! logging channel.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// A single structured audit event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Component that emitted the event (e.g. "kill_switch").
    pub component: String,
    /// Event name (e.g. "activate_emergency").
    pub event: String,
    /// Outcome: "ok", "denied", "fail_safe", "error".
    pub outcome: String,
    /// Actor responsible for the operation, if any.
    pub actor: Option<String>,
    /// Free-form detail (reason strings, issue summaries).
    pub detail: Option<String>,
    /// Stable error code when the outcome is an error.
    pub error_code: Option<String>,
    /// Epoch milliseconds at emission.
    pub ts_ms: i64,
}

/// Thread-safe accumulating audit log shared by all managers.
#[derive(Debug, Default)]
pub struct AuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. Lock poisoning drops the event rather than
    /// propagating a panic into a guard path.
    pub fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    /// Snapshot of all accumulated events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Drain accumulated events.
    pub fn drain(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|mut e| std::mem::take(&mut *e))
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Builder-style constructor for the common event shape.
pub fn event(component: &str, name: &str, outcome: &str, ts_ms: i64) -> AuditEvent {
    AuditEvent {
        component: component.to_string(),
        event: name.to_string(),
        outcome: outcome.to_string(),
        actor: None,
        detail: None,
        error_code: None,
        ts_ms,
    }
}

impl AuditEvent {
    pub fn with_actor(mut self, actor: &str) -> Self {
        self.actor = Some(actor.to_string());
        self
    }

    pub fn with_detail(mut self, detail: &str) -> Self {
        self.detail = Some(detail.to_string());
        self
    }

    pub fn with_error_code(mut self, code: &str) -> Self {
        self.error_code = Some(code.to_string());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_drain() {
        let log = AuditLog::new();
        log.record(event("kill_switch", "kill_audio", "ok", 1).with_actor("ops"));
        log.record(event("flags", "set_enabled", "error", 2).with_error_code("GP-STOR-0003"));
        assert_eq!(log.len(), 2);

        let drained = log.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].actor.as_deref(), Some("ops"));
        assert_eq!(drained[1].error_code.as_deref(), Some("GP-STOR-0003"));
        assert!(log.is_empty());
    }

    #[test]
    fn event_serde_roundtrip() {
        let ev = event("fallback", "check", "ok", 42).with_detail("mode=none");
        let json = serde_json::to_string(&ev).unwrap();
        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, parsed);
    }
}
