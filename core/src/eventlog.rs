//! Event Log (C10).
//!
//! An executor publishes structured events as it runs; a bounded in-memory
//! ring holds them per active run and is drained into durable storage on
//! completion (section 4.7).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    SubprocessSpawned,
    OutputLine,
    MetricSummary,
    AttemptComplete,
    Finish,
}

impl Event {
    pub fn start(correlation_id: Uuid, attempt_number: u32) -> Self {
        Self::new(
            EventKind::Start,
            serde_json::json!({ "correlation_id": correlation_id, "attempt_number": attempt_number }),
        )
    }

    pub fn subprocess_spawned(correlation_id: Uuid, pid: i32) -> Self {
        Self::new(
            EventKind::SubprocessSpawned,
            serde_json::json!({ "correlation_id": correlation_id, "pid": pid }),
        )
    }

    pub fn output_line(line: String) -> Self {
        Self::new(EventKind::OutputLine, serde_json::json!({ "line": line }))
    }

    pub fn metric_summary(correlation_id: Uuid) -> Self {
        Self::new(
            EventKind::MetricSummary,
            serde_json::json!({ "correlation_id": correlation_id }),
        )
    }

    pub fn attempt_complete(correlation_id: Uuid, attempt_number: u32, success: bool) -> Self {
        Self::new(
            EventKind::AttemptComplete,
            serde_json::json!({
                "correlation_id": correlation_id,
                "attempt_number": attempt_number,
                "success": success,
            }),
        )
    }

    pub fn finish(correlation_id: Uuid, exit_code: i32, success: bool) -> Self {
        Self::new(
            EventKind::Finish,
            serde_json::json!({
                "correlation_id": correlation_id,
                "exit_code": exit_code,
                "success": success,
            }),
        )
    }

    fn new(kind: EventKind, fields: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            fields,
        }
    }
}

/// Publishes events as an executor runs. Object-safe so it can be shared as
/// `Arc<dyn EventSink>` across spawned capture tasks.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
}

/// A sink that discards everything; used when a caller doesn't need live
/// event streaming (e.g. the CLI's direct, non-HTTP invocation).
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: Event) {}
}

/// Bounded ring of events for one active run, drained into durable storage
/// (stdout/metrics columns) on completion.
pub struct EventRing {
    capacity: usize,
    events: Mutex<VecDeque<Event>>,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn dump(&self) -> Vec<Event> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

impl EventSink for EventRing {
    fn publish(&self, event: Event) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Registry of event rings keyed by run id, so the HTTP control plane (C8)
/// can look up `/api/runs/{id}/events` for any currently-active run.
#[derive(Default)]
pub struct EventLog {
    rings: Mutex<HashMap<Uuid, std::sync::Arc<EventRing>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_ring(&self, run_id: Uuid, capacity: usize) -> std::sync::Arc<EventRing> {
        let ring = std::sync::Arc::new(EventRing::new(capacity));
        self.rings.lock().unwrap().insert(run_id, ring.clone());
        ring
    }

    pub fn get(&self, run_id: Uuid) -> Option<std::sync::Arc<EventRing>> {
        self.rings.lock().unwrap().get(&run_id).cloned()
    }

    pub fn remove(&self, run_id: Uuid) -> Option<std::sync::Arc<EventRing>> {
        self.rings.lock().unwrap().remove(&run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_drops_oldest_when_full() {
        let ring = EventRing::new(2);
        ring.publish(Event::start(Uuid::new_v4(), 1));
        ring.publish(Event::start(Uuid::new_v4(), 2));
        ring.publish(Event::start(Uuid::new_v4(), 3));
        let dumped = ring.dump();
        assert_eq!(dumped.len(), 2);
    }

    #[test]
    fn event_log_tracks_rings_by_run_id() {
        let log = EventLog::new();
        let run_id = Uuid::new_v4();
        let ring = log.create_ring(run_id, 16);
        ring.publish(Event::finish(run_id, 0, true));
        assert_eq!(log.get(run_id).unwrap().dump().len(), 1);
        assert!(log.remove(run_id).is_some());
        assert!(log.get(run_id).is_none());
    }
}
