//! Observable event stream.
//!
//! Grounded in the teacher crate's `AgentEvent`/`OrchestrationEvent` callback
//! taxonomy (`event.rs`), adapted from a push-callback design to a
//! pull/replay design: the scheduler appends to a bounded per-task ring and
//! `submit_and_stream` subscribers replay it plus live events via
//! `tokio::sync::broadcast`.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::VecDeque;
use uuid::Uuid;

/// Kinds of observable transitions the runtime records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    NewMessage,
    ToolCall,
    ActionCall,
    ActionComplete,
    TaskComplete,
    TaskError,
    AgentError,
    BreakpointToolCall,
    Ping,
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            EventKind::NewMessage => "new_message",
            EventKind::ToolCall => "tool_call",
            EventKind::ActionCall => "action_call",
            EventKind::ActionComplete => "action_complete",
            EventKind::TaskComplete => "task_complete",
            EventKind::TaskError => "task_error",
            EventKind::AgentError => "agent_error",
            EventKind::BreakpointToolCall => "breakpoint_tool_call",
            EventKind::Ping => "ping",
        }
    }
}

/// `{id, kind, timestamp, description, task_id, extra}`.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: Uuid,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub task_id: Uuid,
    pub extra: Value,
}

impl EventRecord {
    pub fn new(
        kind: EventKind,
        task_id: Uuid,
        description: impl Into<String>,
        extra: Value,
        now: DateTime<Utc>,
        id: Uuid,
    ) -> Self {
        Self {
            id,
            kind,
            timestamp: now,
            description: description.into(),
            task_id,
            extra,
        }
    }
}

/// Bounded append-only ring of events for a single task. Overflow discards
/// the oldest entry and increments `dropped`, observable via the events
/// introspection endpoint.
#[derive(Debug)]
pub struct EventRing {
    capacity: usize,
    buf: VecDeque<EventRecord>,
    dropped: u64,
}

impl EventRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buf: VecDeque::with_capacity(capacity.min(64)),
            dropped: 0,
        }
    }

    pub fn push(&mut self, record: EventRecord) {
        if self.buf.len() >= self.capacity {
            self.buf.pop_front();
            self.dropped += 1;
        }
        self.buf.push_back(record);
    }

    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.buf.iter().cloned().collect()
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn ring_drops_oldest_on_overflow() {
        let mut ring = EventRing::new(2);
        for i in 0..3u32 {
            ring.push(EventRecord::new(
                EventKind::Ping,
                Uuid::nil(),
                format!("ping {}", i),
                json!({}),
                Utc::now(),
                Uuid::new_v4(),
            ));
        }
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.dropped_count(), 1);
        assert_eq!(ring.snapshot()[0].description, "ping 1");
    }
}
