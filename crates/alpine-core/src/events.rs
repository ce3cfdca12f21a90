//! Event data model (Section 3, Section 4.4).
//!
//! Events are append-only and ephemeral: nothing here is persisted. Each
//! event carries a `run_id`, a monotonically assigned per-run sequence
//! number, and a wall-clock timestamp, plus kind-specific payload fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{RunId, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    RunFinished,
    RunError,
    IterationStarted,
    IterationFinished,
    ToolCallStart,
    ToolCallEnd,
    StateSnapshot,
    StreamStart,
    StreamContent,
    StreamEnd,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::RunStarted => "run_started",
            EventType::RunFinished => "run_finished",
            EventType::RunError => "run_error",
            EventType::IterationStarted => "iteration_started",
            EventType::IterationFinished => "iteration_finished",
            EventType::ToolCallStart => "tool_call_start",
            EventType::ToolCallEnd => "tool_call_end",
            EventType::StateSnapshot => "state_snapshot",
            EventType::StreamStart => "stream_start",
            EventType::StreamContent => "stream_content",
            EventType::StreamEnd => "stream_end",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedPayload {
    pub task: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunErrorPayload {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationStartedPayload {
    pub iteration: u32,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationFinishedPayload {
    pub iteration: u32,
    pub duration_ms: u64,
    pub ok: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallStartPayload {
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallEndPayload {
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshotPayload {
    pub state: TaskState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStartPayload {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamContentPayload {
    pub chunk: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEndPayload {}

/// The union of all event payloads. `#[serde(untagged)]` so that on the
/// wire each variant serializes as its bare payload object; the `event:`
/// SSE field (derived from `event_type()`) carries the tag out of band.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    RunStarted(RunStartedPayload),
    RunFinished(RunFinishedPayload),
    RunError(RunErrorPayload),
    IterationStarted(IterationStartedPayload),
    IterationFinished(IterationFinishedPayload),
    ToolCallStart(ToolCallStartPayload),
    ToolCallEnd(ToolCallEndPayload),
    StateSnapshot(StateSnapshotPayload),
    StreamStart(StreamStartPayload),
    StreamContent(StreamContentPayload),
    StreamEnd(StreamEndPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::RunStarted(_) => EventType::RunStarted,
            EventPayload::RunFinished(_) => EventType::RunFinished,
            EventPayload::RunError(_) => EventType::RunError,
            EventPayload::IterationStarted(_) => EventType::IterationStarted,
            EventPayload::IterationFinished(_) => EventType::IterationFinished,
            EventPayload::ToolCallStart(_) => EventType::ToolCallStart,
            EventPayload::ToolCallEnd(_) => EventType::ToolCallEnd,
            EventPayload::StateSnapshot(_) => EventType::StateSnapshot,
            EventPayload::StreamStart(_) => EventType::StreamStart,
            EventPayload::StreamContent(_) => EventType::StreamContent,
            EventPayload::StreamEnd(_) => EventType::StreamEnd,
        }
    }
}

/// A single, fully-addressed event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub run_id: RunId,
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    /// Single-line JSON payload for the SSE `data:` field: `run_id`,
    /// `timestamp`, and the kind-specific fields, flattened.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
