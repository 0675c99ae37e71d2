use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::event::AgentEvent;
use crate::ids::{InstanceId, WorkspaceId};

/// Which component produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Instance,
    Worker,
}

/// Immutable, sequenced wrapper around every agent-produced event.
///
/// The sequence number is absent on first emission and assigned by the
/// instance's history; once assigned it is strictly increasing per instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub source: EventSource,
    pub instance_id: InstanceId,
    pub workspace_id: Option<WorkspaceId>,
    pub event: AgentEvent,
    /// Server wall clock, unix epoch milliseconds.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl EventEnvelope {
    pub fn new(
        source: EventSource,
        instance_id: InstanceId,
        workspace_id: Option<WorkspaceId>,
        event: AgentEvent,
    ) -> Self {
        Self {
            source,
            instance_id,
            workspace_id,
            event,
            timestamp: now_ms(),
            sequence: None,
        }
    }
}

/// Current wall clock as unix epoch milliseconds.
pub fn now_ms() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000) as i64
}
