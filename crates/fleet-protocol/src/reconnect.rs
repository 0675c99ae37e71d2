use serde::{Deserialize, Serialize};

use crate::envelope::{EventEnvelope, EventSource};
use crate::event::InstanceStatus;
use crate::ids::InstanceId;

/// Marker a disconnected observer sends to resynchronize: the last sequence
/// number it observed, or a wall-clock timestamp if it never saw a sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectRequest {
    pub source: EventSource,
    pub instance_id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<i64>,
}

impl ReconnectRequest {
    pub fn from_sequence(source: EventSource, instance_id: InstanceId, last_sequence: u64) -> Self {
        Self {
            source,
            instance_id,
            last_sequence: Some(last_sequence),
            last_timestamp: None,
        }
    }

    pub fn from_timestamp(
        source: EventSource,
        instance_id: InstanceId,
        last_timestamp: i64,
    ) -> Self {
        Self {
            source,
            instance_id,
            last_sequence: None,
            last_timestamp: Some(last_timestamp),
        }
    }
}

/// Everything strictly newer than the reconnect marker, in ascending order,
/// plus the instance's current status. `total_events` counts every event the
/// instance ever appended and is diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectResponse {
    pub source: EventSource,
    pub instance_id: InstanceId,
    pub events: Vec<EventEnvelope>,
    pub total_events: u64,
    pub status: InstanceStatus,
    pub timestamp: i64,
}
