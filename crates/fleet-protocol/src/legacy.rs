//! Translation between the current envelope and the two legacy wire shapes.
//!
//! Earlier producers tagged events by origin name (the agent binary for
//! first-generation frames, the worker slot for second-generation frames)
//! instead of carrying a unified event type. Both shapes translate into and
//! out of [`EventEnvelope`] for the kinds that map onto normalized events;
//! unknown kinds and malformed payloads yield `None`, never an error.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::envelope::{EventEnvelope, EventSource};
use crate::event::{AgentEvent, InstanceStatus};
use crate::ids::{InstanceId, WorkspaceId};

pub const LEGACY_KIND_OUTPUT: &str = "output";
pub const LEGACY_KIND_TASK_STARTED: &str = "task_started";
pub const LEGACY_KIND_TASK_COMPLETED: &str = "task_completed";
pub const LEGACY_KIND_STATUS: &str = "status";
pub const LEGACY_KIND_ERROR: &str = "error";

/// First-generation frame: events tagged by the emitting agent's name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyAgentFrame {
    pub agent: String,
    pub instance_id: InstanceId,
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

/// Second-generation frame: events tagged by worker slot with an explicit
/// workspace reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyWorkerFrame {
    pub worker: String,
    pub instance_id: InstanceId,
    pub workspace_id: Option<WorkspaceId>,
    pub kind: String,
    pub data: Value,
    pub timestamp: i64,
}

pub fn envelope_from_agent_frame(frame: &LegacyAgentFrame) -> Option<EventEnvelope> {
    let event = event_from_kind(&frame.kind, &frame.data)?;
    Some(EventEnvelope {
        source: EventSource::Instance,
        instance_id: frame.instance_id.clone(),
        workspace_id: None,
        event,
        timestamp: frame.timestamp,
        sequence: None,
    })
}

/// Projects an envelope back onto the first-generation shape. The agent name
/// is not part of the envelope and must be supplied by the caller.
pub fn agent_frame_from_envelope(
    envelope: &EventEnvelope,
    agent: impl Into<String>,
) -> Option<LegacyAgentFrame> {
    let (kind, data) = kind_from_event(&envelope.event)?;
    Some(LegacyAgentFrame {
        agent: agent.into(),
        instance_id: envelope.instance_id.clone(),
        kind: kind.to_owned(),
        data,
        timestamp: envelope.timestamp,
    })
}

pub fn envelope_from_worker_frame(frame: &LegacyWorkerFrame) -> Option<EventEnvelope> {
    let event = event_from_kind(&frame.kind, &frame.data)?;
    Some(EventEnvelope {
        source: EventSource::Worker,
        instance_id: frame.instance_id.clone(),
        workspace_id: frame.workspace_id.clone(),
        event,
        timestamp: frame.timestamp,
        sequence: None,
    })
}

pub fn worker_frame_from_envelope(
    envelope: &EventEnvelope,
    worker: impl Into<String>,
) -> Option<LegacyWorkerFrame> {
    let (kind, data) = kind_from_event(&envelope.event)?;
    Some(LegacyWorkerFrame {
        worker: worker.into(),
        instance_id: envelope.instance_id.clone(),
        workspace_id: envelope.workspace_id.clone(),
        kind: kind.to_owned(),
        data,
        timestamp: envelope.timestamp,
    })
}

fn event_from_kind(kind: &str, data: &Value) -> Option<AgentEvent> {
    match kind {
        LEGACY_KIND_OUTPUT => Some(AgentEvent::Output {
            text: data.get("text")?.as_str()?.to_owned(),
        }),
        LEGACY_KIND_TASK_STARTED => Some(AgentEvent::TaskStarted {
            task_id: data.get("taskId")?.as_str()?.to_owned(),
            title: data.get("title")?.as_str()?.to_owned(),
        }),
        LEGACY_KIND_TASK_COMPLETED => Some(AgentEvent::TaskCompleted {
            task_id: data.get("taskId")?.as_str()?.to_owned(),
        }),
        LEGACY_KIND_STATUS => {
            let status: InstanceStatus = serde_json::from_value(data.get("status")?.clone()).ok()?;
            Some(AgentEvent::StatusChanged { status })
        }
        LEGACY_KIND_ERROR => Some(AgentEvent::SessionFailed {
            reason: data.get("reason")?.as_str()?.to_owned(),
        }),
        _ => None,
    }
}

fn kind_from_event(event: &AgentEvent) -> Option<(&'static str, Value)> {
    match event {
        AgentEvent::Output { text } => Some((LEGACY_KIND_OUTPUT, json!({ "text": text }))),
        AgentEvent::TaskStarted { task_id, title } => Some((
            LEGACY_KIND_TASK_STARTED,
            json!({ "taskId": task_id, "title": title }),
        )),
        AgentEvent::TaskCompleted { task_id } => {
            Some((LEGACY_KIND_TASK_COMPLETED, json!({ "taskId": task_id })))
        }
        AgentEvent::StatusChanged { status } => {
            let status = serde_json::to_value(status).ok()?;
            Some((LEGACY_KIND_STATUS, json!({ "status": status })))
        }
        AgentEvent::SessionFailed { reason } => {
            Some((LEGACY_KIND_ERROR, json!({ "reason": reason })))
        }
        AgentEvent::IsolationFailed { .. }
        | AgentEvent::VerificationCompleted { .. }
        | AgentEvent::MergeCompleted { .. }
        | AgentEvent::TaskSourceError { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::{
        agent_frame_from_envelope, envelope_from_agent_frame, envelope_from_worker_frame,
        worker_frame_from_envelope, LegacyAgentFrame, LegacyWorkerFrame,
    };
    use crate::envelope::EventSource;
    use crate::event::{AgentEvent, InstanceStatus};
    use crate::ids::{InstanceId, WorkspaceId};

    fn agent_frame(kind: &str, data: serde_json::Value) -> LegacyAgentFrame {
        LegacyAgentFrame {
            agent: "claude".to_owned(),
            instance_id: InstanceId::new("inst-1"),
            kind: kind.to_owned(),
            data,
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn agent_frame_round_trips_for_mappable_kinds() {
        let frames = vec![
            agent_frame("output", json!({ "text": "building" })),
            agent_frame("task_started", json!({ "taskId": "t-1", "title": "Fix CI" })),
            agent_frame("task_completed", json!({ "taskId": "t-1" })),
            agent_frame("status", json!({ "status": "running" })),
            agent_frame("error", json!({ "reason": "agent exited 1" })),
        ];

        for frame in frames {
            let envelope = envelope_from_agent_frame(&frame).expect("translatable frame");
            assert_eq!(envelope.source, EventSource::Instance);
            assert_eq!(envelope.sequence, None);
            let back =
                agent_frame_from_envelope(&envelope, frame.agent.clone()).expect("reverse frame");
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn status_frame_translates_into_status_changed_event() {
        let frame = agent_frame("status", json!({ "status": "idle" }));
        let envelope = envelope_from_agent_frame(&frame).expect("translatable frame");
        assert_eq!(
            envelope.event,
            AgentEvent::StatusChanged {
                status: InstanceStatus::Idle
            }
        );
    }

    #[test]
    fn unknown_kind_is_untranslatable_not_an_error() {
        let frame = agent_frame("terminal_resize", json!({ "cols": 80 }));
        assert!(envelope_from_agent_frame(&frame).is_none());
    }

    #[test]
    fn malformed_payload_is_untranslatable() {
        let frame = agent_frame("output", json!({ "bytes": [1, 2, 3] }));
        assert!(envelope_from_agent_frame(&frame).is_none());
    }

    #[test]
    fn worker_frame_preserves_workspace_reference() {
        let frame = LegacyWorkerFrame {
            worker: "worker-2".to_owned(),
            instance_id: InstanceId::new("inst-7"),
            workspace_id: Some(WorkspaceId::new("ws-worker-2")),
            kind: "output".to_owned(),
            data: json!({ "text": "tests passed" }),
            timestamp: 1_700_000_000_500,
        };

        let envelope = envelope_from_worker_frame(&frame).expect("translatable frame");
        assert_eq!(envelope.source, EventSource::Worker);
        assert_eq!(envelope.workspace_id, frame.workspace_id);

        let back = worker_frame_from_envelope(&envelope, "worker-2").expect("reverse frame");
        assert_eq!(back, frame);
    }

    #[test]
    fn events_without_legacy_equivalents_project_to_none() {
        let envelope = crate::envelope::EventEnvelope::new(
            EventSource::Worker,
            InstanceId::new("inst-7"),
            None,
            AgentEvent::MergeCompleted {
                branch: "fleet/worker-1-job-1".to_owned(),
                had_conflicts: false,
            },
        );
        assert!(agent_frame_from_envelope(&envelope, "claude").is_none());
    }
}
