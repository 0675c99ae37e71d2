use std::path::PathBuf;

use async_trait::async_trait;
use fleet_protocol::{now_ms, AgentEvent, InstanceId, InstanceStatus, WorkspaceId};

use crate::history::EventHistory;

/// Control surface of a live session attached to an instance. The registry
/// owns at most one handle per instance and stops it on dispose.
#[async_trait]
pub trait SessionControl: Send + Sync {
    /// Best-effort teardown; must not block on graceful shutdown.
    async fn stop(&self);
}

pub type SessionHandle = Box<dyn SessionControl>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub display_name: String,
    pub agent_name: String,
    pub status: InstanceStatus,
    pub workspace_path: Option<PathBuf>,
    pub workspace_id: Option<WorkspaceId>,
    pub branch: Option<String>,
    pub created_at: i64,
    pub run_started_at: Option<i64>,
}

/// What a caller supplies when registering an instance.
#[derive(Debug, Clone)]
pub struct NewInstance {
    pub id: InstanceId,
    pub display_name: String,
    pub agent_name: String,
    pub workspace_path: Option<PathBuf>,
    pub workspace_id: Option<WorkspaceId>,
    pub branch: Option<String>,
}

impl NewInstance {
    pub fn new(id: impl Into<InstanceId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            agent_name: String::new(),
            workspace_path: None,
            workspace_id: None,
            branch: None,
        }
    }

    pub fn agent(mut self, agent_name: impl Into<String>) -> Self {
        self.agent_name = agent_name.into();
        self
    }

    pub fn workspace(
        mut self,
        workspace_id: impl Into<WorkspaceId>,
        path: impl Into<PathBuf>,
        branch: impl Into<String>,
    ) -> Self {
        self.workspace_id = Some(workspace_id.into());
        self.workspace_path = Some(path.into());
        self.branch = Some(branch.into());
        self
    }

    pub(crate) fn into_record(self) -> InstanceRecord {
        InstanceRecord {
            id: self.id,
            display_name: self.display_name,
            agent_name: self.agent_name,
            status: InstanceStatus::Starting,
            workspace_path: self.workspace_path,
            workspace_id: self.workspace_id,
            branch: self.branch,
            created_at: now_ms(),
            run_started_at: None,
        }
    }
}

/// The task an instance is currently working, derived from its event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentTask {
    pub task_id: String,
    pub title: String,
}

pub(crate) struct ManagedInstance {
    pub(crate) record: InstanceRecord,
    pub(crate) history: EventHistory,
    pub(crate) session: Option<SessionHandle>,
}

impl ManagedInstance {
    pub(crate) fn new(record: InstanceRecord, history_capacity: usize) -> Self {
        Self {
            record,
            history: EventHistory::new(history_capacity),
            session: None,
        }
    }

    /// Forward scan: tasks open on `task_started` and resolve on
    /// `task_completed`; the most recently opened unresolved task wins.
    pub(crate) fn current_task(&self) -> Option<CurrentTask> {
        let mut open: Vec<(String, String)> = Vec::new();

        for envelope in self.history.iter() {
            match &envelope.event {
                AgentEvent::TaskStarted { task_id, title } => {
                    open.push((task_id.clone(), title.clone()));
                }
                AgentEvent::TaskCompleted { task_id } => {
                    open.retain(|(id, _)| id != task_id);
                }
                _ => {}
            }
        }

        open.pop().map(|(task_id, title)| CurrentTask { task_id, title })
    }
}
