use serde::{Deserialize, Serialize};

/// Lifecycle status of a supervised instance as observers see it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Idle,
    Stopping,
    Stopped,
    Failed,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

/// The closed set of normalized events an instance or worker can publish.
///
/// Every recoverable failure in the system surfaces as one of these variants
/// on the owning instance's stream instead of being thrown past the API
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Output {
        text: String,
    },
    TaskStarted {
        task_id: String,
        title: String,
    },
    TaskCompleted {
        task_id: String,
    },
    StatusChanged {
        status: InstanceStatus,
    },
    SessionFailed {
        reason: String,
    },
    IsolationFailed {
        reason: String,
    },
    VerificationCompleted {
        success: bool,
        output: String,
    },
    MergeCompleted {
        branch: String,
        had_conflicts: bool,
    },
    TaskSourceError {
        reason: String,
    },
}
