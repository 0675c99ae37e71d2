//! Normalized event envelope protocol for fleet instances and workers.

pub mod envelope;
pub mod event;
pub mod ids;
pub mod legacy;
pub mod reconnect;

pub use envelope::{now_ms, EventEnvelope, EventSource};
pub use event::{AgentEvent, InstanceStatus};
pub use ids::{InstanceId, WorkspaceId};
pub use legacy::{LegacyAgentFrame, LegacyWorkerFrame};
pub use reconnect::{ReconnectRequest, ReconnectResponse};
