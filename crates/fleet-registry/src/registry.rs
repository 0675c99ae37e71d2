use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};

use fleet_protocol::{
    now_ms, AgentEvent, EventEnvelope, EventSource, InstanceId, InstanceStatus, ReconnectRequest,
    ReconnectResponse,
};
use fleet_session_store::{SessionSnapshot, SessionStateStore};

use crate::error::RegistryError;
use crate::instance::{CurrentTask, InstanceRecord, ManagedInstance, NewInstance, SessionHandle};

pub const DEFAULT_HISTORY_CAPACITY: usize = 1000;
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Pool ceiling; 0 means unlimited.
    pub max_instances: usize,
    /// Per-instance event buffer size.
    pub history_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_instances: 0,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
        }
    }
}

/// Lifecycle notifications and per-instance envelopes on one channel.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Created(InstanceRecord),
    Disposed(InstanceId),
    Event(EventEnvelope),
}

/// Authoritative in-memory pool of supervised instances.
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, ManagedInstance>>,
    config: RegistryConfig,
    store: Option<SessionStateStore>,
    events: broadcast::Sender<RegistryEvent>,
}

impl InstanceRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            instances: RwLock::new(HashMap::new()),
            config,
            store: None,
            events,
        }
    }

    pub fn with_store(config: RegistryConfig, store: SessionStateStore) -> Self {
        let mut registry = Self::new(config);
        registry.store = Some(store);
        registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Registers a new instance. Capacity enforcement runs before this
    /// returns: when the pool exceeds the ceiling, eviction candidates are
    /// ranked not-running first, then oldest created. With a ceiling of 1
    /// the just-created instance is itself eligible.
    pub async fn create(&self, spec: NewInstance) -> Result<InstanceRecord, RegistryError> {
        let record = {
            let mut instances = self.instances.write().await;
            if instances.contains_key(&spec.id) {
                return Err(RegistryError::DuplicateId(spec.id.to_string()));
            }
            let record = spec.into_record();
            instances.insert(
                record.id.clone(),
                ManagedInstance::new(record.clone(), self.config.history_capacity),
            );
            record
        };
        let _ = self.events.send(RegistryEvent::Created(record.clone()));

        self.enforce_capacity().await;
        Ok(record)
    }

    /// Stops the attached session, drops the event history, and deletes any
    /// persisted snapshot. Unknown ids are a no-op.
    pub async fn dispose(&self, id: &InstanceId) -> bool {
        let session = {
            let mut instances = self.instances.write().await;
            match instances.remove(id) {
                Some(instance) => instance.session,
                None => return false,
            }
        };
        self.finish_disposal(id, session).await;
        true
    }

    /// Stamps a sequence number and appends the event to the instance's
    /// history, then broadcasts the tagged envelope.
    pub async fn record_event(
        &self,
        id: &InstanceId,
        source: EventSource,
        event: AgentEvent,
    ) -> Result<EventEnvelope, RegistryError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
        let stamped = Self::append_event(instance, source, event);
        drop(instances);

        let _ = self.events.send(RegistryEvent::Event(stamped.clone()));
        Ok(stamped)
    }

    /// Updates the recorded status, stamps the run start on the first
    /// transition to `Running`, and emits a status-change event.
    pub async fn set_status(
        &self,
        id: &InstanceId,
        status: InstanceStatus,
    ) -> Result<EventEnvelope, RegistryError> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;

        instance.record.status = status;
        if status == InstanceStatus::Running && instance.record.run_started_at.is_none() {
            instance.record.run_started_at = Some(now_ms());
        }
        let stamped = Self::append_event(
            instance,
            EventSource::Instance,
            AgentEvent::StatusChanged { status },
        );
        drop(instances);

        let _ = self.events.send(RegistryEvent::Event(stamped.clone()));
        Ok(stamped)
    }

    pub async fn current_task(&self, id: &InstanceId) -> Result<Option<CurrentTask>, RegistryError> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(id)
            .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
        Ok(instance.current_task())
    }

    /// Replays buffered events strictly after the client's last-seen marker,
    /// ascending, together with live status and the total-appended count (so
    /// clients can detect pruned gaps).
    pub async fn reconnect(
        &self,
        request: &ReconnectRequest,
    ) -> Result<ReconnectResponse, RegistryError> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(&request.instance_id)
            .ok_or_else(|| RegistryError::UnknownInstance(request.instance_id.to_string()))?;

        let events = if let Some(last_sequence) = request.last_sequence {
            instance.history.since_sequence(last_sequence)
        } else if let Some(last_timestamp) = request.last_timestamp {
            instance.history.since_timestamp(last_timestamp)
        } else {
            instance.history.snapshot()
        };

        Ok(ReconnectResponse {
            source: request.source,
            instance_id: request.instance_id.clone(),
            events,
            total_events: instance.history.total_appended(),
            status: instance.record.status,
            timestamp: now_ms(),
        })
    }

    /// Persists the instance's live record plus caller-supplied conversation
    /// context through the attached store.
    pub async fn save_session_state(
        &self,
        id: &InstanceId,
        conversation_context: Value,
        session_id: Option<String>,
    ) -> Result<(), RegistryError> {
        let store = self.store.as_ref().ok_or(RegistryError::NoStateStore)?;

        let (status, current_task_id) = {
            let instances = self.instances.read().await;
            let instance = instances
                .get(id)
                .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
            (
                instance.record.status,
                instance.current_task().map(|task| task.task_id),
            )
        };

        let mut snapshot = SessionSnapshot::new(id.clone(), conversation_context, status);
        snapshot.session_id = session_id;
        snapshot.current_task_id = current_task_id;
        store.save(&snapshot)?;
        Ok(())
    }

    /// Hands the registry exclusive ownership of a live session handle.
    /// A previously attached handle is stopped and replaced.
    pub async fn attach_session(
        &self,
        id: &InstanceId,
        handle: SessionHandle,
    ) -> Result<(), RegistryError> {
        let previous = {
            let mut instances = self.instances.write().await;
            let instance = instances
                .get_mut(id)
                .ok_or_else(|| RegistryError::UnknownInstance(id.to_string()))?;
            instance.session.replace(handle)
        };
        if let Some(previous) = previous {
            previous.stop().await;
        }
        Ok(())
    }

    pub async fn take_session(&self, id: &InstanceId) -> Option<SessionHandle> {
        let mut instances = self.instances.write().await;
        instances.get_mut(id).and_then(|instance| instance.session.take())
    }

    pub async fn get(&self, id: &InstanceId) -> Option<InstanceRecord> {
        let instances = self.instances.read().await;
        instances.get(id).map(|instance| instance.record.clone())
    }

    /// All live records, oldest first.
    pub async fn list(&self) -> Vec<InstanceRecord> {
        let instances = self.instances.read().await;
        let mut records: Vec<InstanceRecord> = instances
            .values()
            .map(|instance| instance.record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    async fn enforce_capacity(&self) {
        if self.config.max_instances == 0 {
            return;
        }
        loop {
            let evicted = {
                let mut instances = self.instances.write().await;
                if instances.len() <= self.config.max_instances {
                    break;
                }
                let victim = instances
                    .values()
                    .min_by_key(|instance| {
                        (
                            instance.record.status == InstanceStatus::Running,
                            instance.record.created_at,
                            instance.record.id.clone(),
                        )
                    })
                    .map(|instance| instance.record.id.clone());
                match victim {
                    Some(id) => instances.remove(&id).map(|instance| (id, instance.session)),
                    None => None,
                }
            };
            let Some((id, session)) = evicted else {
                break;
            };
            tracing::debug!(instance = %id, "evicted instance over pool ceiling");
            self.finish_disposal(&id, session).await;
        }
    }

    async fn finish_disposal(&self, id: &InstanceId, session: Option<SessionHandle>) {
        if let Some(session) = session {
            session.stop().await;
        }
        if let Some(store) = &self.store {
            store.delete(id);
        }
        let _ = self.events.send(RegistryEvent::Disposed(id.clone()));
    }

    fn append_event(
        instance: &mut ManagedInstance,
        source: EventSource,
        event: AgentEvent,
    ) -> EventEnvelope {
        let envelope = EventEnvelope::new(
            source,
            instance.record.id.clone(),
            instance.record.workspace_id.clone(),
            event,
        );
        instance.history.append(envelope)
    }
}
