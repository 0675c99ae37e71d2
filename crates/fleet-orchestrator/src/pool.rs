use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::interval;

use fleet_isolation::{IsolatedWorkspace, WorkspaceOwner};
use fleet_protocol::{AgentEvent, EventSource, InstanceId, InstanceStatus};
use fleet_registry::{InstanceRegistry, NewInstance, SessionControl};

use crate::error::OrchestratorError;
use crate::state::{PoolEvent, PoolState, PoolStatus};
use crate::traits::{
    AvailabilityCap, SessionContext, SessionRunner, SizingPolicy, TaskSource, VerificationRunner,
    WorkspaceProvider,
};

const POOL_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_workers: usize,
    pub poll_interval: Duration,
    /// Agent backend name stamped on registered instances.
    pub agent_name: String,
    /// Pause after a provisioning failure before the worker retries.
    pub idle_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            poll_interval: Duration::from_secs(2),
            agent_name: "agent".to_owned(),
            idle_backoff: Duration::from_millis(500),
        }
    }
}

pub struct PoolBuilder {
    config: PoolConfig,
    registry: Arc<InstanceRegistry>,
    tasks: Arc<dyn TaskSource>,
    sessions: Arc<dyn SessionRunner>,
    workspaces: Arc<dyn WorkspaceProvider>,
    verification: Option<Arc<dyn VerificationRunner>>,
    sizing: Arc<dyn SizingPolicy>,
}

impl PoolBuilder {
    pub fn new(
        registry: Arc<InstanceRegistry>,
        tasks: Arc<dyn TaskSource>,
        sessions: Arc<dyn SessionRunner>,
        workspaces: Arc<dyn WorkspaceProvider>,
    ) -> Self {
        Self {
            config: PoolConfig::default(),
            registry,
            tasks,
            sessions,
            workspaces,
            verification: None,
            sizing: Arc::new(AvailabilityCap),
        }
    }

    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn verification(mut self, verification: Arc<dyn VerificationRunner>) -> Self {
        self.verification = Some(verification);
        self
    }

    pub fn sizing(mut self, sizing: Arc<dyn SizingPolicy>) -> Self {
        self.sizing = sizing;
        self
    }

    pub fn build(self) -> WorkerPool {
        let (state, _) = watch::channel(PoolState::stopped());
        let (events, _) = broadcast::channel(POOL_EVENT_CAPACITY);
        WorkerPool {
            inner: Arc::new(PoolInner {
                config: self.config,
                registry: self.registry,
                tasks: self.tasks,
                sessions: self.sessions,
                verification: self.verification,
                workspaces: self.workspaces,
                sizing: self.sizing,
                state,
                events,
                workers: Mutex::new(HashMap::new()),
                poll_task: Mutex::new(None),
                next_worker: AtomicU64::new(0),
            }),
        }
    }
}

/// Autoscaling pool of session workers.
///
/// A poll loop sizes the pool against task availability; each worker runs
/// provision -> session -> verify -> merge -> release cycles until the pool
/// stops accepting work. Every failure local to one worker is surfaced as an
/// event and the worker returns to idle; only `stop` tears the pool down.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    registry: Arc<InstanceRegistry>,
    tasks: Arc<dyn TaskSource>,
    sessions: Arc<dyn SessionRunner>,
    verification: Option<Arc<dyn VerificationRunner>>,
    workspaces: Arc<dyn WorkspaceProvider>,
    sizing: Arc<dyn SizingPolicy>,
    state: watch::Sender<PoolState>,
    events: broadcast::Sender<PoolEvent>,
    workers: Mutex<HashMap<String, WorkerHandle>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    next_worker: AtomicU64,
}

struct WorkerHandle {
    task: JoinHandle<()>,
    current_instance: Arc<Mutex<Option<InstanceId>>>,
}

/// Bridges a pool session into the registry's exclusive session handle.
struct RunnerSession {
    runner: Arc<dyn SessionRunner>,
    instance: InstanceId,
}

#[async_trait]
impl SessionControl for RunnerSession {
    async fn stop(&self) {
        if let Err(error) = self.runner.interrupt(&self.instance).await {
            tracing::debug!(
                instance = %self.instance,
                error = %error,
                "session interrupt unavailable"
            );
        }
    }
}

impl WorkerPool {
    pub fn state(&self) -> PoolState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PoolState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.inner.events.subscribe()
    }

    pub async fn start(&self) -> Result<(), OrchestratorError> {
        let mut poll_task = self.inner.poll_task.lock().await;
        if self.inner.state.borrow().status != PoolStatus::Stopped {
            return Err(OrchestratorError::AlreadyRunning);
        }
        self.inner.publish_state(|state| {
            state.status = PoolStatus::Starting;
            state.draining = false;
        });

        let inner = Arc::clone(&self.inner);
        *poll_task = Some(tokio::spawn(async move { inner.poll_loop().await }));

        self.inner
            .publish_state(|state| state.status = PoolStatus::Running);
        Ok(())
    }

    /// Immediate teardown: aborts every worker task, best-effort interrupts
    /// their sessions, and goes straight to `Stopped`. Idempotent.
    pub async fn stop(&self) {
        if let Some(poll) = self.inner.poll_task.lock().await.take() {
            poll.abort();
        }

        let drained: Vec<(String, WorkerHandle)> =
            self.inner.workers.lock().await.drain().collect();
        for (worker, handle) in drained {
            let instance = handle.current_instance.lock().await.clone();
            handle.task.abort();
            if let Some(instance) = instance {
                if let Err(error) = self.inner.sessions.interrupt(&instance).await {
                    tracing::debug!(worker = %worker, error = %error, "interrupt unavailable");
                }
                self.inner.registry.dispose(&instance).await;
            }
            let _ = self
                .inner
                .events
                .send(PoolEvent::WorkerFinished { worker });
        }

        self.inner.publish_state(|state| *state = PoolState::stopped());
    }

    /// Flips the pool into draining: no new sessions start, in-flight ones
    /// finish, and the poll loop completes the transition to `Stopped` once
    /// the last worker exits.
    pub fn stop_after_current(&self) -> Result<(), OrchestratorError> {
        if self.inner.state.borrow().status != PoolStatus::Running {
            return Err(OrchestratorError::NotRunning);
        }
        self.inner.publish_state(|state| {
            state.status = PoolStatus::Stopping;
            state.draining = true;
        });
        let _ = self.inner.events.send(PoolEvent::DrainStarted);
        Ok(())
    }

    /// Re-enters `Running` from a drain that has not finished yet.
    pub fn cancel_drain(&self) -> Result<(), OrchestratorError> {
        {
            let state = self.inner.state.borrow();
            if state.status != PoolStatus::Stopping || !state.draining {
                return Err(OrchestratorError::NotDraining);
            }
        }
        self.inner.publish_state(|state| {
            state.status = PoolStatus::Running;
            state.draining = false;
        });
        let _ = self.inner.events.send(PoolEvent::DrainCancelled);
        Ok(())
    }

    pub async fn pause_worker(&self, worker: &str) -> Result<(), OrchestratorError> {
        let instance = self.current_instance(worker).await?;
        self.inner.sessions.pause(&instance).await?;
        Ok(())
    }

    pub async fn resume_worker(&self, worker: &str) -> Result<(), OrchestratorError> {
        let instance = self.current_instance(worker).await?;
        self.inner.sessions.resume(&instance).await?;
        Ok(())
    }

    /// Tears down one named worker without touching the rest of the pool.
    pub async fn stop_worker(&self, worker: &str) -> Result<(), OrchestratorError> {
        let handle = self
            .inner
            .workers
            .lock()
            .await
            .remove(worker)
            .ok_or_else(|| OrchestratorError::UnknownWorker(worker.to_owned()))?;

        let instance = handle.current_instance.lock().await.clone();
        handle.task.abort();
        if let Some(instance) = instance {
            if let Err(error) = self.inner.sessions.interrupt(&instance).await {
                tracing::debug!(worker, error = %error, "interrupt unavailable");
            }
            self.inner.registry.dispose(&instance).await;
        }
        let _ = self.inner.events.send(PoolEvent::WorkerFinished {
            worker: worker.to_owned(),
        });
        Ok(())
    }

    async fn current_instance(&self, worker: &str) -> Result<InstanceId, OrchestratorError> {
        let workers = self.inner.workers.lock().await;
        let handle = workers
            .get(worker)
            .ok_or_else(|| OrchestratorError::UnknownWorker(worker.to_owned()))?;
        let current = handle.current_instance.lock().await.clone();
        current.ok_or(OrchestratorError::NoActiveSession)
    }
}

impl PoolInner {
    fn publish_state(&self, update: impl FnOnce(&mut PoolState)) {
        let mut changed = false;
        self.state.send_if_modified(|state| {
            let before = *state;
            update(state);
            changed = *state != before;
            changed
        });
        if changed {
            let _ = self
                .events
                .send(PoolEvent::StateChanged(*self.state.borrow()));
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.poll_interval);
        loop {
            ticker.tick().await;
            self.prune_finished_workers().await;

            let status = self.state.borrow().status;
            match status {
                PoolStatus::Stopped => break,
                PoolStatus::Starting => continue,
                PoolStatus::Stopping => {
                    if self.active_workers().await == 0 {
                        // cancel_drain may have re-entered Running since the read
                        self.publish_state(|state| {
                            if state.status == PoolStatus::Stopping {
                                *state = PoolState::stopped();
                            }
                        });
                        if self.state.borrow().status == PoolStatus::Stopped {
                            break;
                        }
                    }
                    continue;
                }
                PoolStatus::Running => {}
            }

            let available = match self.tasks.ready_count().await {
                Ok(available) => available,
                Err(error) => {
                    tracing::warn!(error = %error, "task source unavailable, assuming no ready work");
                    let _ = self.events.send(PoolEvent::TaskSourceError {
                        reason: error.to_string(),
                    });
                    0
                }
            };

            let active = self.active_workers().await;
            let target = self
                .sizing
                .target_workers(available, self.config.max_workers, active);
            self.publish_state(|state| {
                state.active_workers = active;
                state.target_workers = target;
            });

            let mut to_spawn = target.saturating_sub(active);
            while to_spawn > 0 && self.state.borrow().accepting_work() {
                Self::spawn_worker(&self).await;
                to_spawn -= 1;
            }
        }
    }

    async fn spawn_worker(this: &Arc<Self>) {
        let index = this.next_worker.fetch_add(1, Ordering::SeqCst) + 1;
        let worker = format!("worker-{index}");
        let current_instance = Arc::new(Mutex::new(None));

        let inner = Arc::clone(this);
        let loop_worker = worker.clone();
        let loop_instance = Arc::clone(&current_instance);
        let task = tokio::spawn(async move { inner.worker_loop(loop_worker, loop_instance).await });

        this.workers.lock().await.insert(
            worker.clone(),
            WorkerHandle {
                task,
                current_instance,
            },
        );
        let _ = this.events.send(PoolEvent::WorkerStarted { worker });
    }

    async fn worker_loop(
        self: Arc<Self>,
        worker: String,
        current_instance: Arc<Mutex<Option<InstanceId>>>,
    ) {
        let mut job = 0u64;
        while self.state.borrow().accepting_work() {
            job += 1;
            let owner = WorkspaceOwner::new(worker.as_str(), format!("job-{job}"));

            let workspace = match self.workspaces.acquire(&owner).await {
                Ok(workspace) => workspace,
                Err(error) => {
                    tracing::warn!(worker = %worker, error = %error, "workspace provisioning failed");
                    let _ = self.events.send(PoolEvent::WorkerFailed {
                        worker: worker.clone(),
                        reason: error.to_string(),
                    });
                    tokio::time::sleep(self.config.idle_backoff).await;
                    continue;
                }
            };

            let instance_id = InstanceId::new(format!("{worker}-job-{job}"));
            let spec = NewInstance::new(instance_id.clone(), format!("{worker} job {job}"))
                .agent(self.config.agent_name.clone())
                .workspace(owner.slug(), &workspace.path, &workspace.branch);
            if let Err(error) = self.registry.create(spec).await {
                tracing::warn!(worker = %worker, error = %error, "instance registration failed");
                let _ = self.workspaces.release(&owner).await;
                continue;
            }
            let session = RunnerSession {
                runner: Arc::clone(&self.sessions),
                instance: instance_id.clone(),
            };
            let _ = self
                .registry
                .attach_session(&instance_id, Box::new(session))
                .await;
            *current_instance.lock().await = Some(instance_id.clone());

            self.run_job(&worker, &owner, &workspace, &instance_id).await;

            *current_instance.lock().await = None;
            // session finished on its own, no interrupt on disposal
            let _ = self.registry.take_session(&instance_id).await;
            if let Err(error) = self.workspaces.release(&owner).await {
                tracing::warn!(worker = %worker, error = %error, "workspace release failed");
            }
            self.registry.dispose(&instance_id).await;
        }
        let _ = self.events.send(PoolEvent::WorkerFinished { worker });
    }

    /// One full job cycle after provisioning. Failures are recorded on the
    /// instance's stream and end the cycle early; they never escape.
    async fn run_job(
        &self,
        worker: &str,
        owner: &WorkspaceOwner,
        workspace: &IsolatedWorkspace,
        instance_id: &InstanceId,
    ) {
        let _ = self
            .registry
            .set_status(instance_id, InstanceStatus::Running)
            .await;

        let context = SessionContext {
            instance_id: instance_id.clone(),
            workspace_path: workspace.path.clone(),
            branch: workspace.branch.clone(),
        };
        if let Err(error) = self.sessions.run_session(&context).await {
            tracing::warn!(worker, error = %error, "session failed");
            let _ = self
                .registry
                .record_event(
                    instance_id,
                    EventSource::Worker,
                    AgentEvent::SessionFailed {
                        reason: error.to_string(),
                    },
                )
                .await;
            let _ = self
                .registry
                .set_status(instance_id, InstanceStatus::Idle)
                .await;
            return;
        }

        if let Some(verification) = &self.verification {
            let guard = self.workspaces.lock_trunk().await;
            let outcome = verification
                .run_verification(self.workspaces.trunk_path())
                .await;
            drop(guard);
            let success = outcome.success;
            let _ = self
                .registry
                .record_event(
                    instance_id,
                    EventSource::Worker,
                    AgentEvent::VerificationCompleted {
                        success: outcome.success,
                        output: outcome.output,
                    },
                )
                .await;
            if !success {
                let _ = self
                    .registry
                    .set_status(instance_id, InstanceStatus::Idle)
                    .await;
                return;
            }
        }

        match self.workspaces.merge(owner).await {
            Ok(outcome) => {
                if outcome.had_conflicts {
                    // conflicted work is discarded, never left mid-merge
                    if let Err(error) = self.workspaces.discard_merge().await {
                        tracing::warn!(error = %error, "failed to discard conflicted merge");
                    }
                }
                let _ = self
                    .registry
                    .record_event(
                        instance_id,
                        EventSource::Worker,
                        AgentEvent::MergeCompleted {
                            branch: workspace.branch.clone(),
                            had_conflicts: outcome.had_conflicts,
                        },
                    )
                    .await;
            }
            Err(error) => {
                tracing::warn!(worker, error = %error, "merge failed");
                let _ = self
                    .registry
                    .record_event(
                        instance_id,
                        EventSource::Worker,
                        AgentEvent::IsolationFailed {
                            reason: error.to_string(),
                        },
                    )
                    .await;
            }
        }

        let _ = self
            .registry
            .set_status(instance_id, InstanceStatus::Idle)
            .await;
    }

    async fn active_workers(&self) -> usize {
        self.workers
            .lock()
            .await
            .values()
            .filter(|handle| !handle.task.is_finished())
            .count()
    }

    async fn prune_finished_workers(&self) {
        self.workers
            .lock()
            .await
            .retain(|_, handle| !handle.task.is_finished());
    }
}
