/// Pool lifecycle: `Stopped -> Starting -> Running -> Stopping -> Stopped`,
/// with `cancel_drain` re-entering `Running` from `Stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Single authoritative snapshot of the pool, published on a watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub status: PoolStatus,
    pub draining: bool,
    pub active_workers: usize,
    pub target_workers: usize,
}

impl PoolState {
    pub(crate) fn stopped() -> Self {
        Self {
            status: PoolStatus::Stopped,
            draining: false,
            active_workers: 0,
            target_workers: 0,
        }
    }

    /// Whether workers may pick up another session.
    pub fn accepting_work(&self) -> bool {
        self.status == PoolStatus::Running && !self.draining
    }
}

/// Worker and pool lifecycle notifications. Per-session events flow through
/// the instance registry instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    StateChanged(PoolState),
    WorkerStarted { worker: String },
    WorkerFinished { worker: String },
    WorkerFailed { worker: String, reason: String },
    TaskSourceError { reason: String },
    DrainStarted,
    DrainCancelled,
}

#[cfg(test)]
mod tests {
    use super::{PoolState, PoolStatus};

    #[test]
    fn only_a_running_undrained_pool_accepts_work() {
        let mut state = PoolState::stopped();
        assert!(!state.accepting_work());

        state.status = PoolStatus::Running;
        assert!(state.accepting_work());

        state.draining = true;
        assert!(!state.accepting_work());
    }
}
