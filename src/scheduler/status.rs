use crate::config::{SpecKey, Strategy};
use crate::server::{CallStats, Instance, InstanceState};
use serde::Serialize;
use std::time::Duration;

/// Per-state instance counts for one pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub ready: usize,
    pub busy: usize,
    pub starting: usize,
    pub initializing: usize,
    pub handshaking: usize,
    pub draining: usize,
    pub failed: usize,
}

impl PoolStats {
    pub(crate) fn count(&mut self, state: InstanceState) {
        self.total += 1;
        match state {
            InstanceState::Ready => self.ready += 1,
            InstanceState::Busy => self.busy += 1,
            InstanceState::Starting => self.starting += 1,
            InstanceState::Initializing => self.initializing += 1,
            InstanceState::Handshaking => self.handshaking += 1,
            InstanceState::Draining => self.draining += 1,
            InstanceState::Failed => self.failed += 1,
            InstanceState::Stopped => {}
        }
    }
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub id: String,
    pub state: InstanceState,
    pub busy_count: usize,
    pub sticky_key: String,
    /// Time since the last acquire or release.
    pub idle_for: Duration,
    pub calls: CallStats,
}

impl InstanceStatus {
    pub(crate) fn of(instance: &Instance) -> Self {
        let (state, busy_count, sticky_key, last_active) = instance.snapshot();
        Self {
            id: instance.id().to_string(),
            state,
            busy_count,
            sticky_key,
            idle_for: last_active.elapsed(),
            calls: instance.call_stats(),
        }
    }
}

/// Point-in-time view of one pool, as returned by
/// [`Scheduler::get_pool_status`](crate::scheduler::Scheduler::get_pool_status).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolInfo {
    pub spec_key: SpecKey,
    pub server_name: String,
    pub strategy: Strategy,
    pub min_ready: usize,
    pub desired_min_ready: usize,
    /// Starts in flight, coordinated and min-ready.
    pub pending_starts: usize,
    /// Instances in registration order.
    pub instances: Vec<InstanceStatus>,
    pub stats: PoolStats,
}
