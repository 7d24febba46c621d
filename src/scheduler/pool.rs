use super::start_gate::StartAttempt;
use super::status::{InstanceStatus, PoolInfo, PoolStats};
use crate::config::{ServerSpec, SpecKey};
use crate::server::{Instance, InstanceState};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Routing-key affinity to one instance (stateful strategy).
pub(crate) struct StickyBinding {
    pub(crate) instance: Arc<Instance>,
    pub(crate) last_access: Instant,
}

/// Everything guarded by the pool lock.
pub(crate) struct PoolState {
    pub(crate) spec: ServerSpec,
    pub(crate) instances: Vec<Arc<Instance>>,
    pub(crate) sticky: HashMap<String, StickyBinding>,
    pub(crate) desired_min_ready: usize,
    /// Bumped by stop requests; starts begun under an older value are discarded.
    pub(crate) generation: u64,
    /// Min-ready starts in flight.
    pub(crate) starting: usize,
    /// The coordinated start in flight, if any.
    pub(crate) pending: Option<StartAttempt>,
    pub(crate) cursor: usize,
    /// Set once the pool's spec left the catalog; nothing is placed or
    /// admitted afterwards.
    pub(crate) retired: bool,
}

impl PoolState {
    /// Instances that are Ready with nothing in flight.
    pub(crate) fn ready_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|inst| inst.state() == InstanceState::Ready)
            .count()
    }

    /// Drops an instance and any binding pointing at it. Returns the
    /// remaining instance count.
    pub(crate) fn remove(&mut self, instance: &Arc<Instance>) -> usize {
        self.instances.retain(|inst| !Arc::ptr_eq(inst, instance));
        self.sticky
            .retain(|_, binding| !Arc::ptr_eq(&binding.instance, instance));
        self.instances.len()
    }

    /// Removes every instance and binding, marking the instances Draining.
    pub(crate) fn drain(&mut self) -> Vec<Arc<Instance>> {
        self.sticky.clear();
        let drained: Vec<_> = self.instances.drain(..).collect();
        for inst in &drained {
            inst.set_state(InstanceState::Draining);
        }
        drained
    }

    /// Adds a freshly started instance if `generation` is still current.
    ///
    /// Hands the instance back when it was superseded; the caller must stop
    /// it.
    pub(crate) fn admit(
        &mut self,
        instance: Arc<Instance>,
        generation: u64,
    ) -> Result<usize, Arc<Instance>> {
        if self.retired || self.generation != generation {
            return Err(instance);
        }
        self.instances.push(instance);
        Ok(self.instances.len())
    }

    fn starts_in_flight(&self) -> usize {
        self.starting + usize::from(self.pending.is_some())
    }
}

/// Instances and bindings for one spec key.
///
/// The pool lock is never held across an await. Collaborator calls happen
/// outside it and their results are applied under it afterwards.
pub(crate) struct Pool {
    pub(crate) spec_key: SpecKey,
    pub(crate) state: Mutex<PoolState>,
    /// Signalled whenever capacity may have appeared or the pool changed
    /// under waiters (release, registration, removal, stop).
    pub(crate) changed: Notify,
}

impl Pool {
    pub(crate) fn new(spec_key: SpecKey, spec: ServerSpec) -> Self {
        Self {
            spec_key,
            state: Mutex::new(PoolState {
                spec,
                instances: Vec::new(),
                sticky: HashMap::new(),
                desired_min_ready: 0,
                generation: 0,
                starting: 0,
                pending: None,
                cursor: 0,
                retired: false,
            }),
            changed: Notify::new(),
        }
    }

    pub(crate) fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub(crate) fn info(&self) -> PoolInfo {
        let st = self.state.lock();
        let mut stats = PoolStats::default();
        let instances: Vec<InstanceStatus> = st
            .instances
            .iter()
            .map(|inst| {
                let status = InstanceStatus::of(inst);
                stats.count(status.state);
                status
            })
            .collect();

        PoolInfo {
            spec_key: self.spec_key.clone(),
            server_name: st.spec.name.clone(),
            strategy: st.spec.strategy,
            min_ready: st.spec.min_ready,
            desired_min_ready: st.desired_min_ready,
            pending_starts: st.starts_in_flight(),
            instances,
            stats,
        }
    }
}

/// Keeps the min-ready `starting` count honest if a start task panics or is
/// dropped before it reports back.
pub(crate) struct StartingGuard {
    pool: Option<Arc<Pool>>,
}

impl StartingGuard {
    /// Counts one start in flight on `pool`.
    pub(crate) fn new(pool: Arc<Pool>) -> Self {
        pool.state.lock().starting += 1;
        Self { pool: Some(pool) }
    }

    /// Ends the start under an already held lock.
    pub(crate) fn finish(mut self, st: &mut PoolState) {
        st.starting = st.starting.saturating_sub(1);
        self.pool = None;
    }
}

impl Drop for StartingGuard {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            {
                let mut st = pool.state.lock();
                st.starting = st.starting.saturating_sub(1);
            }
            pool.changed.notify_waiters();
        }
    }
}
