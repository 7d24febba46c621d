//! Instance scheduler.
//!
//! The [`Scheduler`] decides which running instance serves each call. It
//! keeps one pool per [`SpecKey`], places acquisitions according to the
//! spec's [`Strategy`](crate::config::Strategy), starts instances through a
//! singleflight coordinator when no capacity is left, and runs the
//! background sweeps that reclaim idle instances, expire sticky bindings
//! and evict instances that fail their health probe.
//!
//! # Locking
//!
//! The spec registry and the pool map each sit behind their own lock, held
//! only to look up, create or delete entries. When both are needed the pool
//! map is locked first. Each pool has one lock guarding
//! its instances, bindings and counters. When an instance's own state is
//! touched under a pool lock, the pool lock is taken first. No lock is held
//! across an await; start, stop and probe calls run outside the pool lock
//! and their results are applied under it afterwards.
//!
//! # Examples
//!
//! ```no_run
//! use mcp_fleet::config::Config;
//! use mcp_fleet::scheduler::{Scheduler, SchedulerOptions};
//! use mcp_fleet::server::ProcessLifecycle;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> mcp_fleet::error::Result<()> {
//! let config = Config::from_file("catalog.yaml")?;
//! let registry = config.registry();
//! let lifecycle = Arc::new(ProcessLifecycle::new(
//!     Duration::from_secs(30),
//!     Duration::from_secs(10),
//! ));
//! let scheduler = Scheduler::new(lifecycle, registry.clone(), SchedulerOptions::default());
//!
//! let key = registry.keys().next().cloned().unwrap();
//! let instance = scheduler.acquire(&key, "").await?;
//! // ... talk to the instance ...
//! scheduler.release(&instance);
//! # Ok(())
//! # }
//! ```
mod catalog;
mod pool;
mod reaper;
mod start_gate;
mod status;
mod strategy;

pub use status::{InstanceStatus, PoolInfo, PoolStats};

use crate::config::{RuntimeConfig, ServerSpec, SpecKey, Strategy};
use crate::error::{Error, Result, aggregate};
use crate::metrics::{Metrics, NoopMetrics, WaitOutcome};
use crate::server::{HealthProbe, Instance, InstanceState, Lifecycle};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use pool::{Pool, StartingGuard};
use reaper::Sweeper;
use start_gate::{AttemptOutcome, Ticket};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use strategy::Placement;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Collaborators and tunables beyond the lifecycle and the registry.
#[derive(Clone)]
pub struct SchedulerOptions {
    /// Health probe for the ping sweep; without one the sweep never runs.
    pub probe: Option<Arc<dyn HealthProbe>>,
    /// Metrics sink; defaults to [`NoopMetrics`].
    pub metrics: Option<Arc<dyn Metrics>>,
    /// Upper bound on one probe call.
    pub probe_timeout: Duration,
    /// Upper bound on one stop call.
    pub stop_timeout: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            probe: None,
            metrics: None,
            probe_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(10),
        }
    }
}

impl SchedulerOptions {
    /// Options with the timeouts taken from the catalog's runtime block.
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            probe_timeout: runtime.probe_timeout(),
            stop_timeout: runtime.stop_timeout(),
            ..Self::default()
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

pub(crate) struct Inner {
    pub(crate) lifecycle: Arc<dyn Lifecycle>,
    pub(crate) probe: Option<Arc<dyn HealthProbe>>,
    pub(crate) metrics: Arc<dyn Metrics>,
    pub(crate) probe_timeout: Duration,
    pub(crate) stop_timeout: Duration,
    pub(crate) specs: RwLock<HashMap<SpecKey, ServerSpec>>,
    pub(crate) pools: RwLock<HashMap<SpecKey, Arc<Pool>>>,
    /// Parent of every start token; cancelled by `stop_all`.
    pub(crate) shutdown: CancellationToken,
    pub(crate) idle_manager: Mutex<Option<Sweeper>>,
    pub(crate) ping_manager: Mutex<Option<Sweeper>>,
}

impl Inner {
    /// Stops one instance through the lifecycle and marks it Stopped.
    ///
    /// Failures are logged and counted, then returned.
    pub(crate) async fn stop_instance(&self, instance: &Arc<Instance>, reason: &str) -> Result<()> {
        let result = tokio::time::timeout(
            self.stop_timeout,
            self.lifecycle.stop_instance(instance, reason),
        )
        .await
        .unwrap_or_else(|_| {
            Err(Error::Timeout(format!(
                "stopping {} took longer than {:?}",
                instance.id(),
                self.stop_timeout
            )))
        });

        instance.set_state(InstanceState::Stopped);
        self.metrics
            .observe_instance_stop(instance.spec_key(), result.is_ok());
        match &result {
            Ok(()) => tracing::debug!(instance_id = %instance.id(), %reason, "Instance stopped"),
            Err(e) => tracing::warn!(
                instance_id = %instance.id(),
                %reason,
                error = %e,
                "Failed to stop instance"
            ),
        }
        result
    }

    /// Bumps the pool generation and takes every instance out of it.
    ///
    /// A coordinated start in flight is resolved as superseded right away so
    /// its followers fail fast; the start itself stops its instance when it
    /// completes. Waiters are woken to observe the new generation.
    pub(crate) fn supersede(&self, pool: &Pool) -> Vec<Arc<Instance>> {
        let (drained, attempt) = {
            let mut st = pool.state.lock();
            st.generation += 1;
            st.desired_min_ready = 0;
            (st.drain(), st.pending.take())
        };
        if let Some(attempt) = attempt {
            attempt.resolve(AttemptOutcome::Superseded);
        }
        pool.changed.notify_waiters();
        drained
    }

    /// Supersedes a pool whose spec left the catalog.
    ///
    /// Acquirers still holding the pool get [`Error::UnknownSpecKey`] instead
    /// of starting into it.
    pub(crate) fn retire(&self, pool: &Pool) -> Vec<Arc<Instance>> {
        pool.state.lock().retired = true;
        self.supersede(pool)
    }

    pub(crate) fn pools_snapshot(&self) -> Vec<Arc<Pool>> {
        self.pools.read().values().cloned().collect()
    }
}

/// Entry point for placing calls onto instances.
///
/// `Scheduler` is a cheap handle; clones share the same pools. Hand a clone
/// to every collaborator (router, control plane) that needs one.
#[derive(Clone)]
pub struct Scheduler {
    pub(crate) inner: Arc<Inner>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = self.inner.pools.read().len();
        let specs = self.inner.specs.read().len();
        f.debug_struct("Scheduler")
            .field("specs", &specs)
            .field("pools", &pools)
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler over a spec registry. No instance is started.
    pub fn new(
        lifecycle: Arc<dyn Lifecycle>,
        specs: HashMap<SpecKey, ServerSpec>,
        options: SchedulerOptions,
    ) -> Self {
        tracing::info!(specs = specs.len(), "Creating scheduler");
        let inner = Inner {
            lifecycle,
            probe: options.probe,
            metrics: options.metrics.unwrap_or_else(|| Arc::new(NoopMetrics)),
            probe_timeout: options.probe_timeout,
            stop_timeout: options.stop_timeout,
            specs: RwLock::new(specs),
            pools: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            idle_manager: Mutex::new(None),
            ping_manager: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// The registered spec for a key.
    pub fn spec(&self, spec_key: &SpecKey) -> Option<ServerSpec> {
        self.inner.specs.read().get(spec_key).cloned()
    }

    pub(crate) fn metrics(&self) -> &dyn Metrics {
        self.inner.metrics.as_ref()
    }

    /// Number of pools created so far.
    pub fn pool_count(&self) -> usize {
        self.inner.pools.read().len()
    }

    /// Looks up the pool for a key, creating it from the registry.
    fn pool(&self, spec_key: &SpecKey) -> Result<Arc<Pool>> {
        if let Some(pool) = self.inner.pools.read().get(spec_key) {
            return Ok(Arc::clone(pool));
        }

        // Registry lookup must happen under the pool map lock; catalog
        // removal drops both entries under it.
        let mut pools = self.inner.pools.write();
        let spec = self
            .spec(spec_key)
            .ok_or_else(|| Error::UnknownSpecKey(spec_key.clone()))?;
        let pool = pools.entry(spec_key.clone()).or_insert_with(|| {
            tracing::debug!(spec_key = %spec_key, server = %spec.name, "Creating pool");
            Arc::new(Pool::new(spec_key.clone(), spec))
        });
        Ok(Arc::clone(pool))
    }

    /// Reserves capacity on an instance, starting one if needed.
    ///
    /// The returned instance has one slot reserved and must be handed back
    /// with [`release`](Self::release). The call may wait for a start (its
    /// own or one it joined) or, for singletons, for a release. Dropping the
    /// future abandons the wait without cancelling a shared start.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownSpecKey`] if the key is not registered
    /// - [`Error::StickyBusy`] if the stateful binding for `routing_key` is saturated
    /// - [`Error::NoCapacity`] if the pool was stopped while waiting
    /// - the lifecycle's error if this caller led a start that failed
    #[tracing::instrument(skip(self), fields(spec_key = %spec_key))]
    pub async fn acquire(&self, spec_key: &SpecKey, routing_key: &str) -> Result<Arc<Instance>> {
        self.acquire_with(spec_key, routing_key, true).await
    }

    /// Like [`acquire`](Self::acquire) but never starts or waits.
    ///
    /// Fails with [`Error::NoReadyInstance`] when no existing instance can
    /// take the call.
    #[tracing::instrument(skip(self), fields(spec_key = %spec_key))]
    pub async fn acquire_ready(
        &self,
        spec_key: &SpecKey,
        routing_key: &str,
    ) -> Result<Arc<Instance>> {
        self.acquire_with(spec_key, routing_key, false).await
    }

    async fn acquire_with(
        &self,
        spec_key: &SpecKey,
        routing_key: &str,
        allow_start: bool,
    ) -> Result<Arc<Instance>> {
        let started = Instant::now();
        let result = self.place_or_start(spec_key, routing_key, allow_start).await;
        let outcome = match &result {
            Ok((_, outcome)) => *outcome,
            Err(_) => WaitOutcome::Failed,
        };
        self.inner
            .metrics
            .observe_pool_wait(spec_key, started.elapsed(), outcome);

        let (instance, _) = result?;
        tracing::debug!(instance_id = %instance.id(), ?outcome, "Acquired instance");
        Ok(instance)
    }

    async fn place_or_start(
        &self,
        spec_key: &SpecKey,
        routing_key: &str,
        allow_start: bool,
    ) -> Result<(Arc<Instance>, WaitOutcome)> {
        enum Next<'a> {
            Wait(tokio::sync::futures::Notified<'a>),
            Start(Ticket),
        }

        let pool = self.pool(spec_key)?;
        let generation = pool.generation();
        let mut outcome = WaitOutcome::Immediate;

        loop {
            let next = {
                let mut st = pool.state.lock();
                if st.retired {
                    return Err(Error::UnknownSpecKey(spec_key.clone()));
                }
                if st.generation != generation {
                    return Err(Error::NoCapacity(spec_key.clone()));
                }
                match strategy::place(&mut st, spec_key, routing_key)? {
                    Placement::Reserved(instance) => return Ok((instance, outcome)),
                    _ if !allow_start => return Err(Error::NoReadyInstance(spec_key.clone())),
                    Placement::Wait => Next::Wait(pool.changed.notified()),
                    Placement::Start => {
                        Next::Start(Ticket::join_or_lead(&self.inner, &pool, &mut st))
                    }
                }
            };

            match next {
                Next::Wait(notified) => {
                    notified.await;
                    outcome = WaitOutcome::Waited;
                }
                Next::Start(ticket) => {
                    if ticket.wait(&pool).await? == AttemptOutcome::Started {
                        outcome = WaitOutcome::Started;
                    }
                }
            }
        }
    }

    /// Returns one reserved slot.
    ///
    /// The busy count never drops below zero, so a stray double release is
    /// harmless. The instance goes back to Ready when nothing is in flight.
    pub fn release(&self, instance: &Instance) {
        let pool = self.inner.pools.read().get(instance.spec_key()).cloned();
        let Some(pool) = pool else {
            instance.release_slot();
            return;
        };

        {
            let mut st = pool.state.lock();
            instance.release_slot();
            let sticky_key = instance.sticky_key();
            if let Some(binding) = st.sticky.get_mut(&sticky_key) {
                if std::ptr::eq(Arc::as_ptr(&binding.instance), instance) {
                    binding.last_access = Instant::now();
                }
            }
        }
        pool.changed.notify_waiters();
    }

    /// Brings the pool up to at least `n` instances.
    ///
    /// Starts run one after another and this call waits for all of them.
    /// Singleton pools are capped at one. Each start runs in its own task,
    /// so a panicking lifecycle surfaces as [`Error::StartPanicked`] and
    /// leaves the pool's start accounting intact for the next call.
    /// Failures are aggregated into one error.
    #[tracing::instrument(skip(self), fields(spec_key = %spec_key))]
    pub async fn set_desired_min_ready(&self, spec_key: &SpecKey, n: usize) -> Result<()> {
        let pool = self.pool(spec_key)?;
        let (needed, generation, spec) = {
            let mut st = pool.state.lock();
            if st.retired {
                return Err(Error::UnknownSpecKey(spec_key.clone()));
            }
            let target = if st.spec.strategy == Strategy::Singleton {
                n.min(1)
            } else {
                n
            };
            st.desired_min_ready = target;
            let have = st.instances.len() + st.starting + usize::from(st.pending.is_some());
            (target.saturating_sub(have), st.generation, st.spec.clone())
        };
        if needed == 0 {
            return Ok(());
        }
        tracing::info!(needed, "Starting instances to reach min ready");

        let mut errors = Vec::new();
        for attempt in 1..=needed {
            if pool.generation() != generation {
                errors.push((
                    format!("start {}", attempt),
                    Error::NoCapacity(spec_key.clone()),
                ));
                break;
            }
            let guard = StartingGuard::new(Arc::clone(&pool));
            let task = tokio::spawn(start_gate::start_for_min_ready(
                Arc::clone(&self.inner),
                Arc::clone(&pool),
                spec.clone(),
                generation,
                guard,
            ));
            if let Err(e) = start_gate::join_start(task).await {
                errors.push((format!("start {}", attempt), e));
            }
        }
        aggregate(errors, Error::MinReady)
    }

    /// Stops every instance of a spec and supersedes its in-flight starts.
    ///
    /// Acquisitions waiting on the pool fail with [`Error::NoCapacity`].
    /// The pool stays registered and serves new acquisitions afterwards.
    #[tracing::instrument(skip(self), fields(spec_key = %spec_key))]
    pub async fn stop_spec(&self, spec_key: &SpecKey, reason: &str) -> Result<()> {
        let pool = self.pool(spec_key)?;
        let drained = self.inner.supersede(&pool);
        tracing::info!(instances = drained.len(), "Stopping spec");

        let mut errors = Vec::new();
        for instance in drained {
            if let Err(e) = self.inner.stop_instance(&instance, reason).await {
                errors.push((instance.id().to_string(), e));
            }
        }
        self.inner.metrics.set_active_instances(spec_key, 0);
        aggregate(errors, Error::Lifecycle)
    }

    /// Shuts the scheduler down.
    ///
    /// Stops both sweeps, cancels every start in flight, stops every
    /// instance and forgets every pool. Stop failures are logged. The
    /// scheduler cannot start instances afterwards.
    #[tracing::instrument(skip(self))]
    pub async fn stop_all(&self) {
        self.stop_idle_manager();
        self.stop_ping_manager();
        self.inner.shutdown.cancel();

        let pools: Vec<Arc<Pool>> = self.inner.pools.write().drain().map(|(_, p)| p).collect();
        let stops = pools.iter().flat_map(|pool| {
            self.inner.metrics.set_active_instances(&pool.spec_key, 0);
            self.inner.supersede(pool)
        });
        let stops: Vec<_> = stops
            .map(|instance| async move {
                let _ = self.inner.stop_instance(&instance, "shutdown").await;
            })
            .collect();
        tracing::info!(pools = pools.len(), instances = stops.len(), "Stopping all instances");
        join_all(stops).await;
    }

    /// Snapshot of every pool, sorted by spec key.
    pub fn get_pool_status(&self) -> Vec<PoolInfo> {
        let mut infos: Vec<PoolInfo> = self
            .inner
            .pools_snapshot()
            .iter()
            .map(|pool| pool.info())
            .collect();
        infos.sort_by(|a, b| a.spec_key.cmp(&b.spec_key));
        infos
    }
}
