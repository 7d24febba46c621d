//! Reclamation sweeps and the background managers that run them.
use super::{Inner, Scheduler};
use crate::config::Strategy;
use crate::error::Error;
use crate::server::{Instance, InstanceState};
use futures::future::join_all;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// A periodic background task. Dropping it stops the task.
pub(crate) struct Sweeper {
    token: CancellationToken,
    _handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn<F, Fut>(inner: &Arc<Inner>, name: &'static str, period: Duration, tick: F) -> Self
    where
        F: Fn(Scheduler) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let weak: Weak<Inner> = Arc::downgrade(inner);
        let stop = token.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(sweeper = name, ?period, "Sweeper started");
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        tick(Scheduler { inner }).await;
                    }
                }
            }
            tracing::debug!(sweeper = name, "Sweeper stopped");
        });

        Self {
            token,
            _handle: handle,
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl Scheduler {
    /// Starts the periodic idle sweep: stale bindings first, then idle
    /// instances. A second call while running is a no-op.
    pub fn start_idle_manager(&self, interval: Duration) {
        if interval.is_zero() {
            tracing::warn!("Idle manager not started: zero interval");
            return;
        }
        let mut slot = self.inner.idle_manager.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(Sweeper::spawn(&self.inner, "idle", interval, |scheduler| async move {
            scheduler.reap_stale_bindings();
            scheduler.reap_idle().await;
        }));
    }

    pub fn stop_idle_manager(&self) {
        self.inner.idle_manager.lock().take();
    }

    /// Starts the periodic health-probe sweep. Does nothing without a
    /// configured probe, and a second call while running is a no-op.
    pub fn start_ping_manager(&self, interval: Duration) {
        if self.inner.probe.is_none() || interval.is_zero() {
            tracing::debug!("Ping manager not started: no probe or zero interval");
            return;
        }
        let mut slot = self.inner.ping_manager.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(Sweeper::spawn(&self.inner, "ping", interval, |scheduler| async move {
            scheduler.probe_instances().await;
        }));
    }

    pub fn stop_ping_manager(&self) {
        self.inner.ping_manager.lock().take();
    }

    /// One idle-reap pass over every pool.
    ///
    /// Stops Ready instances idle for at least the spec's idle grace, while
    /// keeping the ready count at or above `max(min_ready, desired_min_ready)`.
    /// Persistent and singleton pools are skipped, as are instances holding
    /// a sticky binding.
    pub async fn reap_idle(&self) {
        let now = Instant::now();
        for pool in self.inner.pools_snapshot() {
            let candidates: Vec<Arc<Instance>> = {
                let st = pool.state.lock();
                if matches!(st.spec.strategy, Strategy::Persistent | Strategy::Singleton) {
                    continue;
                }
                let floor = st.spec.min_ready.max(st.desired_min_ready);
                let grace = st.spec.idle_timeout();
                let mut ready = st.ready_count();

                let mut candidates = Vec::new();
                for instance in &st.instances {
                    if ready <= floor {
                        break;
                    }
                    let Some(since) = instance.idle_since() else {
                        continue;
                    };
                    if !instance.sticky_key().is_empty() {
                        continue;
                    }
                    let idle_for = now.saturating_duration_since(since);
                    if idle_for < grace {
                        continue;
                    }
                    instance.set_state(InstanceState::Draining);
                    tracing::info!(
                        spec_key = %pool.spec_key,
                        instance_id = %instance.id(),
                        ?idle_for,
                        "Idle reap"
                    );
                    candidates.push(Arc::clone(instance));
                    ready -= 1;
                }
                candidates
            };

            for instance in candidates {
                let _ = self.inner.stop_instance(&instance, "idle timeout").await;
                let remaining = pool.state.lock().remove(&instance);
                pool.changed.notify_waiters();
                self.inner
                    .metrics
                    .set_active_instances(&pool.spec_key, remaining);
            }
        }
    }

    /// One stale-binding pass over every stateful pool.
    ///
    /// Bindings not used for the spec's session TTL are dropped and their
    /// instance becomes unbound. A zero TTL keeps bindings forever.
    pub fn reap_stale_bindings(&self) {
        for pool in self.inner.pools_snapshot() {
            let mut st = pool.state.lock();
            if st.spec.strategy != Strategy::Stateful {
                continue;
            }
            let Some(ttl) = st.spec.session_ttl() else {
                continue;
            };
            st.sticky.retain(|routing_key, binding| {
                if binding.last_access.elapsed() < ttl {
                    return true;
                }
                binding.instance.set_sticky_key("");
                tracing::info!(
                    spec_key = %pool.spec_key,
                    routing_key = %routing_key,
                    instance_id = %binding.instance.id(),
                    "Sticky binding expired"
                );
                false
            });
        }
    }

    /// One health-probe pass over every routable instance.
    ///
    /// Probes run concurrently, each bounded by the probe timeout. An
    /// instance that fails is marked Failed, stopped and removed from its
    /// pool whatever its strategy or binding.
    pub async fn probe_instances(&self) {
        let Some(probe) = self.inner.probe.clone() else {
            return;
        };

        let checks: Vec<_> = self
            .inner
            .pools_snapshot()
            .into_iter()
            .flat_map(|pool| {
                let routable: Vec<Arc<Instance>> = pool
                    .state
                    .lock()
                    .instances
                    .iter()
                    .filter(|inst| inst.is_routable())
                    .cloned()
                    .collect();
                routable.into_iter().map(move |inst| (Arc::clone(&pool), inst))
            })
            .collect();

        let timeout = self.inner.probe_timeout;
        let results = join_all(checks.into_iter().map(|(pool, instance)| {
            let probe = Arc::clone(&probe);
            async move {
                let result = tokio::time::timeout(timeout, probe.ping(&instance))
                    .await
                    .unwrap_or_else(|_| {
                        Err(Error::Timeout(format!("ping of {} timed out", instance.id())))
                    });
                (pool, instance, result)
            }
        }))
        .await;

        for (pool, instance, result) in results {
            let Err(e) = result else {
                continue;
            };
            tracing::warn!(
                spec_key = %pool.spec_key,
                instance_id = %instance.id(),
                error = %e,
                "Ping failed"
            );
            {
                let _st = pool.state.lock();
                instance.set_state(InstanceState::Failed);
            }
            let _ = self.inner.stop_instance(&instance, "ping failure").await;
            let remaining = pool.state.lock().remove(&instance);
            pool.changed.notify_waiters();
            self.inner
                .metrics
                .set_active_instances(&pool.spec_key, remaining);
        }
    }
}
