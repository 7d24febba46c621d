use super::pool::Pool;
use super::{Inner, Scheduler};
use crate::config::{CatalogDiff, ServerSpec, SpecKey};
use crate::error::{Error, Result, aggregate};
use crate::server::Instance;
use futures::future::{BoxFuture, FutureExt};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

impl Scheduler {
    /// Applies a reloaded catalog.
    ///
    /// Pools of removed keys leave the pool map together with their registry
    /// entries, so no acquisition can recreate them; they are then superseded
    /// and their instances stopped. The live pools of added, updated and
    /// replaced keys pick up their new spec.
    ///
    /// The application is best effort. Stops are bounded by `cancel`: once
    /// it fires, the stop in progress and the remaining ones finish in a
    /// background task and the call returns [`Error::Cancelled`] among its
    /// errors. Pool entries and the registry are updated either way.
    /// Failures are aggregated into [`Error::CatalogApply`] when there is
    /// more than one.
    #[tracing::instrument(
        skip_all,
        fields(
            added = diff.added_spec_keys.len(),
            removed = diff.removed_spec_keys.len(),
            updated = diff.updated_spec_keys.len(),
            replaced = diff.replaced_spec_keys.len()
        )
    )]
    pub async fn apply_catalog_diff(
        &self,
        cancel: &CancellationToken,
        diff: &CatalogDiff,
        registry: HashMap<SpecKey, ServerSpec>,
    ) -> Result<()> {
        let (removed, refreshed) = {
            let mut pools = self.inner.pools.write();
            let mut specs = self.inner.specs.write();
            let removed: Vec<Arc<Pool>> = diff
                .removed_spec_keys
                .iter()
                .filter_map(|key| pools.remove(key))
                .collect();
            let refreshed: Vec<(Arc<Pool>, ServerSpec)> = diff
                .added_spec_keys
                .iter()
                .chain(&diff.updated_spec_keys)
                .chain(&diff.replaced_spec_keys)
                .filter_map(|key| Some((Arc::clone(pools.get(key)?), registry.get(key)?.clone())))
                .collect();
            *specs = registry;
            (removed, refreshed)
        };

        for (pool, spec) in refreshed {
            tracing::debug!(spec_key = %pool.spec_key, server = %spec.name, "Refreshing pool spec");
            pool.state.lock().spec = spec;
            pool.changed.notify_waiters();
        }

        let mut pending: VecDeque<Arc<Instance>> = VecDeque::new();
        for pool in &removed {
            let drained = self.inner.retire(pool);
            self.inner.metrics.set_active_instances(&pool.spec_key, 0);
            tracing::info!(spec_key = %pool.spec_key, instances = drained.len(), "Removing pool");
            pending.extend(drained);
        }

        let mut errors: Vec<(String, Error)> = Vec::new();
        while let Some(instance) = pending.pop_front() {
            let spec_key = instance.spec_key().to_string();
            let mut stop = stop_owned(Arc::clone(&self.inner), instance);
            let stopped = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = &mut stop => Some(result),
            };
            match stopped {
                Some(Ok(())) => {}
                Some(Err(e)) => errors.push((spec_key, e)),
                None => {
                    errors.push((
                        spec_key,
                        Error::Cancelled(format!(
                            "{} instance(s) left to stop in the background",
                            pending.len() + 1
                        )),
                    ));
                    stop_in_background(Arc::clone(&self.inner), stop, pending.drain(..).collect());
                    break;
                }
            }
        }

        aggregate(errors, Error::CatalogApply)
    }
}

fn stop_owned(inner: Arc<Inner>, instance: Arc<Instance>) -> BoxFuture<'static, Result<()>> {
    async move { inner.stop_instance(&instance, "catalog removal").await }.boxed()
}

/// Finishes the interrupted stop, then stops the rest.
fn stop_in_background(
    inner: Arc<Inner>,
    current: BoxFuture<'static, Result<()>>,
    rest: Vec<Arc<Instance>>,
) {
    tokio::spawn(async move {
        let _ = current.await;
        for instance in rest {
            let _ = inner.stop_instance(&instance, "catalog removal").await;
        }
    });
}
