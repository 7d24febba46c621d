//! Per-strategy placement of one acquisition onto a pool.
//!
//! Everything here runs under the pool lock and never awaits. A placement
//! either reserves a slot on an existing instance or tells the caller what
//! to do next: start an instance through the coordinator, or wait for a
//! release.
use super::pool::{PoolState, StickyBinding};
use crate::config::{SpecKey, Strategy};
use crate::error::{Error, Result};
use crate::server::Instance;
use std::sync::Arc;
use tokio::time::Instant;

pub(crate) enum Placement {
    /// A slot was reserved on this instance.
    Reserved(Arc<Instance>),
    /// No instance can take the call; one must be started.
    Start,
    /// The singleton is saturated or not yet up; wait for a release.
    Wait,
}

pub(crate) fn place(st: &mut PoolState, spec_key: &SpecKey, routing_key: &str) -> Result<Placement> {
    match st.spec.strategy {
        Strategy::Stateless | Strategy::Persistent => Ok(place_least_loaded(st, |_| true)),
        Strategy::Stateful => place_sticky(st, spec_key, routing_key),
        Strategy::Singleton => Ok(place_singleton(st)),
    }
}

fn place_least_loaded(st: &mut PoolState, eligible: impl Fn(&Instance) -> bool) -> Placement {
    let capacity = st.spec.capacity();
    match least_loaded(&st.instances, &mut st.cursor, capacity, eligible) {
        Some(instance) if instance.try_reserve(capacity) => Placement::Reserved(instance),
        _ => Placement::Start,
    }
}

fn place_sticky(st: &mut PoolState, spec_key: &SpecKey, routing_key: &str) -> Result<Placement> {
    if routing_key.is_empty() {
        return Ok(place_least_loaded(st, |inst| inst.sticky_key().is_empty()));
    }

    let capacity = st.spec.capacity();
    if let Some(binding) = st.sticky.get_mut(routing_key) {
        if binding.instance.is_routable() {
            if !binding.instance.try_reserve(capacity) {
                return Err(Error::StickyBusy {
                    spec_key: spec_key.clone(),
                    routing_key: routing_key.to_string(),
                });
            }
            binding.last_access = Instant::now();
            return Ok(Placement::Reserved(Arc::clone(&binding.instance)));
        }
        tracing::debug!(
            spec_key = %spec_key,
            routing_key = %routing_key,
            instance_id = %binding.instance.id(),
            "Dropping binding to unroutable instance"
        );
        binding.instance.set_sticky_key("");
        st.sticky.remove(routing_key);
    }

    let placement = place_least_loaded(st, |inst| inst.sticky_key().is_empty());
    if let Placement::Reserved(instance) = &placement {
        instance.set_sticky_key(routing_key);
        st.sticky.insert(
            routing_key.to_string(),
            StickyBinding {
                instance: Arc::clone(instance),
                last_access: Instant::now(),
            },
        );
    }
    Ok(placement)
}

fn place_singleton(st: &mut PoolState) -> Placement {
    let capacity = st.spec.capacity();
    if let Some(instance) = st.instances.iter().find(|inst| inst.is_routable()) {
        if instance.try_reserve(capacity) {
            return Placement::Reserved(Arc::clone(instance));
        }
        return Placement::Wait;
    }
    // An instance on its way in or out still counts as the singleton.
    if !st.instances.is_empty() || st.starting > 0 {
        return Placement::Wait;
    }
    Placement::Start
}

/// Least-loaded eligible instance, ties broken round-robin from `cursor`.
///
/// The scan starts at the cursor and keeps the first instance with the
/// lowest busy count, so equally loaded instances are visited in turn. The
/// cursor moves past the chosen instance.
pub(crate) fn least_loaded(
    instances: &[Arc<Instance>],
    cursor: &mut usize,
    capacity: usize,
    eligible: impl Fn(&Instance) -> bool,
) -> Option<Arc<Instance>> {
    let n = instances.len();
    if n == 0 {
        return None;
    }

    let start = *cursor % n;
    let mut best: Option<(usize, usize)> = None;
    for offset in 0..n {
        let idx = (start + offset) % n;
        let instance = &instances[idx];
        if !instance.has_capacity(capacity) || !eligible(instance) {
            continue;
        }
        let busy = instance.busy_count();
        if best.is_none_or(|(_, lowest)| busy < lowest) {
            best = Some((idx, busy));
        }
    }

    let (idx, _) = best?;
    *cursor = (idx + 1) % n;
    Some(Arc::clone(&instances[idx]))
}
