//! Scheduler observation hooks.
//!
//! The scheduler reports what it does through [`Metrics`]; exporting the
//! numbers anywhere is left to the implementation. [`NoopMetrics`] is used
//! when none is configured.
use crate::config::SpecKey;
use std::time::Duration;

/// How an acquisition obtained (or failed to obtain) an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitOutcome {
    /// An existing instance had capacity.
    Immediate,
    /// A new instance was started for the caller.
    Started,
    /// The caller waited on a saturated singleton.
    Waited,
    /// The acquisition returned an error.
    Failed,
}

pub trait Metrics: Send + Sync {
    /// A start attempt finished.
    fn observe_instance_start(&self, spec_key: &SpecKey, duration: Duration, success: bool);

    /// An instance was stopped.
    fn observe_instance_stop(&self, spec_key: &SpecKey, success: bool);

    /// Number of instances currently registered in a pool.
    fn set_active_instances(&self, spec_key: &SpecKey, count: usize);

    /// Time spent inside an acquisition.
    fn observe_pool_wait(&self, spec_key: &SpecKey, duration: Duration, outcome: WaitOutcome);

    /// A routed call completed.
    fn observe_route(&self, spec_key: &SpecKey, duration: Duration, success: bool);
}

/// Discards every observation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn observe_instance_start(&self, _: &SpecKey, _: Duration, _: bool) {}
    fn observe_instance_stop(&self, _: &SpecKey, _: bool) {}
    fn set_active_instances(&self, _: &SpecKey, _: usize) {}
    fn observe_pool_wait(&self, _: &SpecKey, _: Duration, _: WaitOutcome) {}
    fn observe_route(&self, _: &SpecKey, _: Duration, _: bool) {}
}
