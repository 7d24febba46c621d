use crate::config::{ServerSpec, SpecKey};
use crate::transport::Conn;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Lifecycle state of a running instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Process is being spawned
    Starting,
    /// Process is up, transport being attached
    Initializing,
    /// MCP initialize exchange in progress
    Handshaking,
    /// Serving, no calls in flight
    Ready,
    /// Serving, at least one call in flight
    Busy,
    /// Being shut down; no new calls
    Draining,
    /// Health probe failed
    Failed,
    /// Shut down
    Stopped,
}

impl InstanceState {
    /// Whether new calls may be placed on an instance in this state.
    pub fn is_routable(self) -> bool {
        matches!(self, InstanceState::Ready | InstanceState::Busy)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InstanceState::Starting => "starting",
            InstanceState::Initializing => "initializing",
            InstanceState::Handshaking => "handshaking",
            InstanceState::Ready => "ready",
            InstanceState::Busy => "busy",
            InstanceState::Draining => "draining",
            InstanceState::Failed => "failed",
            InstanceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Call counters snapshot for one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStats {
    pub total_calls: u64,
    pub failed_calls: u64,
    pub total_duration: Duration,
}

impl CallStats {
    /// Mean call duration, zero when nothing was recorded.
    pub fn average(&self) -> Duration {
        if self.total_calls == 0 {
            return Duration::ZERO;
        }
        self.total_duration / self.total_calls as u32
    }
}

#[derive(Debug)]
struct Runtime {
    state: InstanceState,
    busy_count: usize,
    sticky_key: String,
    last_active: Instant,
}

/// One running worker process serving a single spec.
///
/// Instances are created by a [`Lifecycle`](crate::server::Lifecycle) and
/// shared as `Arc<Instance>` between the pool that owns them and the callers
/// that acquired them. The identity fields never change; the runtime fields
/// (state, busy count, sticky key, last activity) are mutated by the
/// scheduler under the instance's own lock, always after the pool lock when
/// both are held.
pub struct Instance {
    id: String,
    spec_key: SpecKey,
    spec: ServerSpec,
    conn: Option<Arc<dyn Conn>>,
    runtime: Mutex<Runtime>,
    total_calls: AtomicU64,
    failed_calls: AtomicU64,
    total_duration_us: AtomicU64,
}

impl Instance {
    /// Creates a ready instance with a generated id and no connection.
    pub fn new(spec_key: SpecKey, spec: ServerSpec) -> Self {
        let id = format!("{}-{}", spec.name, Uuid::new_v4().simple());
        Self {
            id,
            spec_key,
            spec,
            conn: None,
            runtime: Mutex::new(Runtime {
                state: InstanceState::Ready,
                busy_count: 0,
                sticky_key: String::new(),
                last_active: Instant::now(),
            }),
            total_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
        }
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attaches the connection used to talk to the instance.
    pub fn with_conn(mut self, conn: Arc<dyn Conn>) -> Self {
        self.conn = Some(conn);
        self
    }

    /// Sets the initial state.
    pub fn with_state(self, state: InstanceState) -> Self {
        self.runtime.lock().state = state;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec_key(&self) -> &SpecKey {
        &self.spec_key
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    /// Connection handle, if the lifecycle attached one.
    pub fn conn(&self) -> Option<&Arc<dyn Conn>> {
        self.conn.as_ref()
    }

    pub fn state(&self) -> InstanceState {
        self.runtime.lock().state
    }

    pub fn set_state(&self, state: InstanceState) {
        self.runtime.lock().state = state;
    }

    /// Calls currently in flight.
    pub fn busy_count(&self) -> usize {
        self.runtime.lock().busy_count
    }

    /// Overrides the in-flight count and derives Ready/Busy from it.
    pub fn set_busy_count(&self, busy_count: usize) {
        let mut rt = self.runtime.lock();
        rt.busy_count = busy_count;
        if rt.state.is_routable() {
            rt.state = if busy_count > 0 {
                InstanceState::Busy
            } else {
                InstanceState::Ready
            };
        }
    }

    /// Routing key bound to this instance; empty when unbound.
    pub fn sticky_key(&self) -> String {
        self.runtime.lock().sticky_key.clone()
    }

    pub fn last_active(&self) -> Instant {
        self.runtime.lock().last_active
    }

    pub fn is_routable(&self) -> bool {
        self.state().is_routable()
    }

    /// Records one completed call.
    pub fn record_call(&self, duration: Duration, failed: bool) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed_calls.fetch_add(1, Ordering::Relaxed);
        }
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.total_duration_us.fetch_add(micros, Ordering::Relaxed);
    }

    pub fn call_stats(&self) -> CallStats {
        CallStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            total_duration: Duration::from_micros(self.total_duration_us.load(Ordering::Relaxed)),
        }
    }

    /// Reserves one call slot if the instance is routable and not full.
    pub(crate) fn try_reserve(&self, capacity: usize) -> bool {
        let mut rt = self.runtime.lock();
        if !rt.state.is_routable() || rt.busy_count >= capacity {
            return false;
        }
        rt.busy_count += 1;
        rt.state = InstanceState::Busy;
        rt.last_active = Instant::now();
        true
    }

    /// Returns one call slot. Returns true if the instance became idle.
    pub(crate) fn release_slot(&self) -> bool {
        let mut rt = self.runtime.lock();
        rt.busy_count = rt.busy_count.saturating_sub(1);
        rt.last_active = Instant::now();
        if rt.busy_count == 0 && rt.state == InstanceState::Busy {
            rt.state = InstanceState::Ready;
        }
        rt.busy_count == 0
    }

    /// Routable and below `capacity`.
    pub(crate) fn has_capacity(&self, capacity: usize) -> bool {
        let rt = self.runtime.lock();
        rt.state.is_routable() && rt.busy_count < capacity
    }

    pub(crate) fn set_sticky_key(&self, key: impl Into<String>) {
        self.runtime.lock().sticky_key = key.into();
    }

    /// Ready with nothing in flight, and idle since `Instant`.
    pub(crate) fn idle_since(&self) -> Option<Instant> {
        let rt = self.runtime.lock();
        (rt.state == InstanceState::Ready && rt.busy_count == 0).then_some(rt.last_active)
    }

    /// Snapshot of runtime fields for status reporting.
    pub(crate) fn snapshot(&self) -> (InstanceState, usize, String, Instant) {
        let rt = self.runtime.lock();
        (rt.state, rt.busy_count, rt.sticky_key.clone(), rt.last_active)
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rt = self.runtime.lock();
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("spec_key", &self.spec_key)
            .field("state", &rt.state)
            .field("busy_count", &rt.busy_count)
            .field("sticky_key", &rt.sticky_key)
            .finish()
    }
}
