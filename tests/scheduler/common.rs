#![allow(dead_code)]

use async_trait::async_trait;
use mcp_fleet::config::{ServerSpec, SpecKey, Strategy};
use mcp_fleet::error::{Error, Result};
use mcp_fleet::scheduler::{PoolInfo, Scheduler, SchedulerOptions};
use mcp_fleet::server::{Instance, Lifecycle};
use mcp_fleet::transport::Conn;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// In-memory lifecycle that hands out instances named `{server}-{n}`.
///
/// Starts and stops can be held behind gates. Starts can be made to fail or
/// to panic. Both are counted when they are called.
#[derive(Default)]
pub struct FakeLifecycle {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub fail_next: AtomicUsize,
    pub panic_next: AtomicUsize,
    pub cancelled_starts: AtomicUsize,
    gate: Option<Arc<Semaphore>>,
    stop_gate: Option<Arc<Semaphore>>,
    conn: Option<Arc<dyn Conn>>,
}

impl FakeLifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A lifecycle whose starts block until [`open`](Self::open) is called.
    pub fn gated() -> Arc<Self> {
        Arc::new(Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        })
    }

    /// A lifecycle whose stops block until [`open_stops`](Self::open_stops)
    /// is called.
    pub fn stop_gated() -> Arc<Self> {
        Arc::new(Self {
            stop_gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::default()
        })
    }

    pub fn with_conn(conn: Arc<dyn Conn>) -> Arc<Self> {
        Arc::new(Self {
            conn: Some(conn),
            ..Self::default()
        })
    }

    /// Lets `n` gated starts through.
    pub fn open(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Lets `n` gated stops through.
    pub fn open_stops(&self, n: usize) {
        if let Some(gate) = &self.stop_gate {
            gate.add_permits(n);
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn panic_next(&self, n: usize) {
        self.panic_next.store(n, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl Lifecycle for FakeLifecycle {
    async fn start_instance(
        &self,
        cancel: CancellationToken,
        spec_key: &SpecKey,
        spec: &ServerSpec,
    ) -> Result<Arc<Instance>> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(gate) = &self.gate {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.cancelled_starts.fetch_add(1, Ordering::SeqCst);
                    return Err(Error::Cancelled("start abandoned".to_string()));
                }
                permit = gate.acquire() => {
                    permit
                        .map_err(|e| Error::Lifecycle(e.to_string()))?
                        .forget();
                }
            }
        }

        if take_one(&self.panic_next) {
            panic!("lifecycle exploded");
        }
        if take_one(&self.fail_next) {
            return Err(Error::Lifecycle(format!("{} failed to start", spec.name)));
        }

        let mut instance =
            Instance::new(spec_key.clone(), spec.clone()).with_id(format!("{}-{}", spec.name, n));
        if let Some(conn) = &self.conn {
            instance = instance.with_conn(Arc::clone(conn));
        }
        Ok(Arc::new(instance))
    }

    async fn stop_instance(&self, _instance: &Instance, _reason: &str) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.stop_gate {
            gate.acquire()
                .await
                .map_err(|e| Error::Lifecycle(e.to_string()))?
                .forget();
        }
        Ok(())
    }
}

pub fn spec(name: &str) -> ServerSpec {
    ServerSpec::new(name, format!("./{}", name))
}

pub fn stateful(name: &str, max_concurrent: usize, ttl: u64) -> ServerSpec {
    ServerSpec {
        strategy: Strategy::Stateful,
        max_concurrent,
        session_ttl_seconds: ttl,
        ..spec(name)
    }
}

pub fn registry(specs: &[ServerSpec]) -> HashMap<SpecKey, ServerSpec> {
    specs.iter().map(|s| (SpecKey::of(s), s.clone())).collect()
}

/// A scheduler over `specs` with default options.
pub fn scheduler(lifecycle: Arc<FakeLifecycle>, specs: &[ServerSpec]) -> Scheduler {
    Scheduler::new(lifecycle, registry(specs), SchedulerOptions::default())
}

/// Status of the pool for `key`; panics when the pool does not exist.
pub fn pool_info(scheduler: &Scheduler, key: &SpecKey) -> PoolInfo {
    scheduler
        .get_pool_status()
        .into_iter()
        .find(|info| &info.spec_key == key)
        .expect("pool exists")
}

/// Lets every spawned task run until it blocks.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
