//! Singleflight start coordination.
//!
//! A pool has at most one coordinated start in flight. The first acquirer
//! that needs a new instance becomes the leader: it spawns the start as its
//! own task and awaits the task's handle. Later acquirers follow by
//! subscribing to the attempt's outcome. The start runs under the
//! scheduler's shutdown token, so a caller that gives up (drops its acquire
//! future) never cancels a start other callers are waiting on.
//!
//! Outcomes:
//! - started: the instance is registered and everyone competes for it
//! - failed: the leader gets the error, followers try again in a new group
//! - superseded: the pool was stopped meanwhile; the instance is stopped and
//!   everyone gets `NoCapacity`
use super::Inner;
use super::pool::{Pool, PoolState, StartingGuard};
use crate::config::ServerSpec;
use crate::error::{Error, Result};
use crate::server::{Instance, InstanceState};
use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static NEXT_ATTEMPT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AttemptOutcome {
    Started,
    Failed,
    Superseded,
}

/// The in-flight coordinated start of one pool.
pub(crate) struct StartAttempt {
    id: u64,
    outcome: watch::Sender<Option<AttemptOutcome>>,
}

impl StartAttempt {
    /// Publishes the outcome to every follower.
    pub(crate) fn resolve(self, outcome: AttemptOutcome) {
        let _ = self.outcome.send(Some(outcome));
    }
}

impl PoolState {
    fn take_pending(&mut self, id: u64) -> Option<StartAttempt> {
        if self.pending.as_ref().is_some_and(|attempt| attempt.id == id) {
            self.pending.take()
        } else {
            None
        }
    }
}

/// A caller's stake in a coordinated start.
pub(crate) enum Ticket {
    Leader(JoinHandle<Result<()>>),
    Follower(watch::Receiver<Option<AttemptOutcome>>),
}

impl Ticket {
    /// Joins the pool's pending start or begins a new one. Runs under the
    /// pool lock.
    pub(crate) fn join_or_lead(inner: &Arc<Inner>, pool: &Arc<Pool>, st: &mut PoolState) -> Self {
        if let Some(attempt) = &st.pending {
            return Ticket::Follower(attempt.outcome.subscribe());
        }

        let id = NEXT_ATTEMPT_ID.fetch_add(1, Ordering::Relaxed);
        let (outcome, _) = watch::channel(None);
        st.pending = Some(StartAttempt { id, outcome });

        let task = run_attempt(
            Arc::clone(inner),
            Arc::clone(pool),
            id,
            st.spec.clone(),
            st.generation,
        );
        Ticket::Leader(tokio::spawn(task))
    }

    /// Waits for the attempt to finish.
    ///
    /// The leader gets its start error back. A follower gets
    /// `Ok(AttemptOutcome::Failed)` and is expected to try again.
    pub(crate) async fn wait(self, pool: &Pool) -> Result<AttemptOutcome> {
        match self {
            Ticket::Leader(handle) => join_start(handle)
                .await
                .map(|()| AttemptOutcome::Started),
            Ticket::Follower(mut rx) => {
                let outcome = rx
                    .wait_for(Option::is_some)
                    .await
                    .map(|outcome| (*outcome).unwrap_or(AttemptOutcome::Failed))
                    .unwrap_or(AttemptOutcome::Failed);
                match outcome {
                    AttemptOutcome::Superseded => Err(Error::NoCapacity(pool.spec_key.clone())),
                    other => Ok(other),
                }
            }
        }
    }
}

/// Clears the pending slot if the start task unwinds before settling.
struct AttemptGuard {
    pool: Arc<Pool>,
    id: u64,
    armed: bool,
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let attempt = self.pool.state.lock().take_pending(self.id);
        if let Some(attempt) = attempt {
            attempt.resolve(AttemptOutcome::Failed);
        }
        self.pool.changed.notify_waiters();
    }
}

async fn run_attempt(
    inner: Arc<Inner>,
    pool: Arc<Pool>,
    id: u64,
    spec: ServerSpec,
    generation: u64,
) -> Result<()> {
    let mut guard = AttemptGuard {
        pool: Arc::clone(&pool),
        id,
        armed: true,
    };
    let spec_key = &pool.spec_key;

    tracing::debug!(spec_key = %spec_key, server = %spec.name, attempt = id, "Starting instance");
    let started = Instant::now();
    let result = inner
        .lifecycle
        .start_instance(inner.shutdown.child_token(), spec_key, &spec)
        .await;
    inner
        .metrics
        .observe_instance_start(spec_key, started.elapsed(), result.is_ok());
    guard.armed = false;

    let instance = match result {
        Ok(instance) => instance,
        Err(e) => {
            let attempt = pool.state.lock().take_pending(id);
            if let Some(attempt) = attempt {
                attempt.resolve(AttemptOutcome::Failed);
            }
            pool.changed.notify_waiters();
            tracing::warn!(spec_key = %spec_key, server = %spec.name, error = %e, "Instance start failed");
            return Err(e);
        }
    };

    let (admitted, attempt) = {
        let mut st = pool.state.lock();
        let attempt = st.take_pending(id);
        (st.admit(instance, generation), attempt)
    };
    if let Some(attempt) = attempt {
        attempt.resolve(match admitted {
            Ok(_) => AttemptOutcome::Started,
            Err(_) => AttemptOutcome::Superseded,
        });
    }
    settle(&inner, &pool, &spec, admitted).await
}

/// Starts one instance for `set_desired_min_ready`, outside the
/// coordinator. `starting` stays counted until `guard` finishes or drops.
pub(crate) async fn start_for_min_ready(
    inner: Arc<Inner>,
    pool: Arc<Pool>,
    spec: ServerSpec,
    generation: u64,
    guard: StartingGuard,
) -> Result<()> {
    let spec_key = &pool.spec_key;
    let started = Instant::now();
    let result = inner
        .lifecycle
        .start_instance(inner.shutdown.child_token(), spec_key, &spec)
        .await;
    inner
        .metrics
        .observe_instance_start(spec_key, started.elapsed(), result.is_ok());

    let instance = match result {
        Ok(instance) => instance,
        Err(e) => {
            drop(guard);
            tracing::warn!(spec_key = %spec_key, server = %spec.name, error = %e, "Min-ready start failed");
            return Err(e);
        }
    };

    let admitted = {
        let mut st = pool.state.lock();
        guard.finish(&mut st);
        st.admit(instance, generation)
    };
    settle(&inner, &pool, &spec, admitted).await
}

/// Publishes a registration, or stops an instance whose start was
/// superseded.
async fn settle(
    inner: &Inner,
    pool: &Pool,
    spec: &ServerSpec,
    admitted: std::result::Result<usize, Arc<Instance>>,
) -> Result<()> {
    pool.changed.notify_waiters();
    match admitted {
        Ok(count) => {
            inner.metrics.set_active_instances(&pool.spec_key, count);
            tracing::info!(
                spec_key = %pool.spec_key,
                server = %spec.name,
                instances = count,
                "Instance started"
            );
            Ok(())
        }
        Err(instance) => {
            tracing::info!(
                spec_key = %pool.spec_key,
                instance_id = %instance.id(),
                "Start superseded, stopping instance"
            );
            instance.set_state(InstanceState::Draining);
            let _ = inner.stop_instance(&instance, "superseded").await;
            Err(Error::NoCapacity(pool.spec_key.clone()))
        }
    }
}

/// Awaits a spawned start, turning a panic into an error.
pub(crate) async fn join_start(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::StartPanicked(panic_message(e.into_panic()))),
        Err(e) => Err(Error::Cancelled(format!("start task aborted: {}", e))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
