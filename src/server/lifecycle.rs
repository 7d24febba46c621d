use crate::config::{ServerSpec, SpecKey};
use crate::error::{Error, Result};
use crate::server::process::ServerProcess;
use crate::server::{Instance, InstanceState};
use crate::transport::{Conn, JsonRpcNotification, JsonRpcRequest, StdioConn};
use async_trait::async_trait;
use futures_lite::io::{AsyncBufReadExt, BufReader};
use futures_lite::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Starts and stops worker instances on behalf of the scheduler.
///
/// `start_instance` must return an instance that is ready to serve, or an
/// error. It should abandon the start when `cancel` fires. The token belongs
/// to the scheduler's start coordinator, not to any single caller, so it only
/// fires on scheduler shutdown.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    async fn start_instance(
        &self,
        cancel: CancellationToken,
        spec_key: &SpecKey,
        spec: &ServerSpec,
    ) -> Result<Arc<Instance>>;

    async fn stop_instance(&self, instance: &Instance, reason: &str) -> Result<()>;
}

/// Lifecycle that runs each instance as a stdio child process.
///
/// A start spawns the command, attaches a [`StdioConn`] to its pipes and
/// performs the MCP `initialize` handshake. A stop closes the connection and
/// kills the child.
pub struct ProcessLifecycle {
    start_timeout: Duration,
    stop_timeout: Duration,
    processes: Mutex<HashMap<String, ServerProcess>>,
}

impl ProcessLifecycle {
    pub fn new(start_timeout: Duration, stop_timeout: Duration) -> Self {
        Self {
            start_timeout,
            stop_timeout,
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of child processes currently owned.
    pub fn running(&self) -> usize {
        self.processes.lock().len()
    }

    async fn launch(&self, spec_key: &SpecKey, spec: &ServerSpec) -> Result<Arc<Instance>> {
        let instance = Instance::new(spec_key.clone(), spec.clone());
        enter(&instance, InstanceState::Starting);
        let mut process = ServerProcess::new(spec);
        process.start()?;

        let stdin = process.take_stdin()?;
        let stdout = process.take_stdout()?;
        if let Ok(stderr) = process.take_stderr() {
            let server = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!(server = %server, "stderr: {}", line);
                }
            });
        }

        let conn = Arc::new(StdioConn::new(spec.name.clone(), stdin, stdout));
        let instance = instance.with_conn(Arc::clone(&conn) as Arc<dyn Conn>);
        enter(&instance, InstanceState::Initializing);

        enter(&instance, InstanceState::Handshaking);
        let init = JsonRpcRequest::initialize(Uuid::new_v4().to_string(), &spec.protocol_version);
        if let Err(e) = conn.send_request(init).await {
            let _ = conn.close().await;
            return Err(Error::Lifecycle(format!(
                "initialize handshake with {} failed: {}",
                spec.name, e
            )));
        }
        conn.send_notification(JsonRpcNotification::initialized())
            .await?;

        enter(&instance, InstanceState::Ready);
        tracing::info!(
            server = %spec.name,
            instance_id = %instance.id(),
            pid = ?process.pid(),
            "Instance ready"
        );
        self.processes
            .lock()
            .insert(instance.id().to_string(), process);
        Ok(Arc::new(instance))
    }
}

fn enter(instance: &Instance, state: InstanceState) {
    instance.set_state(state);
    tracing::debug!(instance_id = %instance.id(), state = %state, "Instance state changed");
}

#[async_trait]
impl Lifecycle for ProcessLifecycle {
    #[tracing::instrument(skip(self, cancel, spec), fields(server = %spec.name))]
    async fn start_instance(
        &self,
        cancel: CancellationToken,
        spec_key: &SpecKey,
        spec: &ServerSpec,
    ) -> Result<Arc<Instance>> {
        tokio::select! {
            _ = cancel.cancelled() => {
                Err(Error::Cancelled(format!("start of {} cancelled", spec.name)))
            }
            result = tokio::time::timeout(self.start_timeout, self.launch(spec_key, spec)) => {
                result.map_err(|_| {
                    Error::Timeout(format!(
                        "{} did not become ready within {:?}",
                        spec.name, self.start_timeout
                    ))
                })?
            }
        }
    }

    #[tracing::instrument(skip(self, instance), fields(instance_id = %instance.id()))]
    async fn stop_instance(&self, instance: &Instance, reason: &str) -> Result<()> {
        if let Some(conn) = instance.conn() {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Closing connection failed");
            }
        }

        let process = self.processes.lock().remove(instance.id());
        let Some(mut process) = process else {
            tracing::debug!("No process owned for instance");
            return Ok(());
        };
        process.stop(self.stop_timeout).await?;
        tracing::info!(server = %process.name(), %reason, "Instance stopped");
        Ok(())
    }
}
