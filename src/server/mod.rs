/// Worker instances and the collaborators that manage them.
///
/// The scheduler never spawns processes itself. It asks a [`Lifecycle`] to
/// start and stop [`Instance`]s and a [`HealthProbe`] to check them. The
/// process-backed implementations live here too.
///
/// # Components
///
/// * `instance` - The running instance handle and its runtime state
/// * `lifecycle` - The `Lifecycle` seam and the stdio process implementation
/// * `monitor` - The `HealthProbe` seam and the JSON-RPC ping probe
/// * `process` - Child process spawning and teardown
///
/// # Examples
///
/// ```no_run
/// use mcp_fleet::config::{ServerSpec, SpecKey};
/// use mcp_fleet::server::{Lifecycle, ProcessLifecycle};
/// use std::time::Duration;
/// use tokio_util::sync::CancellationToken;
///
/// # async fn run() -> mcp_fleet::error::Result<()> {
/// let lifecycle = ProcessLifecycle::new(Duration::from_secs(30), Duration::from_secs(10));
/// let spec = ServerSpec::new("fetch", "uvx");
/// let instance = lifecycle
///     .start_instance(CancellationToken::new(), &SpecKey::of(&spec), &spec)
///     .await?;
/// lifecycle.stop_instance(&instance, "done").await?;
/// # Ok(())
/// # }
/// ```
mod instance;
pub mod lifecycle;
pub mod monitor;
mod process;

pub use instance::{CallStats, Instance, InstanceState};
pub use lifecycle::{Lifecycle, ProcessLifecycle};
pub use monitor::{HealthProbe, RpcProbe};
pub use process::ServerProcess;
