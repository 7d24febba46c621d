use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Default per-instance concurrency when a catalog entry omits it.
pub const DEFAULT_MAX_CONCURRENT: usize = 1;
/// Default sticky-binding TTL applied to stateful servers that omit it.
pub const DEFAULT_SESSION_TTL_SECONDS: u64 = 300;
/// MCP protocol version sent during the initialize handshake.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2025-11-25";

/// How a pool places calls onto its instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Least-loaded selection with round-robin tie-break; idle instances are reaped.
    #[default]
    Stateless,
    /// Routing keys are bound to one instance each.
    Stateful,
    /// Exactly one instance; callers wait for it when it is saturated.
    Singleton,
    /// Stateless selection, never idle-reaped.
    Persistent,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Stateless => "stateless",
            Strategy::Stateful => "stateful",
            Strategy::Singleton => "singleton",
            Strategy::Persistent => "persistent",
        };
        f.write_str(name)
    }
}

/// Launch and scheduling parameters for one MCP server.
///
/// A spec is immutable once registered with the scheduler. Its runtime
/// identity is the [`SpecKey`](crate::config::SpecKey) computed from
/// `command`, `args`, `env` and `cwd`; `name` and the scheduling fields do
/// not take part in it.
///
/// # Examples
///
/// ```
/// use mcp_fleet::config::{ServerSpec, Strategy};
///
/// let spec = ServerSpec {
///     max_concurrent: 4,
///     strategy: Strategy::Stateful,
///     session_ttl_seconds: 600,
///     ..ServerSpec::new("memory", "npx")
/// };
/// assert_eq!(spec.command, "npx");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSpec {
    /// Logical name from the catalog.
    pub name: String,
    /// Command to execute.
    pub command: String,
    /// Command-line arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory; empty means inherit.
    #[serde(default)]
    pub cwd: String,
    /// Concurrent calls one instance may serve.
    pub max_concurrent: usize,
    /// Idle grace before an instance becomes reapable.
    #[serde(default)]
    pub idle_seconds: u64,
    /// Ready-instance floor the idle reaper must respect.
    #[serde(default)]
    pub min_ready: usize,
    /// Placement strategy.
    #[serde(default)]
    pub strategy: Strategy,
    /// Sticky-binding expiry; 0 never expires.
    #[serde(default, rename = "sessionTTLSeconds")]
    pub session_ttl_seconds: u64,
    /// Protocol version offered during the handshake.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_protocol_version() -> String {
    DEFAULT_PROTOCOL_VERSION.to_string()
}

impl ServerSpec {
    /// Creates a stateless spec with default scheduling parameters.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: String::new(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            idle_seconds: 0,
            min_ready: 0,
            strategy: Strategy::default(),
            session_ttl_seconds: 0,
            protocol_version: default_protocol_version(),
        }
    }

    /// Idle grace as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_seconds)
    }

    /// Sticky-binding TTL, or `None` when bindings never expire.
    pub fn session_ttl(&self) -> Option<Duration> {
        (self.session_ttl_seconds > 0).then(|| Duration::from_secs(self.session_ttl_seconds))
    }

    /// Capacity per instance, never below one.
    pub fn capacity(&self) -> usize {
        self.max_concurrent.max(1)
    }
}
