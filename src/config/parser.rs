use crate::config::spec::{
    DEFAULT_MAX_CONCURRENT, DEFAULT_PROTOCOL_VERSION, DEFAULT_SESSION_TTL_SECONDS,
};
use crate::config::{ServerSpec, SpecKey, Strategy};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Timers and timeouts for the daemon's background work.
///
/// All fields are optional in the catalog file; omitted values fall back to
/// the defaults below.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    /// Period of the idle and stale-binding sweep.
    pub idle_check_seconds: u64,
    /// Period of the health-probe sweep; 0 disables probing.
    pub ping_interval_seconds: u64,
    /// Deadline for a single health probe.
    pub probe_timeout_seconds: u64,
    /// Deadline for spawning and handshaking one instance.
    pub start_timeout_seconds: u64,
    /// Deadline for stopping one instance.
    pub stop_timeout_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            idle_check_seconds: 1,
            ping_interval_seconds: 30,
            probe_timeout_seconds: 5,
            start_timeout_seconds: 30,
            stop_timeout_seconds: 10,
        }
    }
}

impl RuntimeConfig {
    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_seconds.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_seconds)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_seconds)
    }
}

/// One server entry as written in the catalog file.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawServerSpec {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    cwd: String,
    #[serde(default)]
    max_concurrent: usize,
    #[serde(default)]
    idle_seconds: u64,
    #[serde(default)]
    min_ready: usize,
    #[serde(default)]
    strategy: Strategy,
    #[serde(default, rename = "sessionTTLSeconds")]
    session_ttl_seconds: Option<u64>,
    #[serde(default)]
    protocol_version: Option<String>,
}

impl RawServerSpec {
    fn normalize(self, name: &str) -> ServerSpec {
        let session_ttl_seconds = match (self.session_ttl_seconds, self.strategy) {
            (Some(ttl), _) => ttl,
            (None, Strategy::Stateful) => DEFAULT_SESSION_TTL_SECONDS,
            (None, _) => 0,
        };
        ServerSpec {
            name: name.to_string(),
            command: self.command,
            args: self.args,
            env: self.env,
            cwd: self.cwd,
            max_concurrent: if self.max_concurrent == 0 {
                DEFAULT_MAX_CONCURRENT
            } else {
                self.max_concurrent
            },
            idle_seconds: self.idle_seconds,
            min_ready: self.min_ready,
            strategy: self.strategy,
            session_ttl_seconds,
            protocol_version: self
                .protocol_version
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_PROTOCOL_VERSION.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, RawServerSpec>,
    #[serde(default)]
    runtime: RuntimeConfig,
}

impl From<RawConfig> for Config {
    fn from(raw: RawConfig) -> Self {
        let mcp_servers = raw
            .mcp_servers
            .into_iter()
            .map(|(name, spec)| {
                let spec = spec.normalize(&name);
                (name, spec)
            })
            .collect();
        Self {
            mcp_servers,
            runtime: raw.runtime,
        }
    }
}

/// The server catalog plus runtime tunables.
///
/// # JSON Schema
///
/// ```json
/// {
///   "mcpServers": {
///     "fetch": {
///       "command": "uvx",
///       "args": ["mcp-server-fetch"],
///       "maxConcurrent": 4,
///       "idleSeconds": 60
///     },
///     "memory": {
///       "command": "npx",
///       "args": ["-y", "@modelcontextprotocol/server-memory"],
///       "strategy": "stateful",
///       "sessionTTLSeconds": 600
///     }
///   },
///   "runtime": { "pingIntervalSeconds": 15 }
/// }
/// ```
///
/// The same document may be written as YAML; files ending in `.yaml` or
/// `.yml` are read with the YAML parser.
///
/// # Examples
///
/// ```
/// use mcp_fleet::config::{Config, Strategy};
///
/// let config = Config::parse_from_str(r#"{
///     "mcpServers": {
///         "memory": { "command": "npx", "strategy": "stateful" }
///     }
/// }"#).unwrap();
///
/// let memory = &config.mcp_servers["memory"];
/// assert_eq!(memory.strategy, Strategy::Stateful);
/// assert_eq!(memory.session_ttl_seconds, 300);
/// ```
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Config {
    /// Normalized server specs by catalog name.
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, ServerSpec>,
    /// Background timers.
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Loads a configuration from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not parse.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read config file: {}", e)))?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::parse_from_yaml_str(&content),
            _ => Self::parse_from_str(&content),
        }
    }

    /// Parses a configuration from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str::<RawConfig>(content)
            .map(Config::from)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON config: {}", e)))
    }

    /// Parses a configuration from a YAML string.
    pub fn parse_from_yaml_str(content: &str) -> Result<Self> {
        serde_yaml::from_str::<RawConfig>(content)
            .map(Config::from)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML config: {}", e)))
    }

    /// Builds the spec registry keyed by content fingerprint.
    ///
    /// Servers whose runtime content is identical collapse to a single
    /// entry; the alphabetically first name is kept.
    pub fn registry(&self) -> HashMap<SpecKey, ServerSpec> {
        let mut names: Vec<&String> = self.mcp_servers.keys().collect();
        names.sort();

        let mut registry: HashMap<SpecKey, ServerSpec> = HashMap::with_capacity(names.len());
        for name in names {
            let spec = &self.mcp_servers[name];
            let key = SpecKey::of(spec);
            if let Some(existing) = registry.get(&key) {
                tracing::debug!(
                    server = %name,
                    shares_with = %existing.name,
                    spec_key = %key,
                    "Server shares runtime identity with another catalog entry"
                );
                continue;
            }
            registry.insert(key, spec.clone());
        }
        registry
    }
}
