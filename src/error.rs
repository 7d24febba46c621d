/// Error handling module for MCP Fleet.
///
/// This module defines the error types used throughout the library.
/// The scheduler-facing variants form the acquisition taxonomy that
/// routers and operators match on; the remaining variants describe
/// configuration, process and transport failures.
///
/// # Example
///
/// ```
/// use mcp_fleet::error::{Error, Result};
/// use mcp_fleet::server::Instance;
/// use std::sync::Arc;
///
/// fn handle_acquire(result: Result<Arc<Instance>>) {
///     match result {
///         Ok(instance) => println!("Acquired {}", instance.id()),
///         Err(Error::StickyBusy { routing_key, .. }) => println!("Session '{}' is busy", routing_key),
///         Err(Error::NoCapacity(key)) => println!("No capacity for {}, retry later", key),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use crate::config::SpecKey;
use thiserror::Error;

/// Errors that can occur in the mcp-fleet library.
#[derive(Error, Debug)]
pub enum Error {
    /// The spec key is not present in the spec registry.
    ///
    /// This is a caller error and is never retried by the scheduler.
    #[error("Unknown spec key: {0}")]
    UnknownSpecKey(SpecKey),

    /// Capacity could not be obtained for the spec.
    ///
    /// This error occurs when:
    /// - An in-flight start was superseded by `stop_spec` or a catalog removal
    /// - The pool was stopped while the caller was waiting
    ///
    /// It is transient; callers may retry.
    #[error("No capacity available for {0}")]
    NoCapacity(SpecKey),

    /// The instance bound to a routing key is saturated (stateful strategy).
    #[error("Sticky instance for routing key '{routing_key}' is at capacity ({spec_key})")]
    StickyBusy {
        /// Spec the binding belongs to.
        spec_key: SpecKey,
        /// Routing key whose bound instance is saturated.
        routing_key: String,
    },

    /// `acquire_ready` found no existing instance with spare capacity.
    #[error("No ready instance for {0}")]
    NoReadyInstance(SpecKey),

    /// The lifecycle collaborator failed to start or stop an instance.
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// A start attempt panicked inside the lifecycle collaborator.
    #[error("Start attempt panicked: {0}")]
    StartPanicked(String),

    /// The caller's cancellation token fired before the operation finished.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// A health probe failed.
    #[error("Health probe failed: {0}")]
    Probe(String),

    /// One or more steps of a catalog diff application failed.
    #[error("Catalog apply failed: {0}")]
    CatalogApply(String),

    /// One or more starts requested by `set_desired_min_ready` failed.
    #[error("Min-ready start failed: {0}")]
    MinReady(String),

    /// Failed to parse configuration from a file or string.
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(String),

    /// Configuration parsed but contains invalid values.
    ///
    /// This error occurs when:
    /// - A server has an empty command
    /// - `maxConcurrent` is zero
    /// - A singleton server asks for more than one ready instance
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Error when spawning, killing or waiting on a server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// The server answered a JSON-RPC request with an error object.
    #[error("JSON-RPC error: {0}")]
    JsonRpc(String),

    /// The transport failed to initialize or was closed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server did not respond, or the response was malformed.
    #[error("Communication error: {0}")]
    Communication(String),

    /// Operation timed out.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Error in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

impl Error {
    /// Returns true for errors a router may retry after a short delay.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NoCapacity(_) | Error::Timeout(_))
    }
}

/// Result type for mcp-fleet operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Folds a list of labelled failures into one error.
///
/// A single failure is returned unchanged; several are joined into one
/// message and wrapped with `wrap`.
pub(crate) fn aggregate<L: std::fmt::Display>(
    mut errors: Vec<(L, Error)>,
    wrap: fn(String) -> Error,
) -> Result<()> {
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0).1),
        _ => {
            let msg = errors
                .iter()
                .map(|(label, e)| format!("{}: {}", label, e))
                .collect::<Vec<_>>()
                .join("; ");
            Err(wrap(msg))
        }
    }
}
